#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};

use timetable_engine::data::{Course, CourseType, Faculty, Room, Snapshot, TimeSlot};
use timetable_engine::provider::OrganizationData;

pub fn course(id: u32, faculty_id: u32, students: &[u32], sessions: u32) -> Course {
    Course {
        id,
        code: format!("CS{id:03}"),
        name: format!("Course {id}"),
        faculty_id,
        student_ids: students.iter().copied().collect(),
        batch_ids: BTreeSet::new(),
        sessions,
        course_type: CourseType::Lecture,
        credits: 3,
        required_features: BTreeSet::new(),
        department_id: 1,
    }
}

pub fn faculty(id: u32) -> Faculty {
    Faculty {
        id,
        department_id: 1,
        max_weekly_load: 20,
        available_slots: BTreeSet::new(),
        preferences: BTreeMap::new(),
    }
}

pub fn room(id: u32, capacity: u32) -> Room {
    Room {
        id,
        capacity,
        features: BTreeSet::new(),
        building_id: 1,
    }
}

pub fn slots(days: u32, periods: u32) -> Vec<TimeSlot> {
    (0..days)
        .flat_map(|day| {
            (0..periods).map(move |period| TimeSlot {
                id: day * periods + period + 1,
                day,
                period,
                start: format!("{:02}:00", 8 + period),
                end: format!("{:02}:00", 9 + period),
            })
        })
        .collect()
}

/// 3 courses, 2 disjoint faculty, 2 rooms, 5 slots, no shared students.
pub fn scenario_a() -> Snapshot {
    Snapshot::new(
        vec![course(1, 10, &[1, 2], 1), course(2, 10, &[3, 4], 1), course(3, 20, &[5, 6], 1)],
        vec![faculty(10), faculty(20)],
        vec![room(1, 30), room(2, 30)],
        slots(1, 5),
        Vec::new(),
    )
}

/// 2 courses taught by one faculty member and a single slot.
pub fn scenario_b() -> Snapshot {
    Snapshot::new(
        vec![course(1, 10, &[1], 1), course(2, 10, &[2], 1)],
        vec![faculty(10)],
        vec![room(1, 30)],
        slots(1, 1),
        Vec::new(),
    )
}

/// A department-sized instance with overlapping cohorts.
pub fn department() -> Snapshot {
    let courses = vec![
        course(1, 10, &[1, 2, 3, 4], 2),
        course(2, 10, &[5, 6, 7], 2),
        course(3, 11, &[1, 2, 8], 1),
        course(4, 11, &[9, 10, 11], 2),
        course(5, 12, &[3, 4, 12], 1),
        course(6, 12, &[13, 14], 2),
        course(7, 13, &[5, 9, 15], 2),
        course(8, 13, &[16, 17], 1),
    ];
    Snapshot::new(
        courses,
        vec![faculty(10), faculty(11), faculty(12), faculty(13)],
        vec![room(100, 10), room(101, 5), room(102, 40)],
        slots(5, 4),
        Vec::new(),
    )
}

pub fn organization(snapshot: &Snapshot, semester: &str) -> OrganizationData {
    let data = snapshot.data().clone();
    OrganizationData {
        semesters: [(semester.to_string(), data.courses)].into_iter().collect(),
        faculty: data.faculty,
        rooms: data.rooms,
        time_slots: data.time_slots,
        students: data.students,
    }
}
