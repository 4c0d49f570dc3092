use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::error::{EngineError, Result};

// Type aliases for clarity
pub type CourseId = u32;
pub type FacultyId = u32;
pub type RoomId = u32;
pub type TimeSlotId = u32;
pub type StudentId = u32;
pub type BatchId = u32;
pub type DepartmentId = u32;
pub type BuildingId = u32;

/// Teaching format of a course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseType {
    Lecture,
    Lab,
    Tutorial,
    Seminar,
}

/// A course to be scheduled. Immutable once a job starts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Course {
    pub id: CourseId,
    pub code: String,
    pub name: String,
    pub faculty_id: FacultyId,
    #[serde(default)]
    pub student_ids: BTreeSet<StudentId>,
    #[serde(default)]
    pub batch_ids: BTreeSet<BatchId>,
    pub sessions: u32,
    pub course_type: CourseType,
    #[serde(default)]
    pub credits: u32,
    #[serde(default)]
    pub required_features: BTreeSet<String>,
    pub department_id: DepartmentId,
}

impl Course {
    /// Listed students only. [`Snapshot::enrollment`] also counts the
    /// rosters of the course's batches.
    pub fn enrollment(&self) -> u32 {
        self.student_ids.len() as u32
    }
}

/// A faculty member with their availability and slot preferences.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Faculty {
    pub id: FacultyId,
    pub department_id: DepartmentId,
    pub max_weekly_load: u32,
    /// Empty means available in every slot.
    #[serde(default)]
    pub available_slots: BTreeSet<TimeSlotId>,
    /// Preference weight in [0, 1] per slot; unlisted slots are neutral.
    #[serde(default)]
    pub preferences: BTreeMap<TimeSlotId, f64>,
}

impl Faculty {
    pub fn is_available(&self, slot: TimeSlotId) -> bool {
        self.available_slots.is_empty() || self.available_slots.contains(&slot)
    }

    pub fn preference(&self, slot: TimeSlotId) -> f64 {
        self.preferences.get(&slot).copied().unwrap_or(0.5).clamp(0.0, 1.0)
    }
}

/// A physical room.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Room {
    pub id: RoomId,
    pub capacity: u32,
    #[serde(default)]
    pub features: BTreeSet<String>,
    #[serde(default)]
    pub building_id: BuildingId,
}

impl Room {
    /// Capacity and feature compatibility for `enrolled` attendees.
    pub fn supports(&self, course: &Course, enrolled: u32) -> bool {
        self.capacity >= enrolled && course.required_features.is_subset(&self.features)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeSlot {
    pub id: TimeSlotId,
    pub day: u32,
    pub period: u32,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub end: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Student {
    pub id: StudentId,
    #[serde(default)]
    pub batch_ids: BTreeSet<BatchId>,
}

/// One required meeting of a course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct SessionKey {
    pub course_id: CourseId,
    pub session: u32,
}

impl SessionKey {
    pub fn new(course_id: CourseId, session: u32) -> Self {
        Self { course_id, session }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.course_id, self.session)
    }
}

/// Where and with whom a session takes place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Placement {
    pub slot: TimeSlotId,
    pub room: RoomId,
    pub faculty: FacultyId,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {} / room {} / faculty {}", self.slot, self.room, self.faculty)
    }
}

/// Flat wire form of one assignment entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledSession {
    pub course_id: CourseId,
    pub session: u32,
    pub slot_id: TimeSlotId,
    pub room_id: RoomId,
    pub faculty_id: FacultyId,
}

/// Mapping (course, session) -> (slot, room, faculty).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "Vec<ScheduledSession>", into = "Vec<ScheduledSession>")]
pub struct Assignment {
    entries: BTreeMap<SessionKey, Placement>,
}

impl Assignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SessionKey) -> Option<&Placement> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: SessionKey, placement: Placement) -> Option<Placement> {
        self.entries.insert(key, placement)
    }

    pub fn remove(&mut self, key: &SessionKey) -> Option<Placement> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionKey, &Placement)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &SessionKey> {
        self.entries.keys()
    }

    /// Absorbs `other`; keys already present here are kept and returned.
    pub fn merge(&mut self, other: Assignment) -> Vec<SessionKey> {
        let mut rejected = Vec::new();
        for (key, placement) in other.entries {
            if self.entries.contains_key(&key) {
                rejected.push(key);
            } else {
                self.entries.insert(key, placement);
            }
        }
        rejected
    }
}

impl From<Vec<ScheduledSession>> for Assignment {
    fn from(sessions: Vec<ScheduledSession>) -> Self {
        let entries = sessions
            .into_iter()
            .map(|s| {
                (
                    SessionKey::new(s.course_id, s.session),
                    Placement {
                        slot: s.slot_id,
                        room: s.room_id,
                        faculty: s.faculty_id,
                    },
                )
            })
            .collect();
        Self { entries }
    }
}

impl From<Assignment> for Vec<ScheduledSession> {
    fn from(assignment: Assignment) -> Self {
        assignment
            .entries
            .into_iter()
            .map(|(k, p)| ScheduledSession {
                course_id: k.course_id,
                session: k.session,
                slot_id: p.slot,
                room_id: p.room,
                faculty_id: p.faculty,
            })
            .collect()
    }
}

impl FromIterator<(SessionKey, Placement)> for Assignment {
    fn from_iter<I: IntoIterator<Item = (SessionKey, Placement)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Describes a soft constraint that was not met in the final schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmetSoftConstraint {
    pub constraint_type: String,
    pub description: String,
}

impl fmt::Display for UnmetSoftConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.constraint_type, self.description)
    }
}

/// A scored schedule handed back to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Solution {
    pub assignment: Assignment,
    pub soft_score: f64,
    pub conflicts: usize,
    pub unscheduled: Vec<SessionKey>,
    pub partial: bool,
    pub unmet_soft_constraints: Vec<UnmetSoftConstraint>,
}

impl Solution {
    /// Complete and conflict-free.
    pub fn is_valid(&self) -> bool {
        self.conflicts == 0 && self.unscheduled.is_empty()
    }
}

/// Serialized shape of a [`Snapshot`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotData {
    pub courses: Vec<Course>,
    pub faculty: Vec<Faculty>,
    pub rooms: Vec<Room>,
    pub time_slots: Vec<TimeSlot>,
    #[serde(default)]
    pub students: Vec<Student>,
}

/// Frozen per-job view of the master data with lookup indexes.
#[derive(Debug, Clone)]
pub struct Snapshot {
    data: SnapshotData,
    course_idx: HashMap<CourseId, usize>,
    faculty_idx: HashMap<FacultyId, usize>,
    room_idx: HashMap<RoomId, usize>,
    slot_idx: HashMap<TimeSlotId, usize>,
    // courses that may not share a slot because of common students or batches
    course_conflicts: HashMap<CourseId, HashSet<CourseId>>,
    student_overlap: HashMap<(CourseId, CourseId), u32>,
    enrollment: HashMap<CourseId, u32>,
}

impl Snapshot {
    pub fn new(
        courses: Vec<Course>,
        faculty: Vec<Faculty>,
        rooms: Vec<Room>,
        time_slots: Vec<TimeSlot>,
        students: Vec<Student>,
    ) -> Self {
        Self::from(SnapshotData {
            courses,
            faculty,
            rooms,
            time_slots,
            students,
        })
    }

    pub fn courses(&self) -> &[Course] {
        &self.data.courses
    }

    pub fn faculty(&self) -> &[Faculty] {
        &self.data.faculty
    }

    pub fn rooms(&self) -> &[Room] {
        &self.data.rooms
    }

    pub fn time_slots(&self) -> &[TimeSlot] {
        &self.data.time_slots
    }

    pub fn students(&self) -> &[Student] {
        &self.data.students
    }

    pub fn data(&self) -> &SnapshotData {
        &self.data
    }

    pub fn course(&self, id: CourseId) -> Option<&Course> {
        self.course_idx.get(&id).map(|&i| &self.data.courses[i])
    }

    pub fn faculty_member(&self, id: FacultyId) -> Option<&Faculty> {
        self.faculty_idx.get(&id).map(|&i| &self.data.faculty[i])
    }

    pub fn room(&self, id: RoomId) -> Option<&Room> {
        self.room_idx.get(&id).map(|&i| &self.data.rooms[i])
    }

    pub fn slot(&self, id: TimeSlotId) -> Option<&TimeSlot> {
        self.slot_idx.get(&id).map(|&i| &self.data.time_slots[i])
    }

    pub fn slot_index(&self, id: TimeSlotId) -> Option<usize> {
        self.slot_idx.get(&id).copied()
    }

    pub fn room_index(&self, id: RoomId) -> Option<usize> {
        self.room_idx.get(&id).copied()
    }

    pub fn faculty_index(&self, id: FacultyId) -> Option<usize> {
        self.faculty_idx.get(&id).copied()
    }

    pub fn day_count(&self) -> usize {
        self.data
            .time_slots
            .iter()
            .map(|s| s.day)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Every required (course, session) in course order.
    pub fn sessions(&self) -> impl Iterator<Item = SessionKey> + '_ {
        self.data
            .courses
            .iter()
            .flat_map(|c| (0..c.sessions).map(move |s| SessionKey::new(c.id, s)))
    }

    pub fn total_sessions(&self) -> usize {
        self.data.courses.iter().map(|c| c.sessions as usize).sum()
    }

    /// True when the two courses cannot meet at the same time.
    /// A course always conflicts with itself.
    pub fn courses_conflict(&self, a: CourseId, b: CourseId) -> bool {
        a == b
            || self
                .course_conflicts
                .get(&a)
                .is_some_and(|set| set.contains(&b))
    }

    pub fn conflicting_courses(&self, id: CourseId) -> impl Iterator<Item = CourseId> + '_ {
        self.course_conflicts.get(&id).into_iter().flatten().copied()
    }

    /// Distinct attendees: listed students plus every rostered student of
    /// the course's batches.
    pub fn enrollment(&self, course: &Course) -> u32 {
        self.enrollment
            .get(&course.id)
            .copied()
            .unwrap_or_else(|| course.enrollment())
    }

    /// Number of shared students (shared batches count once each).
    pub fn student_overlap(&self, a: CourseId, b: CourseId) -> u32 {
        let key = if a < b { (a, b) } else { (b, a) };
        self.student_overlap.get(&key).copied().unwrap_or(0)
    }

    /// Rooms passing the capacity and feature filters for a course.
    pub fn candidate_rooms(&self, course: &Course) -> Vec<RoomId> {
        self.data
            .rooms
            .iter()
            .filter(|r| r.supports(course, self.enrollment(course)))
            .map(|r| r.id)
            .collect()
    }

    /// Static admissibility: room fits the course and the faculty member is available.
    pub fn is_admissible(&self, course: &Course, placement: &Placement) -> bool {
        let Some(room) = self.room(placement.room) else {
            return false;
        };
        if self.slot(placement.slot).is_none() || !room.supports(course, self.enrollment(course)) {
            return false;
        }
        self.faculty_member(placement.faculty)
            .is_some_and(|f| f.is_available(placement.slot))
    }

    /// Rejects structurally broken snapshots before a job starts.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.course_idx.len() != self.data.courses.len() {
            problems.push("duplicate course id".to_string());
        }
        if self.faculty_idx.len() != self.data.faculty.len() {
            problems.push("duplicate faculty id".to_string());
        }
        if self.room_idx.len() != self.data.rooms.len() {
            problems.push("duplicate room id".to_string());
        }
        if self.slot_idx.len() != self.data.time_slots.len() {
            problems.push("duplicate time-slot id".to_string());
        }
        for course in &self.data.courses {
            if course.sessions == 0 {
                problems.push(format!("course {} requires zero sessions", course.id));
            }
            if !self.faculty_idx.contains_key(&course.faculty_id) {
                problems.push(format!(
                    "course {} references unknown faculty {}",
                    course.id, course.faculty_id
                ));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngineError::InvalidInput(problems.join("; ")))
        }
    }
}

impl From<SnapshotData> for Snapshot {
    fn from(data: SnapshotData) -> Self {
        let course_idx = data.courses.iter().enumerate().map(|(i, c)| (c.id, i)).collect();
        let faculty_idx = data.faculty.iter().enumerate().map(|(i, f)| (f.id, i)).collect();
        let room_idx = data.rooms.iter().enumerate().map(|(i, r)| (r.id, i)).collect();
        let slot_idx = data.time_slots.iter().enumerate().map(|(i, s)| (s.id, i)).collect();

        // inverted indexes: student -> courses, batch -> courses
        let mut by_student: HashMap<StudentId, Vec<CourseId>> = HashMap::new();
        let mut by_batch: HashMap<BatchId, Vec<CourseId>> = HashMap::new();
        for course in &data.courses {
            for s in &course.student_ids {
                by_student.entry(*s).or_default().push(course.id);
            }
            for b in &course.batch_ids {
                by_batch.entry(*b).or_default().push(course.id);
            }
        }

        let mut student_overlap: HashMap<(CourseId, CourseId), u32> = HashMap::new();
        for group in by_student.values().chain(by_batch.values()) {
            for (i, &a) in group.iter().enumerate() {
                for &b in &group[i + 1..] {
                    if a == b {
                        continue;
                    }
                    let key = if a < b { (a, b) } else { (b, a) };
                    *student_overlap.entry(key).or_default() += 1;
                }
            }
        }

        let mut course_conflicts: HashMap<CourseId, HashSet<CourseId>> = HashMap::new();
        for &(a, b) in student_overlap.keys() {
            course_conflicts.entry(a).or_default().insert(b);
            course_conflicts.entry(b).or_default().insert(a);
        }

        let mut roster: HashMap<BatchId, Vec<StudentId>> = HashMap::new();
        for student in &data.students {
            for b in &student.batch_ids {
                roster.entry(*b).or_default().push(student.id);
            }
        }
        let enrollment = data
            .courses
            .iter()
            .map(|course| {
                let mut attendees: HashSet<StudentId> = course.student_ids.iter().copied().collect();
                for b in &course.batch_ids {
                    attendees.extend(roster.get(b).into_iter().flatten().copied());
                }
                (course.id, attendees.len() as u32)
            })
            .collect();

        Self {
            data,
            course_idx,
            faculty_idx,
            room_idx,
            slot_idx,
            course_conflicts,
            student_overlap,
            enrollment,
        }
    }
}

impl<'de> Deserialize<'de> for Snapshot {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        SnapshotData::deserialize(deserializer).map(Snapshot::from)
    }
}

impl Serialize for Snapshot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.data.serialize(serializer)
    }
}
