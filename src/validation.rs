//! Hard-constraint checks.
//!
//! [`find_conflicts`] re-validates a whole assignment against the invariants
//! a committed schedule must hold; [`Occupancy`] answers the incremental
//! "may this session go here" question the solvers and the resolver ask.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::data::{Assignment, CourseId, FacultyId, Placement, RoomId, SessionKey, Snapshot, TimeSlotId};

/// A violated hard constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Conflict {
    Faculty {
        faculty: FacultyId,
        slot: TimeSlotId,
        first: SessionKey,
        second: SessionKey,
    },
    Room {
        room: RoomId,
        slot: TimeSlotId,
        first: SessionKey,
        second: SessionKey,
    },
    Student {
        slot: TimeSlotId,
        first: SessionKey,
        second: SessionKey,
    },
    Capacity {
        session: SessionKey,
        room: RoomId,
        enrolled: u32,
        capacity: u32,
    },
    /// Missing room feature, unavailable faculty, or unknown reference.
    Inadmissible { session: SessionKey },
}

impl Conflict {
    /// Sessions involved; the second one is the conventional one to move.
    pub fn sessions(&self) -> Vec<SessionKey> {
        match self {
            Conflict::Faculty { first, second, .. }
            | Conflict::Room { first, second, .. }
            | Conflict::Student { first, second, .. } => vec![*first, *second],
            Conflict::Capacity { session, .. } | Conflict::Inadmissible { session } => vec![*session],
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::Faculty { faculty, slot, first, second } => {
                write!(f, "faculty {faculty} double-booked at slot {slot} ({first}, {second})")
            }
            Conflict::Room { room, slot, first, second } => {
                write!(f, "room {room} double-booked at slot {slot} ({first}, {second})")
            }
            Conflict::Student { slot, first, second } => {
                write!(f, "students double-booked at slot {slot} ({first}, {second})")
            }
            Conflict::Capacity { session, room, enrolled, capacity } => {
                write!(f, "session {session} has {enrolled} students in room {room} of capacity {capacity}")
            }
            Conflict::Inadmissible { session } => write!(f, "session {session} placed in an inadmissible slot/room"),
        }
    }
}

/// All hard-constraint violations in `assignment`.
pub fn find_conflicts(snapshot: &Snapshot, assignment: &Assignment) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    let mut by_slot: HashMap<TimeSlotId, Vec<(SessionKey, Placement)>> = HashMap::new();

    for (key, placement) in assignment.iter() {
        by_slot.entry(placement.slot).or_default().push((*key, *placement));
        let Some(course) = snapshot.course(key.course_id) else {
            conflicts.push(Conflict::Inadmissible { session: *key });
            continue;
        };
        match snapshot.room(placement.room) {
            Some(room) if room.capacity < snapshot.enrollment(course) => conflicts.push(Conflict::Capacity {
                session: *key,
                room: room.id,
                enrolled: snapshot.enrollment(course),
                capacity: room.capacity,
            }),
            _ if !snapshot.is_admissible(course, placement) => {
                conflicts.push(Conflict::Inadmissible { session: *key })
            }
            _ => {}
        }
    }

    let mut slots: Vec<_> = by_slot.into_iter().collect();
    slots.sort_by_key(|(slot, _)| *slot);
    for (slot, sessions) in slots {
        for (i, (a, pa)) in sessions.iter().enumerate() {
            for (b, pb) in &sessions[i + 1..] {
                if pa.faculty == pb.faculty {
                    conflicts.push(Conflict::Faculty {
                        faculty: pa.faculty,
                        slot,
                        first: *a,
                        second: *b,
                    });
                }
                if pa.room == pb.room {
                    conflicts.push(Conflict::Room {
                        room: pa.room,
                        slot,
                        first: *a,
                        second: *b,
                    });
                }
                if snapshot.courses_conflict(a.course_id, b.course_id) {
                    conflicts.push(Conflict::Student {
                        slot,
                        first: *a,
                        second: *b,
                    });
                }
            }
        }
    }
    conflicts
}

pub fn count_conflicts(snapshot: &Snapshot, assignment: &Assignment) -> usize {
    find_conflicts(snapshot, assignment).len()
}

/// Required sessions without a placement.
pub fn unscheduled(snapshot: &Snapshot, assignment: &Assignment) -> Vec<SessionKey> {
    snapshot.sessions().filter(|k| !assignment.contains(k)).collect()
}

/// Booking table over slots.
#[derive(Debug, Clone, Default)]
pub struct Occupancy {
    faculty: HashMap<(FacultyId, TimeSlotId), u32>,
    rooms: HashMap<(RoomId, TimeSlotId), u32>,
    courses: HashMap<TimeSlotId, Vec<CourseId>>,
}

impl Occupancy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_assignment(assignment: &Assignment) -> Self {
        let mut occ = Self::new();
        for (key, placement) in assignment.iter() {
            occ.place(key.course_id, placement);
        }
        occ
    }

    /// Would placing a session of `course_id` here clash with a booking?
    pub fn clashes(&self, snapshot: &Snapshot, course_id: CourseId, p: &Placement) -> bool {
        self.faculty_busy(p.faculty, p.slot)
            || self.room_busy(p.room, p.slot)
            || self
                .courses
                .get(&p.slot)
                .is_some_and(|cs| cs.iter().any(|&c| snapshot.courses_conflict(c, course_id)))
    }

    pub fn faculty_busy(&self, faculty: FacultyId, slot: TimeSlotId) -> bool {
        self.faculty.get(&(faculty, slot)).is_some_and(|&n| n > 0)
    }

    pub fn room_busy(&self, room: RoomId, slot: TimeSlotId) -> bool {
        self.rooms.get(&(room, slot)).is_some_and(|&n| n > 0)
    }

    pub fn place(&mut self, course_id: CourseId, p: &Placement) {
        *self.faculty.entry((p.faculty, p.slot)).or_default() += 1;
        *self.rooms.entry((p.room, p.slot)).or_default() += 1;
        self.courses.entry(p.slot).or_default().push(course_id);
    }

    pub fn remove(&mut self, course_id: CourseId, p: &Placement) {
        if let Some(n) = self.faculty.get_mut(&(p.faculty, p.slot)) {
            *n = n.saturating_sub(1);
        }
        if let Some(n) = self.rooms.get_mut(&(p.room, p.slot)) {
            *n = n.saturating_sub(1);
        }
        if let Some(cs) = self.courses.get_mut(&p.slot) {
            if let Some(pos) = cs.iter().position(|&c| c == course_id) {
                cs.swap_remove(pos);
            }
        }
    }

    /// Sessions booked for a faculty member across all slots.
    pub fn faculty_load(&self, faculty: FacultyId) -> u32 {
        self.faculty
            .iter()
            .filter(|((f, _), _)| *f == faculty)
            .map(|(_, n)| *n)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures::*;

    fn p(slot: TimeSlotId, room: RoomId, faculty: FacultyId) -> Placement {
        Placement { slot, room, faculty }
    }

    #[test]
    fn test_clean_assignment_has_no_conflicts() {
        let snap = campus();
        let a: Assignment = [
            (SessionKey::new(1, 0), p(1, 100, 10)),
            (SessionKey::new(1, 1), p(2, 100, 10)),
            (SessionKey::new(4, 0), p(1, 102, 11)),
        ]
        .into_iter()
        .collect();
        assert!(find_conflicts(&snap, &a).is_empty());
    }

    #[test]
    fn test_detects_each_pairwise_clash() {
        let snap = campus();
        let a: Assignment = [
            // same faculty 10, same slot
            (SessionKey::new(1, 0), p(1, 100, 10)),
            (SessionKey::new(2, 0), p(1, 102, 10)),
            // same room 102 as course 2 at slot 1
            (SessionKey::new(4, 0), p(1, 102, 11)),
            // shares students with course 1 at slot 1
            (SessionKey::new(5, 0), p(1, 101, 12)),
        ]
        .into_iter()
        .collect();
        let conflicts = find_conflicts(&snap, &a);
        assert!(conflicts.iter().any(|c| matches!(c, Conflict::Faculty { faculty: 10, .. })));
        assert!(conflicts.iter().any(|c| matches!(c, Conflict::Room { room: 102, .. })));
        assert!(conflicts.iter().any(|c| matches!(c, Conflict::Student { slot: 1, .. })));
    }

    #[test]
    fn test_detects_capacity_violation() {
        let snap = campus();
        let ok: Assignment = [(SessionKey::new(1, 0), p(1, 101, 10))].into_iter().collect();
        assert!(find_conflicts(&snap, &ok).is_empty());

        let big = course(9, 10, &[1, 2, 3, 4, 5], 1);
        let snap = Snapshot::new(vec![big], vec![faculty(10)], vec![room(1, 4)], grid(1, 1), vec![]);
        let bad: Assignment = [(SessionKey::new(9, 0), p(1, 1, 10))].into_iter().collect();
        let conflicts = find_conflicts(&snap, &bad);
        assert_eq!(
            conflicts,
            vec![Conflict::Capacity {
                session: SessionKey::new(9, 0),
                room: 1,
                enrolled: 5,
                capacity: 4
            }]
        );
    }

    #[test]
    fn test_same_course_sessions_cannot_share_slot() {
        let snap = campus();
        let a: Assignment = [
            (SessionKey::new(6, 0), p(3, 100, 12)),
            (SessionKey::new(6, 1), p(3, 102, 12)),
        ]
        .into_iter()
        .collect();
        let conflicts = find_conflicts(&snap, &a);
        assert!(conflicts.iter().any(|c| matches!(c, Conflict::Student { .. })));
    }

    #[test]
    fn test_occupancy_place_and_remove() {
        let snap = campus();
        let mut occ = Occupancy::new();
        let placement = p(1, 100, 10);
        occ.place(1, &placement);
        assert!(occ.clashes(&snap, 2, &p(1, 101, 10)));
        assert!(occ.clashes(&snap, 4, &p(1, 100, 11)));
        assert!(occ.clashes(&snap, 3, &p(1, 102, 11)));
        assert!(!occ.clashes(&snap, 4, &p(1, 102, 11)));
        assert_eq!(occ.faculty_load(10), 1);
        occ.remove(1, &placement);
        assert!(!occ.clashes(&snap, 2, &p(1, 101, 10)));
    }

    #[test]
    fn test_unscheduled_lists_missing_sessions() {
        let snap = campus();
        let a: Assignment = [(SessionKey::new(1, 0), p(1, 100, 10))].into_iter().collect();
        let missing = unscheduled(&snap, &a);
        assert_eq!(missing.len(), snap.total_sessions() - 1);
        assert!(!missing.contains(&SessionKey::new(1, 0)));
    }
}
