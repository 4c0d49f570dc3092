//! Conflict resolution after clusters are merged.
//!
//! For each remaining violation one session is moved, trying in order:
//! another slot with the same room and faculty, another room, another
//! faculty member of the course's department. Anything still unresolved is
//! flagged for manual review; a session is never dropped.

use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::data::{Assignment, Course, Placement, SessionKey, Snapshot};
use crate::validation::{Conflict, Occupancy, find_conflicts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStep {
    SlotMove,
    RoomMove,
    FacultyReassignment,
}

impl fmt::Display for ResolutionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionStep::SlotMove => "slot move",
            ResolutionStep::RoomMove => "room move",
            ResolutionStep::FacultyReassignment => "faculty reassignment",
        };
        f.write_str(name)
    }
}

/// Audit record of one applied fix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub session: SessionKey,
    pub step: ResolutionStep,
    pub before: Placement,
    pub after: Placement,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolutionReport {
    pub resolved: Vec<Resolution>,
    pub manual_review: Vec<Conflict>,
}

impl ResolutionReport {
    pub fn is_clean(&self) -> bool {
        self.manual_review.is_empty()
    }
}

pub struct ConflictResolver<'a> {
    snapshot: &'a Snapshot,
    /// Sessions that must keep their placement.
    protected: BTreeSet<SessionKey>,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(snapshot: &'a Snapshot) -> Self {
        Self {
            snapshot,
            protected: BTreeSet::new(),
        }
    }

    pub fn protect(mut self, sessions: impl IntoIterator<Item = SessionKey>) -> Self {
        self.protected.extend(sessions);
        self
    }

    pub fn resolve(&self, assignment: &mut Assignment) -> ResolutionReport {
        let mut report = ResolutionReport::default();
        let mut stuck: BTreeSet<SessionKey> = BTreeSet::new();

        loop {
            let conflicts = find_conflicts(self.snapshot, assignment);
            // the later session of a pair is the one to move
            let next = conflicts.iter().find_map(|c| {
                c.sessions()
                    .into_iter()
                    .rev()
                    .find(|s| !stuck.contains(s) && !self.protected.contains(s))
                    .map(|s| (c, s))
            });
            let Some((conflict, session)) = next else { break };
            let Some(before) = assignment.get(&session).copied() else {
                stuck.insert(session);
                continue;
            };

            match self.fix(assignment, &session, &before) {
                Some((step, after)) => {
                    info!("Resolved {conflict} by {step}: session {session} {before} -> {after}");
                    assignment.insert(session, after);
                    report.resolved.push(Resolution {
                        session,
                        step,
                        before,
                        after,
                    });
                }
                None => {
                    warn!("No fix for session {session} in {conflict}");
                    stuck.insert(session);
                }
            }
        }

        report.manual_review = find_conflicts(self.snapshot, assignment);
        for conflict in &report.manual_review {
            warn!("Flagged for manual review: {conflict}");
        }
        info!(
            "Conflict resolution: {} fixed, {} flagged",
            report.resolved.len(),
            report.manual_review.len()
        );
        report
    }

    fn fix(&self, assignment: &Assignment, session: &SessionKey, before: &Placement) -> Option<(ResolutionStep, Placement)> {
        let course = self.snapshot.course(session.course_id)?;
        let mut occupancy = Occupancy::from_assignment(assignment);
        occupancy.remove(session.course_id, before);
        let free = |p: &Placement| {
            self.snapshot.is_admissible(course, p) && !occupancy.clashes(self.snapshot, course.id, p)
        };

        // 1. same room and faculty, another slot
        let slot_move = self
            .snapshot
            .time_slots()
            .iter()
            .filter(|s| s.id != before.slot)
            .map(|s| Placement { slot: s.id, ..*before })
            .find(|p| free(p));
        if let Some(p) = slot_move {
            return Some((ResolutionStep::SlotMove, p));
        }

        // 2. another room, current slot first
        let rooms = &self.snapshot.candidate_rooms(course);
        let room_move = self
            .slots_from(before)
            .flat_map(|slot| {
                rooms
                    .iter()
                    .filter(move |r| **r != before.room)
                    .map(move |&room| Placement { slot, room, faculty: before.faculty })
            })
            .find(|p| free(p));
        if let Some(p) = room_move {
            return Some((ResolutionStep::RoomMove, p));
        }

        // 3. another faculty member of the department with spare load
        let reassign = self
            .substitutes(course, before, &occupancy)
            .into_iter()
            .flat_map(|faculty| {
                self.slots_from(before).flat_map(move |slot| {
                    std::iter::once(before.room)
                        .chain(rooms.iter().copied().filter(move |r| *r != before.room))
                        .map(move |room| Placement { slot, room, faculty })
                })
            })
            .find(|p| free(p));
        reassign.map(|p| (ResolutionStep::FacultyReassignment, p))
    }

    fn slots_from(&self, before: &Placement) -> impl Iterator<Item = u32> + '_ {
        let current = before.slot;
        std::iter::once(current).chain(
            self.snapshot
                .time_slots()
                .iter()
                .map(|s| s.id)
                .filter(move |id| *id != current),
        )
    }

    fn substitutes(&self, course: &Course, before: &Placement, occupancy: &Occupancy) -> Vec<u32> {
        let mut candidates: Vec<(u32, u32)> = self
            .snapshot
            .faculty()
            .iter()
            .filter(|f| f.id != before.faculty && f.department_id == course.department_id)
            .map(|f| (occupancy.faculty_load(f.id), f.id))
            .filter(|(load, id)| {
                self.snapshot
                    .faculty_member(*id)
                    .is_some_and(|f| *load < f.max_weekly_load)
            })
            .collect();
        // least loaded first
        candidates.sort_unstable();
        candidates.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures::*;

    fn p(slot: u32, room: u32, faculty: u32) -> Placement {
        Placement { slot, room, faculty }
    }

    #[test]
    fn test_slot_move_first() {
        let snap = campus();
        let mut a: Assignment = [
            (SessionKey::new(1, 0), p(1, 100, 10)),
            (SessionKey::new(2, 0), p(1, 102, 10)),
        ]
        .into_iter()
        .collect();
        let report = ConflictResolver::new(&snap).resolve(&mut a);
        assert!(report.is_clean());
        assert_eq!(report.resolved.len(), 1);
        let r = &report.resolved[0];
        assert_eq!(r.session, SessionKey::new(2, 0));
        assert_eq!(r.step, ResolutionStep::SlotMove);
        assert_eq!(r.before, p(1, 102, 10));
        assert_eq!(r.after.room, 102);
        assert_eq!(a.get(&SessionKey::new(1, 0)), Some(&p(1, 100, 10)));
        assert!(find_conflicts(&snap, &a).is_empty());
    }

    #[test]
    fn test_room_move_when_single_slot() {
        // one slot: only the room can change
        let snap = Snapshot::new(
            vec![course(1, 10, &[1], 1), course(2, 11, &[2], 1)],
            vec![faculty(10), faculty(11)],
            vec![room(1, 5), room(2, 5)],
            grid(1, 1),
            vec![],
        );
        let mut a: Assignment = [(SessionKey::new(1, 0), p(1, 1, 10)), (SessionKey::new(2, 0), p(1, 1, 11))]
            .into_iter()
            .collect();
        let report = ConflictResolver::new(&snap).resolve(&mut a);
        assert!(report.is_clean());
        assert_eq!(report.resolved[0].step, ResolutionStep::RoomMove);
        assert_eq!(a.get(&SessionKey::new(2, 0)), Some(&p(1, 2, 11)));
    }

    #[test]
    fn test_faculty_reassignment_within_department() {
        let mut other_dept = faculty(12);
        other_dept.department_id = 2;
        let snap = Snapshot::new(
            vec![course(1, 10, &[1], 1), course(2, 10, &[2], 1)],
            vec![faculty(10), faculty(11), other_dept],
            vec![room(1, 5), room(2, 5)],
            grid(1, 1),
            vec![],
        );
        let mut a: Assignment = [(SessionKey::new(1, 0), p(1, 1, 10)), (SessionKey::new(2, 0), p(1, 2, 10))]
            .into_iter()
            .collect();
        let report = ConflictResolver::new(&snap).resolve(&mut a);
        assert!(report.is_clean());
        assert_eq!(report.resolved[0].step, ResolutionStep::FacultyReassignment);
        assert_eq!(a.get(&SessionKey::new(2, 0)).unwrap().faculty, 11);
    }

    #[test]
    fn test_unresolvable_is_flagged_not_dropped() {
        let snap = Snapshot::new(
            vec![course(1, 10, &[1], 1), course(2, 10, &[1], 1)],
            vec![faculty(10)],
            vec![room(1, 5)],
            grid(1, 1),
            vec![],
        );
        let mut a: Assignment = [(SessionKey::new(1, 0), p(1, 1, 10)), (SessionKey::new(2, 0), p(1, 1, 10))]
            .into_iter()
            .collect();
        let report = ConflictResolver::new(&snap).resolve(&mut a);
        assert!(!report.is_clean());
        assert!(report.resolved.is_empty());
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_protected_sessions_stay() {
        let snap = campus();
        let mut a: Assignment = [
            (SessionKey::new(1, 0), p(1, 100, 10)),
            (SessionKey::new(2, 0), p(1, 102, 10)),
        ]
        .into_iter()
        .collect();
        let report = ConflictResolver::new(&snap)
            .protect([SessionKey::new(2, 0)])
            .resolve(&mut a);
        assert!(report.is_clean());
        assert_eq!(report.resolved[0].session, SessionKey::new(1, 0));
        assert_eq!(a.get(&SessionKey::new(2, 0)), Some(&p(1, 102, 10)));
    }
}
