use serde::Serialize;

use crate::config::ContextWeights;
use crate::data::{Assignment, Placement, SessionKey, Snapshot};

/// Scores of one session in its surroundings, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ContextVector {
    /// Faculty preference for the slot.
    pub temporal: f64,
    /// Closeness to the faculty member's usual teaching period.
    pub behavioral: f64,
    /// Sessions of the course kept on different days.
    pub curricular: f64,
    /// Proximity to sessions of courses sharing students.
    pub peer: f64,
    /// Enrollment over room capacity.
    pub spatial: f64,
}

impl ContextVector {
    pub fn weighted(&self, w: &ContextWeights) -> f64 {
        let total = w.temporal + w.behavioral + w.curricular + w.peer + w.spatial;
        if total <= 0.0 {
            return 0.0;
        }
        (w.temporal * self.temporal
            + w.behavioral * self.behavioral
            + w.curricular * self.curricular
            + w.peer * self.peer
            + w.spatial * self.spatial)
            / total
    }
}

#[derive(Debug, Clone)]
pub struct ContextModel {
    weights: ContextWeights,
}

impl ContextModel {
    pub fn new(weights: ContextWeights) -> Self {
        Self { weights }
    }

    /// Context of `key` if it sat at `at`, against everything else in `assignment`.
    pub fn vector(&self, snapshot: &Snapshot, assignment: &Assignment, key: &SessionKey, at: &Placement) -> ContextVector {
        let (Some(course), Some(slot), Some(room)) =
            (snapshot.course(key.course_id), snapshot.slot(at.slot), snapshot.room(at.room))
        else {
            return ContextVector::default();
        };
        let max_period = snapshot.time_slots().iter().map(|s| s.period).max().unwrap_or(0).max(1) as f64;

        let mut faculty_periods = Vec::new();
        let (mut same_course, mut same_course_other_day) = (0usize, 0usize);
        let mut peer_gap: Option<u32> = None;
        for (other, p) in assignment.iter() {
            if other == key {
                continue;
            }
            let Some(s) = snapshot.slot(p.slot) else { continue };
            if p.faculty == at.faculty {
                faculty_periods.push(s.period as f64);
            }
            if other.course_id == key.course_id {
                same_course += 1;
                if s.day != slot.day {
                    same_course_other_day += 1;
                }
            } else if s.day == slot.day && snapshot.courses_conflict(other.course_id, key.course_id) {
                let gap = s.period.abs_diff(slot.period);
                peer_gap = Some(peer_gap.map_or(gap, |g| g.min(gap)));
            }
        }

        let behavioral = if faculty_periods.is_empty() {
            1.0
        } else {
            let mean = faculty_periods.iter().sum::<f64>() / faculty_periods.len() as f64;
            1.0 - ((slot.period as f64 - mean).abs() / max_period).min(1.0)
        };
        let curricular = if same_course == 0 {
            1.0
        } else {
            same_course_other_day as f64 / same_course as f64
        };
        let peer = match peer_gap {
            Some(gap) => 1.0 / gap.max(1) as f64,
            None => 0.5,
        };
        let spatial = if room.capacity == 0 {
            0.0
        } else {
            (snapshot.enrollment(course) as f64 / room.capacity as f64).min(1.0)
        };
        let temporal = snapshot
            .faculty_member(at.faculty)
            .map_or(0.5, |f| f.preference(at.slot));

        ContextVector {
            temporal,
            behavioral,
            curricular,
            peer,
            spatial,
        }
    }

    pub fn score(&self, snapshot: &Snapshot, assignment: &Assignment, key: &SessionKey, at: &Placement) -> f64 {
        self.vector(snapshot, assignment, key, at).weighted(&self.weights)
    }

    /// Mean weighted context over all placed sessions.
    pub fn quality(&self, snapshot: &Snapshot, assignment: &Assignment) -> f64 {
        if assignment.is_empty() {
            return 0.0;
        }
        let sum: f64 = assignment
            .iter()
            .map(|(key, p)| self.score(snapshot, assignment, key, p))
            .sum();
        sum / assignment.len() as f64
    }
}
