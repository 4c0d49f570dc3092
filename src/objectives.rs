//! Soft objectives.
//!
//! Each term lies in [0, 1], higher is better; the total is their weighted
//! sum under [`ObjectiveWeights`].

use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::ObjectiveWeights;
use crate::data::{Assignment, Course, Faculty, Room, SessionKey, Snapshot, TimeSlot, UnmetSoftConstraint};

/// A placed session with its entities resolved.
#[derive(Debug, Clone, Copy)]
pub struct ScoredSession<'a> {
    pub key: SessionKey,
    pub course: &'a Course,
    pub slot: &'a TimeSlot,
    pub room: &'a Room,
    pub faculty: &'a Faculty,
    pub enrolled: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectiveBreakdown {
    pub compactness: f64,
    pub workload_balance: f64,
    pub room_utilization: f64,
    pub preference: f64,
    pub peak_spreading: f64,
    pub continuity: f64,
    pub total: f64,
}

/// Resolves placements against the snapshot, skipping unknown references.
pub fn resolve<'a>(snapshot: &'a Snapshot, assignment: &Assignment) -> Vec<ScoredSession<'a>> {
    assignment
        .iter()
        .filter_map(|(key, p)| {
            let course = snapshot.course(key.course_id)?;
            Some(ScoredSession {
                key: *key,
                course,
                slot: snapshot.slot(p.slot)?,
                room: snapshot.room(p.room)?,
                faculty: snapshot.faculty_member(p.faculty)?,
                enrolled: snapshot.enrollment(course),
            })
        })
        .collect()
}

pub fn evaluate(snapshot: &Snapshot, assignment: &Assignment, weights: &ObjectiveWeights) -> ObjectiveBreakdown {
    score_sessions(snapshot, weights, &resolve(snapshot, assignment))
}

pub fn score_sessions(snapshot: &Snapshot, weights: &ObjectiveWeights, sessions: &[ScoredSession<'_>]) -> ObjectiveBreakdown {
    if sessions.is_empty() {
        return ObjectiveBreakdown::default();
    }
    let mut b = ObjectiveBreakdown {
        compactness: compactness(sessions),
        workload_balance: workload_balance(snapshot, sessions),
        room_utilization: room_utilization(sessions),
        preference: sessions.iter().map(|s| s.faculty.preference(s.slot.id)).sum::<f64>() / sessions.len() as f64,
        peak_spreading: peak_spreading(snapshot, sessions),
        continuity: continuity(sessions),
        total: 0.0,
    };
    b.total = weights.compactness * b.compactness
        + weights.workload_balance * b.workload_balance
        + weights.room_utilization * b.room_utilization
        + weights.preference * b.preference
        + weights.peak_spreading * b.peak_spreading
        + weights.continuity * b.continuity;
    b
}

// occupied periods over spanned periods, per faculty-day and batch-day
fn compactness(sessions: &[ScoredSession<'_>]) -> f64 {
    let mut days: BTreeMap<(u8, u32, u32), Vec<u32>> = BTreeMap::new();
    for s in sessions {
        days.entry((0, s.faculty.id, s.slot.day)).or_default().push(s.slot.period);
        for batch in &s.course.batch_ids {
            days.entry((1, *batch, s.slot.day)).or_default().push(s.slot.period);
        }
    }
    let (mut occupied, mut span) = (0u64, 0u64);
    for mut periods in days.into_values() {
        periods.sort_unstable();
        periods.dedup();
        if let (Some(first), Some(last)) = (periods.first(), periods.last()) {
            occupied += periods.len() as u64;
            span += (last - first + 1) as u64;
        }
    }
    if span == 0 { 1.0 } else { occupied as f64 / span as f64 }
}

fn workload_balance(snapshot: &Snapshot, sessions: &[ScoredSession<'_>]) -> f64 {
    let days: Vec<u32> = {
        let mut d: Vec<u32> = snapshot.time_slots().iter().map(|s| s.day).collect();
        d.sort_unstable();
        d.dedup();
        d
    };
    if days.is_empty() {
        return 1.0;
    }
    let mut per_faculty: BTreeMap<u32, (BTreeMap<u32, u32>, &Faculty)> = BTreeMap::new();
    for s in sessions {
        let entry = per_faculty.entry(s.faculty.id).or_insert_with(|| (BTreeMap::new(), s.faculty));
        *entry.0.entry(s.slot.day).or_default() += 1;
    }
    let mut cv_sum = 0.0;
    let mut overloaded = 0usize;
    for (loads, faculty) in per_faculty.values() {
        let counts: Vec<f64> = days.iter().map(|d| *loads.get(d).unwrap_or(&0) as f64).collect();
        let total: f64 = counts.iter().sum();
        let mean = total / counts.len() as f64;
        if mean > 0.0 {
            let var = counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / counts.len() as f64;
            cv_sum += var.sqrt() / mean;
        }
        if total as u32 > faculty.max_weekly_load {
            overloaded += 1;
        }
    }
    let n = per_faculty.len().max(1) as f64;
    let balance = 1.0 / (1.0 + cv_sum / n);
    balance * (1.0 - 0.5 * overloaded as f64 / n)
}

fn room_utilization(sessions: &[ScoredSession<'_>]) -> f64 {
    let sum: f64 = sessions
        .iter()
        .map(|s| {
            if s.room.capacity == 0 {
                0.0
            } else {
                (s.enrolled as f64 / s.room.capacity as f64).min(1.0)
            }
        })
        .sum();
    sum / sessions.len() as f64
}

// normalized entropy of the slot histogram
fn peak_spreading(snapshot: &Snapshot, sessions: &[ScoredSession<'_>]) -> f64 {
    let slots = snapshot.time_slots().len();
    if slots <= 1 {
        return 1.0;
    }
    let mut histogram: BTreeMap<u32, usize> = BTreeMap::new();
    for s in sessions {
        *histogram.entry(s.slot.id).or_default() += 1;
    }
    let n = sessions.len() as f64;
    let entropy: f64 = histogram
        .values()
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.ln()
        })
        .sum();
    let max_entropy = (slots.min(sessions.len()).max(2) as f64).ln();
    (entropy / max_entropy).clamp(0.0, 1.0)
}

// sessions of one course on distinct days, at a consistent period
fn continuity(sessions: &[ScoredSession<'_>]) -> f64 {
    let mut by_course: BTreeMap<u32, Vec<(u32, u32)>> = BTreeMap::new();
    for s in sessions {
        by_course.entry(s.course.id).or_default().push((s.slot.day, s.slot.period));
    }
    let scores: Vec<f64> = by_course
        .values()
        .map(|meetings| {
            if meetings.len() < 2 {
                return 1.0;
            }
            let n = meetings.len() as f64;
            let mut days: Vec<u32> = meetings.iter().map(|m| m.0).collect();
            days.sort_unstable();
            days.dedup();
            let mut periods: BTreeMap<u32, usize> = BTreeMap::new();
            for m in meetings {
                *periods.entry(m.1).or_default() += 1;
            }
            let modal = periods.values().copied().max().unwrap_or(0) as f64;
            0.5 * days.len() as f64 / n + 0.5 * modal / n
        })
        .collect();
    scores.iter().sum::<f64>() / scores.len().max(1) as f64
}

/// Soft constraints the schedule does not meet, for the caller's report.
pub fn unmet_soft_constraints(snapshot: &Snapshot, assignment: &Assignment) -> Vec<UnmetSoftConstraint> {
    let sessions = resolve(snapshot, assignment);
    let mut unmet = Vec::new();

    for s in &sessions {
        let pref = s.faculty.preference(s.slot.id);
        if pref < 0.3 {
            unmet.push(UnmetSoftConstraint {
                constraint_type: "Faculty Preference".to_string(),
                description: format!(
                    "Session {} is taught by faculty {} at slot {}, which they rate {:.2}.",
                    s.key, s.faculty.id, s.slot.id, pref
                ),
            });
        }
    }

    let mut load: BTreeMap<u32, (u32, u32)> = BTreeMap::new();
    let mut course_days: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    let mut faculty_days: BTreeMap<(u32, u32), Vec<u32>> = BTreeMap::new();
    for s in &sessions {
        let e = load.entry(s.faculty.id).or_insert((0, s.faculty.max_weekly_load));
        e.0 += 1;
        course_days.entry(s.course.id).or_default().push(s.slot.day);
        faculty_days.entry((s.faculty.id, s.slot.day)).or_default().push(s.slot.period);
    }

    for (faculty, (count, max)) in load {
        if count > max {
            unmet.push(UnmetSoftConstraint {
                constraint_type: "Faculty Overload".to_string(),
                description: format!("Faculty {faculty} teaches {count} sessions, above their maximum of {max}."),
            });
        }
    }

    for (course, mut days) in course_days {
        let n = days.len();
        days.sort_unstable();
        days.dedup();
        if days.len() < n {
            unmet.push(UnmetSoftConstraint {
                constraint_type: "Same-Day Repetition".to_string(),
                description: format!("Course {course} meets more than once on the same day."),
            });
        }
    }

    for ((faculty, day), mut periods) in faculty_days {
        periods.sort_unstable();
        periods.dedup();
        if let (Some(first), Some(last)) = (periods.first(), periods.last()) {
            let gaps = (last - first + 1) as usize - periods.len();
            if gaps > 0 {
                unmet.push(UnmetSoftConstraint {
                    constraint_type: "Idle Gaps".to_string(),
                    description: format!("Faculty {faculty} has {gaps} idle period(s) on day {day}."),
                });
            }
        }
    }

    unmet
}
