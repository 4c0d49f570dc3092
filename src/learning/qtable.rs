//! Tabular action values.
//!
//! Keys carry no institution-specific ids, so a table learned at one
//! institution is meaningful at another.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;

use crate::data::CourseType;

/// Situation of one session: what it is and where it currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct StateKey {
    pub course_type: CourseType,
    pub day: u32,
    pub period: u32,
    /// Faculty sessions already on that day, capped.
    pub load_bucket: u8,
}

/// Target (day, period) of a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct ActionKey {
    pub day: u32,
    pub period: u32,
}

pub const MAX_LOAD_BUCKET: u8 = 4;

pub fn load_bucket(sessions_that_day: usize) -> u8 {
    sessions_that_day.min(MAX_LOAD_BUCKET as usize) as u8
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
struct QEntry {
    state: StateKey,
    action: ActionKey,
    value: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QTable {
    values: HashMap<StateKey, HashMap<ActionKey, f64>>,
}

impl QTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, state: &StateKey, action: &ActionKey) -> f64 {
        self.values
            .get(state)
            .and_then(|actions| actions.get(action))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn set(&mut self, state: StateKey, action: ActionKey, value: f64) {
        self.values.entry(state).or_default().insert(action, value);
    }

    /// Highest value among `actions`, 0 when none is known.
    pub fn max_value(&self, state: &StateKey, actions: &[ActionKey]) -> f64 {
        actions
            .iter()
            .map(|a| self.get(state, a))
            .fold(None, |best: Option<f64>, v| Some(best.map_or(v, |b| b.max(v))))
            .unwrap_or(0.0)
    }

    /// Greedy choice; ties go to the earliest action.
    pub fn best_action(&self, state: &StateKey, actions: &[ActionKey]) -> Option<ActionKey> {
        let mut best: Option<(ActionKey, f64)> = None;
        for a in actions {
            let v = self.get(state, a);
            if best.is_none_or(|(_, b)| v > b) {
                best = Some((*a, v));
            }
        }
        best.map(|(a, _)| a)
    }

    /// One Q-learning step.
    pub fn update(&mut self, state: StateKey, action: ActionKey, reward: f64, next_max: f64, alpha: f64, gamma: f64) {
        let old = self.get(&state, &action);
        self.set(state, action, old + alpha * (reward + gamma * next_max - old));
    }

    pub fn len(&self) -> usize {
        self.values.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StateKey, &ActionKey, f64)> {
        self.values
            .iter()
            .flat_map(|(s, actions)| actions.iter().map(move |(a, v)| (s, a, *v)))
    }

    fn entries(&self) -> Vec<QEntry> {
        let mut entries: Vec<QEntry> = self
            .iter()
            .map(|(state, action, value)| QEntry {
                state: *state,
                action: *action,
                value,
            })
            .collect();
        entries.sort_by(|a, b| (a.state, a.action).cmp(&(b.state, b.action)));
        entries
    }
}

// JSON object keys must be strings, so the table travels as an entry list
impl Serialize for QTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<QEntry>::deserialize(deserializer)?;
        let mut table = QTable::new();
        for e in entries {
            table.set(e.state, e.action, e.value);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> StateKey {
        StateKey {
            course_type: CourseType::Lecture,
            day: 0,
            period: 2,
            load_bucket: 1,
        }
    }

    #[test]
    fn test_update_moves_toward_target() {
        let mut q = QTable::new();
        let a = ActionKey { day: 1, period: 0 };
        q.update(state(), a, 1.0, 0.0, 0.5, 0.9);
        assert!((q.get(&state(), &a) - 0.5).abs() < 1e-12);
        q.update(state(), a, 1.0, 0.0, 0.5, 0.9);
        assert!((q.get(&state(), &a) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_best_action_and_max() {
        let mut q = QTable::new();
        let a = ActionKey { day: 0, period: 0 };
        let b = ActionKey { day: 0, period: 1 };
        q.set(state(), b, 0.4);
        assert_eq!(q.best_action(&state(), &[a, b]), Some(b));
        assert_eq!(q.max_value(&state(), &[a, b]), 0.4);
        assert_eq!(q.best_action(&state(), &[]), None);
        assert_eq!(q.max_value(&state(), &[]), 0.0);
    }

    #[test]
    fn test_json_entry_list() {
        let mut q = QTable::new();
        q.set(state(), ActionKey { day: 2, period: 3 }, -0.25);
        let json = serde_json::to_string(&q).unwrap();
        assert!(json.starts_with('['));
        let back: QTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, q);
        assert_eq!(load_bucket(9), MAX_LOAD_BUCKET);
    }
}
