//! Q-learning refinement of an optimized assignment.
//!
//! Each episode visits every session once, picks a conflict-free move
//! epsilon-greedily from the Q-table and is rewarded by the change in the
//! session's weighted context score. Moves with positive reward are kept.
//! The best assignment seen at an episode boundary is returned, so the
//! context quality never drops below the input.

pub mod context;
pub mod qtable;
pub mod store;
pub mod transfer;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::config::LearningConfig;
use crate::context::StageContext;
use crate::data::{Assignment, Placement, SessionKey, Snapshot};
use crate::error::{Result, StageResult};
use crate::validation::Occupancy;
use context::ContextModel;
use qtable::{ActionKey, QTable, StateKey, load_bucket};
use store::{PolicyStore, StoredPolicy};
use transfer::{InstitutionProfile, ProfileIndex};

/// Where a job's starting Q-table came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "source")]
pub enum PolicySource {
    /// The institution's own stored table.
    Stored { episodes: u64 },
    /// Averaged from similar institutions.
    Bootstrapped { donors: Vec<(String, f64)> },
    Cold,
}

#[derive(Debug, Clone)]
pub struct LearnOutcome {
    pub assignment: Assignment,
    pub episodes: usize,
    pub moves: usize,
    pub quality_before: f64,
    pub quality_after: f64,
}

#[derive(Debug, Clone)]
pub struct ReinforcementLearner {
    snapshot: Arc<Snapshot>,
    config: LearningConfig,
    model: ContextModel,
    pinned: Arc<BTreeSet<SessionKey>>,
}

impl ReinforcementLearner {
    pub fn new(snapshot: Arc<Snapshot>, config: LearningConfig) -> Self {
        let model = ContextModel::new(config.weights);
        Self {
            snapshot,
            config,
            model,
            pinned: Arc::default(),
        }
    }

    /// Sessions the learner never moves.
    pub fn with_pinned(mut self, pinned: Arc<BTreeSet<SessionKey>>) -> Self {
        self.pinned = pinned;
        self
    }

    pub fn model(&self) -> &ContextModel {
        &self.model
    }

    fn state(&self, assignment: &Assignment, key: &SessionKey, at: &Placement) -> Option<StateKey> {
        let course = self.snapshot.course(key.course_id)?;
        let slot = self.snapshot.slot(at.slot)?;
        let same_day = assignment
            .iter()
            .filter(|(k, p)| *k != key && p.faculty == at.faculty)
            .filter(|(_, p)| self.snapshot.slot(p.slot).is_some_and(|s| s.day == slot.day))
            .count();
        Some(StateKey {
            course_type: course.course_type,
            day: slot.day,
            period: slot.period,
            load_bucket: load_bucket(same_day),
        })
    }

    /// One conflict-free placement per other slot, keeping the room when it is free.
    fn moves(&self, occupancy: &Occupancy, key: &SessionKey, current: &Placement) -> Vec<(ActionKey, Placement)> {
        let Some(course) = self.snapshot.course(key.course_id) else {
            return Vec::new();
        };
        let rooms = self.snapshot.candidate_rooms(course);
        let mut moves = Vec::new();
        for slot in self.snapshot.time_slots() {
            if slot.id == current.slot {
                continue;
            }
            let candidate = std::iter::once(current.room)
                .chain(rooms.iter().copied().filter(|r| *r != current.room))
                .map(|room| Placement {
                    slot: slot.id,
                    room,
                    faculty: current.faculty,
                })
                .find(|p| self.snapshot.is_admissible(course, p) && !occupancy.clashes(&self.snapshot, key.course_id, p));
            if let Some(p) = candidate {
                moves.push((
                    ActionKey {
                        day: slot.day,
                        period: slot.period,
                    },
                    p,
                ));
            }
        }
        moves
    }

    pub fn refine(&self, ctx: &StageContext<'_>, initial: &Assignment, table: &mut QTable) -> StageResult<LearnOutcome> {
        let cfg = &self.config;
        let snapshot = &self.snapshot;
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut assignment = initial.clone();
        let mut occupancy = Occupancy::from_assignment(&assignment);
        let quality_before = self.model.quality(snapshot, &assignment);
        let mut best = (assignment.clone(), quality_before);
        let mut keys: Vec<SessionKey> = assignment.keys().filter(|k| !self.pinned.contains(k)).copied().collect();
        let mut epsilon = cfg.epsilon.clamp(0.0, 1.0);
        let mut applied = 0;
        info!(
            "Learning over {} sessions for {} episodes (table has {} entries)",
            keys.len(),
            cfg.episodes,
            table.len()
        );

        let mut episode = 0;
        while episode < cfg.episodes {
            ctx.safe_point()?;
            keys.shuffle(&mut rng);
            for key in &keys {
                let Some(current) = assignment.get(key).copied() else { continue };
                let Some(state) = self.state(&assignment, key, &current) else { continue };
                occupancy.remove(key.course_id, &current);
                let moves = self.moves(&occupancy, key, &current);
                if moves.is_empty() {
                    occupancy.place(key.course_id, &current);
                    continue;
                }
                let actions: Vec<ActionKey> = moves.iter().map(|(a, _)| *a).collect();
                let pick = if rng.random_bool(epsilon) {
                    rng.random_range(0..moves.len())
                } else {
                    table
                        .best_action(&state, &actions)
                        .and_then(|a| actions.iter().position(|x| *x == a))
                        .unwrap_or(0)
                };
                let (action, target) = moves[pick];

                let reward = self.model.score(snapshot, &assignment, key, &target)
                    - self.model.score(snapshot, &assignment, key, &current);
                assignment.insert(*key, target);
                let next_max = self
                    .state(&assignment, key, &target)
                    .map_or(0.0, |next| table.max_value(&next, &actions));
                table.update(state, action, reward, next_max, cfg.alpha, cfg.gamma);

                if reward > 0.0 {
                    occupancy.place(key.course_id, &target);
                    applied += 1;
                } else {
                    assignment.insert(*key, current);
                    occupancy.place(key.course_id, &current);
                }
            }
            episode += 1;
            epsilon *= cfg.epsilon_decay;

            let quality = self.model.quality(snapshot, &assignment);
            if quality > best.1 {
                best = (assignment.clone(), quality);
            }
            debug!("episode {episode}: quality {quality:.4}, epsilon {epsilon:.3}");
            ctx.progress.advance(episode as u64, cfg.episodes as u64);
        }

        info!(
            "Learning finished: {applied} moves kept, context quality {quality_before:.4} -> {:.4}",
            best.1
        );
        Ok(LearnOutcome {
            assignment: best.0,
            episodes: episode,
            moves: applied,
            quality_before,
            quality_after: best.1,
        })
    }
}

/// Starting table for an institution: its own if stored, otherwise a
/// transfer bootstrap from similar institutions, otherwise empty.
pub fn initial_table(store: &dyn PolicyStore, profile: &InstitutionProfile, config: &LearningConfig) -> Result<(QTable, PolicySource)> {
    if let Some(own) = store.load(&profile.institution)? {
        info!("Using stored policy for {} ({} episodes)", profile.institution, own.episodes);
        return Ok((own.table, PolicySource::Stored { episodes: own.episodes }));
    }

    let mut index = ProfileIndex::new(store.profiles()?);
    if index.is_empty() {
        info!("No prior institutions, cold start for {}", profile.institution);
        return Ok((QTable::new(), PolicySource::Cold));
    }
    index.recluster(config.profile_groups, config.seed);
    let similar = index.similar(profile, config.transfer_k);
    let mut donors: Vec<(f64, QTable)> = Vec::new();
    for (name, sim) in &similar {
        match store.load(name)? {
            Some(policy) => donors.push((*sim, policy.table)),
            None => warn!("profile {name} listed without a stored policy"),
        }
    }
    if donors.is_empty() {
        return Ok((QTable::new(), PolicySource::Cold));
    }
    let refs: Vec<(f64, &QTable)> = donors.iter().map(|(s, t)| (*s, t)).collect();
    let table = transfer::bootstrap(&refs);
    info!(
        "Bootstrapped {} Q-values for {} from {:?}",
        table.len(),
        profile.institution,
        similar
    );
    Ok((table, PolicySource::Bootstrapped { donors: similar }))
}

/// Persists the learned table as one atomic batch.
pub fn persist(
    store: &dyn PolicyStore,
    token: &CancellationToken,
    profile: &InstitutionProfile,
    table: QTable,
    episodes: u64,
) -> Result<()> {
    token.run_atomic(|| {
        let previous = store.load(&profile.institution)?.map_or(0, |p| p.episodes);
        store.save(&StoredPolicy {
            profile: profile.clone(),
            table,
            episodes: previous + episodes,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeasibilityConfig;
    use crate::data::fixtures::*;
    use crate::feasibility::FeasibilitySolver;
    use crate::progress::ProgressReporter;
    use crate::validation::find_conflicts;
    use std::time::Duration;
    use store::InMemoryPolicyStore;

    fn feasible() -> (Arc<Snapshot>, Assignment) {
        let snap = Arc::new(campus());
        let ids: Vec<u32> = snap.courses().iter().map(|c| c.id).collect();
        let solver = FeasibilitySolver::new(snap.clone(), FeasibilityConfig::default());
        let solution = solver.solve_cluster(0, &ids, &CancellationToken::new()).unwrap();
        (snap, solution.assignment)
    }

    fn run(snap: Arc<Snapshot>, initial: &Assignment, table: &mut QTable) -> LearnOutcome {
        let token = CancellationToken::new();
        let progress = ProgressReporter::new("t", Duration::from_millis(1), 16);
        let ctx = StageContext::new(&token, &progress);
        let config = LearningConfig {
            episodes: 8,
            ..LearningConfig::default()
        };
        ReinforcementLearner::new(snap, config).refine(&ctx, initial, table).unwrap()
    }

    #[test]
    fn test_refine_keeps_hard_constraints_and_quality() {
        let (snap, initial) = feasible();
        let mut table = QTable::new();
        let out = run(snap.clone(), &initial, &mut table);
        assert_eq!(out.episodes, 8);
        assert_eq!(out.assignment.len(), initial.len());
        assert!(find_conflicts(&snap, &out.assignment).is_empty());
        assert!(out.quality_after >= out.quality_before);
        assert!(!table.is_empty());
    }

    #[test]
    fn test_pinned_sessions_never_move() {
        let (snap, initial) = feasible();
        let pinned: BTreeSet<SessionKey> = initial.keys().copied().collect();
        let token = CancellationToken::new();
        let progress = ProgressReporter::new("t", Duration::from_millis(1), 16);
        let ctx = StageContext::new(&token, &progress);
        let out = ReinforcementLearner::new(snap, LearningConfig::default())
            .with_pinned(Arc::new(pinned))
            .refine(&ctx, &initial, &mut QTable::new())
            .unwrap();
        assert_eq!(out.assignment, initial);
        assert_eq!(out.moves, 0);
    }

    #[test]
    fn test_cold_then_stored_then_bootstrapped() {
        let (snap, initial) = feasible();
        let store = InMemoryPolicyStore::new();
        let config = LearningConfig::default();
        let profile = InstitutionProfile::from_snapshot("north", &snap);

        let (mut table, source) = initial_table(&store, &profile, &config).unwrap();
        assert_eq!(source, PolicySource::Cold);
        run(snap.clone(), &initial, &mut table);
        persist(&store, &CancellationToken::new(), &profile, table.clone(), 8).unwrap();

        let (own, source) = initial_table(&store, &profile, &config).unwrap();
        assert_eq!(source, PolicySource::Stored { episodes: 8 });
        assert_eq!(own, table);

        let sibling = InstitutionProfile::from_snapshot("south", &snap);
        let (boot, source) = initial_table(&store, &sibling, &config).unwrap();
        match source {
            PolicySource::Bootstrapped { donors } => assert_eq!(donors[0].0, "north"),
            other => panic!("expected bootstrap, got {other:?}"),
        }
        // a single donor is copied
        assert_eq!(boot.len(), table.len());
        assert!(table.iter().all(|(s, a, v)| (boot.get(s, a) - v).abs() < 1e-12));
    }
}
