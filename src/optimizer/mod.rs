//! Soft-objective refinement of a feasible assignment.
//!
//! Two genetic optimizers share the [`Evolve`] contract: [`cpu::CpuOptimizer`]
//! evolves assignments directly, [`dense::DenseOptimizer`] evolves a flat
//! integer population with batched kernels. Both keep the best-known
//! solution apart from the working population, so the result never scores
//! below the input.

pub mod cpu;
pub mod dense;
pub mod encoding;

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::{ObjectiveWeights, OptimizerConfig};
use crate::context::StageContext;
use crate::data::{Assignment, SessionKey, Snapshot};
use crate::error::StageResult;
use crate::hardware::HardwareProfile;
use crate::objectives;
use crate::validation;

pub use cpu::CpuOptimizer;
pub use dense::DenseOptimizer;

#[derive(Debug, Clone)]
pub struct EvolveOutcome {
    pub best: Assignment,
    pub best_fitness: f64,
    pub initial_fitness: f64,
    pub generations: usize,
    /// Population size in the last generation run.
    pub population: usize,
    /// Distinct top individuals with no more conflicts than the input, best first.
    pub elites: Vec<(Assignment, f64)>,
}

pub trait Evolve: Send + Sync {
    fn name(&self) -> &'static str;

    /// Refines `initial`, checking for cancellation between generations.
    fn evolve(&self, ctx: &StageContext<'_>, initial: &Assignment) -> StageResult<EvolveOutcome>;
}

/// Scores an individual: weighted soft total minus the conflict penalty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Fitness {
    pub value: f64,
    pub conflicts: usize,
}

impl Fitness {
    /// Better fitness that does not add hard conflicts.
    pub fn improves_on(&self, other: &Fitness, max_conflicts: usize) -> bool {
        self.conflicts <= max_conflicts && self.value > other.value
    }
}

pub fn fitness(snapshot: &Snapshot, weights: &ObjectiveWeights, penalty: f64, assignment: &Assignment) -> Fitness {
    let soft = objectives::evaluate(snapshot, assignment, weights).total;
    let conflicts = validation::count_conflicts(snapshot, assignment);
    Fitness {
        value: soft - penalty * conflicts as f64,
        conflicts,
    }
}

/// Picks the optimizer for the machine: dense when a device is present and
/// the population is large enough to pay for the transfer. `pinned`
/// sessions keep their input placement.
pub fn for_profile(
    profile: &HardwareProfile,
    snapshot: Arc<Snapshot>,
    config: OptimizerConfig,
    pinned: Arc<BTreeSet<SessionKey>>,
) -> Box<dyn Evolve> {
    if profile.use_gpu_optimizer(config.population_size, config.gpu_min_population) {
        Box::new(DenseOptimizer::new(snapshot, config, profile.cpu_cores).with_pinned(pinned))
    } else {
        Box::new(CpuOptimizer::new(snapshot, config).with_pinned(pinned))
    }
}

/// Up to `limit` distinct entries, best first.
pub(crate) fn distinct_top(mut ranked: Vec<(Assignment, f64)>, limit: usize) -> Vec<(Assignment, f64)> {
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut out: Vec<(Assignment, f64)> = Vec::new();
    for (a, f) in ranked {
        if out.len() >= limit {
            break;
        }
        if !out.iter().any(|(b, _)| *b == a) {
            out.push((a, f));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Placement, SessionKey};
    use crate::data::fixtures::*;

    #[test]
    fn test_conflicts_are_penalized() {
        let snap = campus();
        let weights = ObjectiveWeights::default();
        let clean: Assignment = [
            (SessionKey::new(1, 0), Placement { slot: 1, room: 100, faculty: 10 }),
            (SessionKey::new(2, 0), Placement { slot: 2, room: 100, faculty: 10 }),
        ]
        .into_iter()
        .collect();
        let clash: Assignment = [
            (SessionKey::new(1, 0), Placement { slot: 1, room: 100, faculty: 10 }),
            (SessionKey::new(2, 0), Placement { slot: 1, room: 102, faculty: 10 }),
        ]
        .into_iter()
        .collect();
        let a = fitness(&snap, &weights, 1.0, &clean);
        let b = fitness(&snap, &weights, 1.0, &clash);
        assert_eq!(a.conflicts, 0);
        assert_eq!(b.conflicts, 1);
        assert!(a.value > b.value);
        assert!(!b.improves_on(&a, 0));
    }

    #[test]
    fn test_gpu_profile_selects_dense() {
        let snap = Arc::new(campus());
        let mut profile = HardwareProfile::cpu_only(4);
        let config = OptimizerConfig {
            population_size: 512,
            ..OptimizerConfig::default()
        };
        assert_eq!(for_profile(&profile, snap.clone(), config.clone(), Arc::default()).name(), "cpu");
        profile.has_gpu = true;
        profile.gpu_memory = 8192;
        assert_eq!(for_profile(&profile, snap.clone(), config, Arc::default()).name(), "dense");
        assert_eq!(for_profile(&profile, snap, OptimizerConfig::default(), Arc::default()).name(), "cpu");
    }
}
