use log::{debug, info, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::encoding::EncodingTable;
use super::{Evolve, EvolveOutcome, Fitness, distinct_top, fitness};
use crate::config::OptimizerConfig;
use crate::context::StageContext;
use crate::data::{Assignment, SessionKey, Snapshot};
use crate::error::StageResult;
use crate::validation::Occupancy;

// random picks tried per mutated gene before keeping its placement
const MUTATION_TRIES: usize = 4;

#[derive(Debug, Clone)]
struct Individual {
    assignment: Assignment,
    fitness: Fitness,
}

/// Genetic optimizer over keyed assignments.
#[derive(Debug, Clone)]
pub struct CpuOptimizer {
    snapshot: Arc<Snapshot>,
    config: OptimizerConfig,
    pinned: Arc<BTreeSet<SessionKey>>,
}

impl CpuOptimizer {
    pub fn new(snapshot: Arc<Snapshot>, config: OptimizerConfig) -> Self {
        Self {
            snapshot,
            config,
            pinned: Arc::default(),
        }
    }

    /// Sessions that keep their input placement.
    pub fn with_pinned(mut self, pinned: Arc<BTreeSet<SessionKey>>) -> Self {
        self.pinned = pinned;
        self
    }

    fn score(&self, assignment: &Assignment) -> Fitness {
        fitness(&self.snapshot, &self.config.weights, self.config.conflict_penalty, assignment)
    }

    fn individual(&self, assignment: Assignment) -> Individual {
        let fitness = self.score(&assignment);
        Individual { assignment, fitness }
    }

    /// Per-gene mutation; a gene only moves to a placement that does not
    /// clash with the rest of the individual.
    fn mutate(&self, table: &EncodingTable, assignment: &mut Assignment, rate: f64, rng: &mut StdRng) {
        let rate = rate.clamp(0.0, 1.0);
        let mut occupancy = Occupancy::from_assignment(assignment);
        for (gene, key) in table.genes().iter().enumerate() {
            if !rng.random_bool(rate) {
                continue;
            }
            let domain = table.domain(gene);
            let Some(current) = assignment.get(key).copied() else { continue };
            if domain.is_empty() {
                continue;
            }
            occupancy.remove(key.course_id, &current);
            let mut chosen = current;
            for _ in 0..MUTATION_TRIES {
                let candidate = table.placement(gene, domain[rng.random_range(0..domain.len())]);
                if !occupancy.clashes(&self.snapshot, key.course_id, &candidate) {
                    chosen = candidate;
                    break;
                }
            }
            occupancy.place(key.course_id, &chosen);
            assignment.insert(*key, chosen);
        }
    }

    /// Single-point crossover along the gene order.
    fn crossover(&self, table: &EncodingTable, a: &Assignment, b: &Assignment, rng: &mut StdRng) -> Assignment {
        let n = table.len();
        if n < 2 {
            return a.clone();
        }
        let cut = rng.random_range(1..n);
        table
            .genes()
            .iter()
            .enumerate()
            .filter_map(|(i, key)| {
                let parent = if i < cut { a } else { b };
                parent.get(key).map(|p| (*key, *p))
            })
            .collect()
    }

    fn tournament<'p>(&self, population: &'p [Individual], rng: &mut StdRng) -> &'p Individual {
        let mut winner = &population[rng.random_range(0..population.len())];
        for _ in 1..self.config.tournament_size.max(1) {
            let challenger = &population[rng.random_range(0..population.len())];
            if challenger.fitness.value > winner.fitness.value {
                winner = challenger;
            }
        }
        winner
    }
}

impl Evolve for CpuOptimizer {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn evolve(&self, ctx: &StageContext<'_>, initial: &Assignment) -> StageResult<EvolveOutcome> {
        let cfg = &self.config;
        let seed = self.individual(initial.clone());
        let initial_fitness = seed.fitness;
        let max_conflicts = initial_fitness.conflicts;
        let table = EncodingTable::build(&self.snapshot, initial).pin(initial, &self.pinned);
        let mut rng = StdRng::seed_from_u64(cfg.seed);

        let mut pop_size = ctx.population(cfg.population_size).max(2);
        info!(
            "CPU optimizer: {} genes, population {pop_size}, up to {} generations",
            table.len(),
            cfg.generations
        );

        // seed population: the input plus heavily mutated copies
        let mut population = vec![seed.clone()];
        while population.len() < pop_size {
            let mut a = initial.clone();
            self.mutate(&table, &mut a, cfg.mutation_rate.max(0.2), &mut rng);
            population.push(self.individual(a));
        }

        let mut best = seed;
        let mut stale = 0;
        let mut generation = 0;
        while generation < cfg.generations && !table.is_empty() {
            ctx.safe_point()?;
            pop_size = ctx.population(cfg.population_size).max(2);

            population.sort_by(|a, b| b.fitness.value.total_cmp(&a.fitness.value));
            let elite_n = ((pop_size as f64 * cfg.elite_fraction).ceil() as usize).clamp(1, pop_size);
            let mut next: Vec<Individual> = population.iter().take(elite_n).cloned().collect();
            while next.len() < pop_size {
                let a = self.tournament(&population, &mut rng);
                let b = self.tournament(&population, &mut rng);
                let mut child = if rng.random_bool(cfg.crossover_rate.clamp(0.0, 1.0)) {
                    self.crossover(&table, &a.assignment, &b.assignment, &mut rng)
                } else {
                    a.assignment.clone()
                };
                self.mutate(&table, &mut child, cfg.mutation_rate, &mut rng);
                next.push(self.individual(child));
            }
            population = next;
            generation += 1;

            let leader = population
                .iter()
                .filter(|i| i.fitness.conflicts <= max_conflicts)
                .max_by(|a, b| a.fitness.value.total_cmp(&b.fitness.value));
            match leader {
                Some(l) if l.fitness.improves_on(&best.fitness, max_conflicts) => {
                    debug!(
                        "generation {generation}: best {:.4} -> {:.4}",
                        best.fitness.value, l.fitness.value
                    );
                    best = l.clone();
                    stale = 0;
                }
                _ => stale += 1,
            }
            trace!("generation {generation}: population {}, stale {stale}", population.len());
            ctx.progress.advance(generation as u64, cfg.generations as u64);

            if best.fitness.value >= cfg.quality_threshold {
                info!("Quality threshold reached at generation {generation}");
                break;
            }
            if stale >= cfg.patience {
                debug!("no improvement for {stale} generations, stopping");
                break;
            }
        }

        let elite_n = ((pop_size as f64 * cfg.elite_fraction).ceil() as usize).max(1);
        let candidates = population
            .iter()
            .filter(|i| i.fitness.conflicts <= max_conflicts)
            .map(|i| (i.assignment.clone(), i.fitness.value))
            .chain(std::iter::once((best.assignment.clone(), best.fitness.value)))
            .collect();
        info!(
            "CPU optimizer finished after {generation} generations: fitness {:.4} -> {:.4}",
            initial_fitness.value, best.fitness.value
        );
        Ok(EvolveOutcome {
            best: best.assignment,
            best_fitness: best.fitness.value,
            initial_fitness: initial_fitness.value,
            generations: generation,
            population: pop_size,
            elites: distinct_top(candidates, elite_n),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancelReason, CancelTier, CancellationToken};
    use crate::config::{FeasibilityConfig, MemoryConfig};
    use crate::data::fixtures::*;
    use crate::error::Halt;
    use crate::feasibility::FeasibilitySolver;
    use crate::memory::{FixedMemorySource, MemoryMonitor};
    use crate::progress::ProgressReporter;
    use crate::validation::find_conflicts;
    use std::time::Duration;

    fn feasible() -> (Arc<Snapshot>, Assignment) {
        let snap = Arc::new(campus());
        let ids: Vec<u32> = snap.courses().iter().map(|c| c.id).collect();
        let solver = FeasibilitySolver::new(snap.clone(), FeasibilityConfig::default());
        let solution = solver.solve_cluster(0, &ids, &CancellationToken::new()).unwrap();
        (snap, solution.assignment)
    }

    fn small_config() -> OptimizerConfig {
        OptimizerConfig {
            population_size: 16,
            generations: 20,
            quality_threshold: 2.0,
            ..OptimizerConfig::default()
        }
    }

    #[test]
    fn test_best_never_regresses() {
        let (snap, initial) = feasible();
        let token = CancellationToken::new();
        let progress = ProgressReporter::new("t", Duration::from_millis(1), 16);
        let ctx = StageContext::new(&token, &progress);
        let out = CpuOptimizer::new(snap.clone(), small_config()).evolve(&ctx, &initial).unwrap();
        assert!(out.best_fitness >= out.initial_fitness);
        assert_eq!(out.best.len(), initial.len());
        assert!(find_conflicts(&snap, &out.best).is_empty());
        assert!(!out.elites.is_empty());
        assert!(out.elites.iter().all(|(a, _)| find_conflicts(&snap, a).is_empty()));
    }

    #[test]
    fn test_same_seed_same_result() {
        let (snap, initial) = feasible();
        let token = CancellationToken::new();
        let progress = ProgressReporter::new("t", Duration::from_millis(1), 16);
        let ctx = StageContext::new(&token, &progress);
        let a = CpuOptimizer::new(snap.clone(), small_config()).evolve(&ctx, &initial).unwrap();
        let b = CpuOptimizer::new(snap, small_config()).evolve(&ctx, &initial).unwrap();
        assert_eq!(a.best, b.best);
        assert_eq!(a.generations, b.generations);
    }

    #[test]
    fn test_cancel_stops_at_generation_boundary() {
        let (snap, initial) = feasible();
        let token = CancellationToken::new();
        token.start();
        token.request(CancelTier::Hard, CancelReason::UserRequested);
        let progress = ProgressReporter::new("t", Duration::from_millis(1), 16);
        let ctx = StageContext::new(&token, &progress);
        let result = CpuOptimizer::new(snap, small_config()).evolve(&ctx, &initial);
        assert!(matches!(result, Err(Halt::Cancelled(CancelTier::Hard))));
    }

    #[test]
    fn test_memory_pressure_bounds_population() {
        let (snap, initial) = feasible();
        let monitor = MemoryMonitor::new(Arc::new(FixedMemorySource::new(0.90)), MemoryConfig::default());
        monitor.poll_once();
        let token = CancellationToken::new();
        let progress = ProgressReporter::new("t", Duration::from_millis(1), 16);
        let ctx = StageContext::new(&token, &progress).with_memory(&monitor);
        let config = OptimizerConfig {
            generations: 3,
            ..small_config()
        };
        let out = CpuOptimizer::new(snap, config).evolve(&ctx, &initial).unwrap();
        assert_eq!(out.population, 8);
    }

    #[test]
    fn test_patience_stops_early() {
        let (snap, initial) = feasible();
        let token = CancellationToken::new();
        let progress = ProgressReporter::new("t", Duration::from_millis(1), 16);
        let ctx = StageContext::new(&token, &progress);
        let config = OptimizerConfig {
            generations: 500,
            patience: 2,
            mutation_rate: 0.0,
            crossover_rate: 0.0,
            ..small_config()
        };
        let out = CpuOptimizer::new(snap, config).evolve(&ctx, &initial).unwrap();
        assert!(out.generations < 500);
    }
}
