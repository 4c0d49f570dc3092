//! Dense-tensor optimizer.
//!
//! The population is one flat `[population x genes]` buffer of pair-table
//! indices. Each generation is two batch kernels on the device, scoring and
//! breeding, and both run as atomic sections: a launch is never interrupted,
//! cancellation is observed between generations.
//!
//! Conflict counts come from contracting the population against the
//! faculty x slot and room x slot incidence: every cell holding `c` sessions
//! contributes `c(c-1)/2` clashing pairs, the same pairwise count the
//! validator reports.

use log::{debug, info, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::encoding::EncodingTable;
use super::{Evolve, EvolveOutcome, Fitness, distinct_top};
use crate::config::OptimizerConfig;
use crate::context::StageContext;
use crate::data::{Assignment, SessionKey, Snapshot};
use crate::error::{EngineError, Halt, StageResult};
use crate::objectives::{self, ScoredSession};

/// Batch executor the population lives on.
struct Device {
    pool: rayon::ThreadPool,
}

impl Device {
    fn new(threads: usize) -> Result<Self, EngineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("dense-device-{i}"))
            .build()
            .map_err(|e| EngineError::Internal(format!("initialising dense device: {e}")))?;
        Ok(Self { pool })
    }
}

/// Per-job kernel inputs, built once from the encoding table.
struct Kernels<'a> {
    snapshot: &'a Snapshot,
    table: &'a EncodingTable,
    gene_faculty: Vec<usize>,
    faculty_count: usize,
    config: &'a OptimizerConfig,
}

impl<'a> Kernels<'a> {
    fn new(snapshot: &'a Snapshot, table: &'a EncodingTable, config: &'a OptimizerConfig) -> Self {
        let faculty_count = snapshot.faculty().len() + 1;
        // unknown faculty share the trailing row
        let gene_faculty = (0..table.len())
            .map(|g| snapshot.faculty_index(table.gene_faculty(g)).unwrap_or(faculty_count - 1))
            .collect();
        Self {
            snapshot,
            table,
            gene_faculty,
            faculty_count,
            config,
        }
    }

    fn conflicts(&self, genes: &[u32]) -> usize {
        let slots = self.table.slot_count();
        let mut faculty_slot = vec![0u32; self.faculty_count * slots];
        let mut room_slot = vec![0u32; self.table.room_count() * slots];
        for (g, &value) in genes.iter().enumerate() {
            let s = self.table.slot_index(value);
            faculty_slot[self.gene_faculty[g] * slots + s] += 1;
            room_slot[self.table.room_index(value) * slots + s] += 1;
        }
        let pairs = |c: &u32| (c * c.saturating_sub(1) / 2) as usize;
        let student = self
            .table
            .conflict_pairs()
            .iter()
            .filter(|(i, j)| self.table.slot_index(genes[*i]) == self.table.slot_index(genes[*j]))
            .count();
        faculty_slot.iter().map(pairs).sum::<usize>() + room_slot.iter().map(pairs).sum::<usize>() + student
    }

    fn soft(&self, genes: &[u32]) -> f64 {
        let sessions: Vec<ScoredSession<'_>> = genes
            .iter()
            .enumerate()
            .filter_map(|(g, &value)| {
                let key = self.table.genes()[g];
                let course = self.snapshot.course(key.course_id)?;
                Some(ScoredSession {
                    key,
                    course,
                    slot: self.snapshot.time_slots().get(self.table.slot_index(value))?,
                    room: self.snapshot.rooms().get(self.table.room_index(value))?,
                    faculty: self.snapshot.faculty_member(self.table.gene_faculty(g))?,
                    enrolled: self.snapshot.enrollment(course),
                })
            })
            .collect();
        objectives::score_sessions(self.snapshot, &self.config.weights, &sessions).total
    }

    fn score(&self, genes: &[u32]) -> Fitness {
        let conflicts = self.conflicts(genes);
        Fitness {
            value: self.soft(genes) - self.config.conflict_penalty * conflicts as f64,
            conflicts,
        }
    }

    fn score_batch(&self, device: &Device, population: &[u32]) -> Vec<Fitness> {
        let n = self.table.len();
        device
            .pool
            .install(|| population.par_chunks(n).map(|genes| self.score(genes)).collect())
    }

    /// Next generation: elites copied by rank, the rest bred by tournament,
    /// single-point crossover and per-gene mutation. Each child draws from
    /// its own seeded stream, so the result does not depend on scheduling.
    fn breed(
        &self,
        device: &Device,
        parents: &[u32],
        fitness: &[Fitness],
        order: &[usize],
        elite_n: usize,
        pop_size: usize,
        generation: usize,
    ) -> Vec<u32> {
        let n = self.table.len();
        let cfg = self.config;
        let mut next = vec![0u32; pop_size * n];
        device.pool.install(|| {
            next.par_chunks_mut(n).enumerate().for_each(|(child, genes)| {
                if child < elite_n {
                    let src = order[child];
                    genes.copy_from_slice(&parents[src * n..(src + 1) * n]);
                    return;
                }
                let mut rng = StdRng::seed_from_u64(cfg.seed ^ ((generation as u64) << 32) ^ child as u64);
                let a = tournament(fitness, cfg.tournament_size, &mut rng);
                let b = tournament(fitness, cfg.tournament_size, &mut rng);
                let (pa, pb) = (&parents[a * n..(a + 1) * n], &parents[b * n..(b + 1) * n]);
                if n >= 2 && rng.random_bool(cfg.crossover_rate.clamp(0.0, 1.0)) {
                    let cut = rng.random_range(1..n);
                    genes[..cut].copy_from_slice(&pa[..cut]);
                    genes[cut..].copy_from_slice(&pb[cut..]);
                } else {
                    genes.copy_from_slice(pa);
                }
                mutate(self.table, genes, cfg.mutation_rate, &mut rng);
            });
        });
        next
    }
}

fn tournament(fitness: &[Fitness], size: usize, rng: &mut StdRng) -> usize {
    let mut winner = rng.random_range(0..fitness.len());
    for _ in 1..size.max(1) {
        let challenger = rng.random_range(0..fitness.len());
        if fitness[challenger].value > fitness[winner].value {
            winner = challenger;
        }
    }
    winner
}

fn mutate(table: &EncodingTable, genes: &mut [u32], rate: f64, rng: &mut StdRng) {
    let rate = rate.clamp(0.0, 1.0);
    for (g, value) in genes.iter_mut().enumerate() {
        let domain = table.domain(g);
        if !domain.is_empty() && rng.random_bool(rate) {
            *value = domain[rng.random_range(0..domain.len())];
        }
    }
}

fn rank(fitness: &[Fitness]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..fitness.len()).collect();
    order.sort_by(|&a, &b| fitness[b].value.total_cmp(&fitness[a].value).then(a.cmp(&b)));
    order
}

#[derive(Debug, Clone)]
pub struct DenseOptimizer {
    snapshot: Arc<Snapshot>,
    config: OptimizerConfig,
    device_threads: usize,
    pinned: Arc<BTreeSet<SessionKey>>,
}

impl DenseOptimizer {
    pub fn new(snapshot: Arc<Snapshot>, config: OptimizerConfig, device_threads: usize) -> Self {
        Self {
            snapshot,
            config,
            device_threads,
            pinned: Arc::default(),
        }
    }

    pub fn with_pinned(mut self, pinned: Arc<BTreeSet<SessionKey>>) -> Self {
        self.pinned = pinned;
        self
    }
}

impl Evolve for DenseOptimizer {
    fn name(&self) -> &'static str {
        "dense"
    }

    fn evolve(&self, ctx: &StageContext<'_>, initial: &Assignment) -> StageResult<EvolveOutcome> {
        let cfg = &self.config;
        let table = EncodingTable::build(&self.snapshot, initial).pin(initial, &self.pinned);
        let kernels = Kernels::new(&self.snapshot, &table, cfg);
        let n = table.len();
        let seed_genes = table.encode(initial).map_err(Halt::Failed)?;
        let initial_fitness = kernels.score(&seed_genes);
        if n == 0 || cfg.generations == 0 {
            return Ok(EvolveOutcome {
                best: initial.clone(),
                best_fitness: initial_fitness.value,
                initial_fitness: initial_fitness.value,
                generations: 0,
                population: 0,
                elites: vec![(initial.clone(), initial_fitness.value)],
            });
        }
        let device = Device::new(self.device_threads).map_err(Halt::Failed)?;
        let max_conflicts = initial_fitness.conflicts;
        let mut pop_size = ctx.population(cfg.population_size).max(2);
        info!(
            "Dense optimizer: [{pop_size} x {n}] population on {} device thread(s)",
            device.pool.current_num_threads()
        );

        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut population = Vec::with_capacity(pop_size * n);
        population.extend_from_slice(&seed_genes);
        for _ in 1..pop_size {
            let mut genes = seed_genes.clone();
            mutate(&table, &mut genes, cfg.mutation_rate.max(0.2), &mut rng);
            population.extend_from_slice(&genes);
        }
        let mut fitness = ctx.token.run_atomic(|| kernels.score_batch(&device, &population));

        let mut best = (seed_genes.clone(), initial_fitness);
        let mut stale = 0;
        let mut generation = 0;
        while generation < cfg.generations {
            ctx.safe_point()?;
            pop_size = ctx.population(cfg.population_size).max(2);
            let order = rank(&fitness);
            let elite_n = ((pop_size as f64 * cfg.elite_fraction).ceil() as usize).clamp(1, pop_size.min(order.len()));

            let (next, next_fitness) = ctx.token.run_atomic(|| {
                let next = kernels.breed(&device, &population, &fitness, &order, elite_n, pop_size, generation);
                let f = kernels.score_batch(&device, &next);
                (next, f)
            });
            population = next;
            fitness = next_fitness;
            generation += 1;

            let leader = (0..fitness.len())
                .filter(|&i| fitness[i].conflicts <= max_conflicts)
                .max_by(|&a, &b| fitness[a].value.total_cmp(&fitness[b].value));
            match leader {
                Some(i) if fitness[i].improves_on(&best.1, max_conflicts) => {
                    debug!("generation {generation}: best {:.4} -> {:.4}", best.1.value, fitness[i].value);
                    best = (population[i * n..(i + 1) * n].to_vec(), fitness[i]);
                    stale = 0;
                }
                _ => stale += 1,
            }
            trace!("generation {generation}: population {pop_size}, stale {stale}");
            ctx.progress.advance(generation as u64, cfg.generations as u64);

            if best.1.value >= cfg.quality_threshold {
                info!("Quality threshold reached at generation {generation}");
                break;
            }
            if stale >= cfg.patience {
                debug!("no improvement for {stale} generations, stopping");
                break;
            }
        }

        let elite_n = ((pop_size as f64 * cfg.elite_fraction).ceil() as usize).max(1);
        let candidates = rank(&fitness)
            .into_iter()
            .filter(|&i| fitness[i].conflicts <= max_conflicts)
            .take(elite_n)
            .map(|i| (table.decode(&population[i * n..(i + 1) * n]), fitness[i].value))
            .chain(std::iter::once((table.decode(&best.0), best.1.value)))
            .collect();
        info!(
            "Dense optimizer finished after {generation} generations: fitness {:.4} -> {:.4}",
            initial_fitness.value, best.1.value
        );
        Ok(EvolveOutcome {
            best: table.decode(&best.0),
            best_fitness: best.1.value,
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
    use crate::config::FeasibilityConfig;
    use crate::data::fixtures::*;
    use crate::data::{Placement, SessionKey};
    use crate::feasibility::FeasibilitySolver;
    use crate::optimizer::fitness;
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

    fn config() -> OptimizerConfig {
        OptimizerConfig {
            population_size: 24,
            generations: 15,
            quality_threshold: 2.0,
            ..OptimizerConfig::default()
        }
    }

    #[test]
    fn test_contraction_matches_validator() {
        let snap = campus();
        let a: Assignment = [
            (SessionKey::new(1, 0), Placement { slot: 1, room: 100, faculty: 10 }),
            (SessionKey::new(2, 0), Placement { slot: 1, room: 100, faculty: 10 }),
            (SessionKey::new(3, 0), Placement { slot: 1, room: 102, faculty: 11 }),
            (SessionKey::new(4, 0), Placement { slot: 2, room: 102, faculty: 11 }),
        ]
        .into_iter()
        .collect();
        let cfg = OptimizerConfig::default();
        let table = EncodingTable::build(&snap, &a);
        let kernels = Kernels::new(&snap, &table, &cfg);
        let genes = table.encode(&a).unwrap();
        assert_eq!(kernels.conflicts(&genes), find_conflicts(&snap, &a).len());
        let reference = fitness(&snap, &cfg.weights, cfg.conflict_penalty, &a);
        assert!((kernels.score(&genes).value - reference.value).abs() < 1e-9);
    }

    #[test]
    fn test_dense_best_never_regresses() {
        let (snap, initial) = feasible();
        let token = CancellationToken::new();
        let progress = ProgressReporter::new("t", Duration::from_millis(1), 16);
        let ctx = StageContext::new(&token, &progress);
        let out = DenseOptimizer::new(snap.clone(), config(), 2).evolve(&ctx, &initial).unwrap();
        assert!(out.best_fitness >= out.initial_fitness);
        assert_eq!(out.best.len(), initial.len());
        assert!(find_conflicts(&snap, &out.best).is_empty());
    }

    #[test]
    fn test_dense_is_deterministic_across_thread_counts() {
        let (snap, initial) = feasible();
        let token = CancellationToken::new();
        let progress = ProgressReporter::new("t", Duration::from_millis(1), 16);
        let ctx = StageContext::new(&token, &progress);
        let a = DenseOptimizer::new(snap.clone(), config(), 1).evolve(&ctx, &initial).unwrap();
        let b = DenseOptimizer::new(snap, config(), 4).evolve(&ctx, &initial).unwrap();
        assert_eq!(a.best, b.best);
    }

    #[test]
    fn test_dense_cancel_between_generations() {
        let (snap, initial) = feasible();
        let token = CancellationToken::new();
        token.start();
        token.request(CancelTier::Soft, CancelReason::UserRequested);
        let progress = ProgressReporter::new("t", Duration::from_millis(1), 16);
        let ctx = StageContext::new(&token, &progress);
        let result = DenseOptimizer::new(snap, config(), 2).evolve(&ctx, &initial);
        assert!(matches!(result, Err(Halt::Cancelled(CancelTier::Soft))));
    }
}
