//! Runs one job's pipeline: clustering, feasibility, optimization,
//! learning, conflict resolution, strictly in that order.
//!
//! The orchestrator owns no global state. Hardware, configuration and the
//! policy store are handed in; everything a run produces is returned.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cancel::CancelTier;
use crate::cluster::{self, Cluster, CouplingGraph};
use crate::config::EngineConfig;
use crate::context::StageContext;
use crate::data::{Assignment, CourseId, SessionKey, Snapshot, Solution};
use crate::error::{Halt, StageResult};
use crate::feasibility::{self, FeasibilitySolver};
use crate::hardware::{HardwareProfile, Strategy, select_strategy};
use crate::learning::store::PolicyStore;
use crate::learning::transfer::InstitutionProfile;
use crate::learning::{self, PolicySource, ReinforcementLearner};
use crate::objectives::{self, ObjectiveBreakdown};
use crate::optimizer::{self, CpuOptimizer, Evolve};
use crate::progress::Stage;
use crate::resolver::{ConflictResolver, ResolutionReport};
use crate::validation::{self, Occupancy};
use crate::workqueue::{Dispatcher, InlineQueue};

/// What one run works on.
#[derive(Debug, Clone)]
pub struct RunInput {
    pub institution: String,
    pub snapshot: Arc<Snapshot>,
    /// Last committed assignment for the same organization and semester.
    pub prior: Option<Assignment>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolutionVariant {
    pub rank: usize,
    pub solution: Solution,
    pub objectives: ObjectiveBreakdown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub strategy: Strategy,
    pub optimizer: String,
    pub clusters: usize,
    /// Best first.
    pub variants: Vec<SolutionVariant>,
    pub resolution: ResolutionReport,
    pub policy_source: Option<PolicySource>,
    pub partial: bool,
}

impl RunReport {
    pub fn best(&self) -> Option<&SolutionVariant> {
        self.variants.first()
    }
}

/// Prior placements still usable as-is, and the courses that must be re-solved.
pub fn split_prior(snapshot: &Snapshot, prior: &Assignment) -> (Assignment, Vec<CourseId>) {
    let mut occupancy = Occupancy::new();
    let mut fixed = Assignment::new();
    let mut changed = Vec::new();
    for course in snapshot.courses() {
        let keys: Vec<SessionKey> = (0..course.sessions).map(|s| SessionKey::new(course.id, s)).collect();
        let placements: Option<Vec<_>> = keys.iter().map(|k| prior.get(k).copied()).collect();
        let complete = prior.keys().filter(|k| k.course_id == course.id).count() == keys.len();
        let usable = placements.filter(|ps| {
            complete
                && ps.iter().enumerate().all(|(i, p)| {
                    snapshot.is_admissible(course, p)
                        && !occupancy.clashes(snapshot, course.id, p)
                        && !ps[..i].iter().any(|q| q.slot == p.slot)
                })
        });
        match usable {
            Some(ps) => {
                for (k, p) in keys.into_iter().zip(ps) {
                    occupancy.place(course.id, &p);
                    fixed.insert(k, p);
                }
            }
            None => changed.push(course.id),
        }
    }
    (fixed, changed)
}

pub fn change_ratio(snapshot: &Snapshot, prior: &Assignment) -> f64 {
    let total = snapshot.courses().len();
    if total == 0 {
        return 0.0;
    }
    split_prior(snapshot, prior).1.len() as f64 / total as f64
}

pub struct Orchestrator {
    profile: HardwareProfile,
    config: EngineConfig,
    dispatcher: Dispatcher,
    store: Arc<dyn PolicyStore>,
}

impl Orchestrator {
    pub fn new(profile: HardwareProfile, config: EngineConfig, store: Arc<dyn PolicyStore>) -> crate::error::Result<Self> {
        let dispatcher = Dispatcher::for_mode(profile.execution_mode())?;
        Ok(Self {
            profile,
            config,
            dispatcher,
            store,
        })
    }

    pub fn profile(&self) -> &HardwareProfile {
        &self.profile
    }

    pub fn run(&self, ctx: &StageContext<'_>, input: &RunInput) -> StageResult<RunReport> {
        let snapshot = &input.snapshot;
        snapshot.validate()?;
        let profile = self.profile.with_prior_solution(input.prior.is_some());
        let ratio = input.prior.as_ref().map(|p| change_ratio(snapshot, p));
        let strategy = select_strategy(&profile, ratio, self.config.job.incremental_delta);
        info!(
            "Job {} for {}: strategy {strategy:?}, {} courses, {} sessions",
            ctx.progress.job_id(),
            input.institution,
            snapshot.courses().len(),
            snapshot.total_sessions()
        );

        // clustering
        ctx.progress.enter_stage(Stage::Cluster);
        ctx.safe_point()?;
        let (fixed, clusters, graph) = match (strategy, input.prior.as_ref()) {
            (Strategy::Incremental, Some(prior)) => {
                let (fixed, changed) = split_prior(snapshot, prior);
                info!("Incremental run: {} sessions kept, {} courses re-solved", fixed.len(), changed.len());
                let clusters = if changed.is_empty() {
                    Vec::new()
                } else {
                    vec![Cluster {
                        id: 0,
                        courses: changed,
                        cohesion: 1.0,
                    }]
                };
                (fixed, clusters, CouplingGraph::default())
            }
            (Strategy::Hierarchical, _) => {
                let (clusters, graph) = cluster::partition(snapshot, &self.config.clustering);
                (Assignment::new(), clusters, graph)
            }
            _ => (Assignment::new(), vec![cluster::single(snapshot)], CouplingGraph::default()),
        };
        let cluster_count = clusters.len();
        ctx.progress.advance(1, 1);

        // feasibility
        ctx.progress.enter_stage(Stage::Feasibility);
        let solver = FeasibilitySolver::new(Arc::clone(snapshot), self.config.feasibility.clone())
            .with_fixed(Arc::new(fixed.clone()));
        let outcome = match strategy {
            Strategy::Hierarchical => feasibility::run_stage(ctx, &solver, clusters, &graph, &self.dispatcher)?,
            _ => feasibility::run_stage(ctx, &solver, clusters, &graph, &InlineQueue)?,
        };
        let mut partial = false;
        let mut assignment = fixed.clone();
        assignment.merge(outcome.assignment);
        if let Some(failure) = outcome.failures.first() {
            if !self.config.job.allow_partial {
                return Err(Halt::Failed(failure.to_error()));
            }
            warn!(
                "{} cluster(s) infeasible, continuing with a partial schedule",
                outcome.failures.len()
            );
            partial = true;
            for failure in &outcome.failures {
                assignment.merge(failure.partial.clone());
            }
        }
        let feasible = assignment.clone();
        let pinned: Arc<BTreeSet<SessionKey>> = Arc::new(fixed.keys().copied().collect());

        // optimization
        ctx.progress.enter_stage(Stage::Optimize);
        let optimizer: Box<dyn Evolve> = match strategy {
            Strategy::Standard => Box::new(
                CpuOptimizer::new(Arc::clone(snapshot), self.config.optimizer.clone()).with_pinned(Arc::clone(&pinned)),
            ),
            _ => optimizer::for_profile(&profile, Arc::clone(snapshot), self.config.optimizer.clone(), Arc::clone(&pinned)),
        };
        let mut elites = Vec::new();
        match optimizer.evolve(ctx, &assignment) {
            Ok(evolved) => {
                debug!(
                    "optimizer {} improved fitness {:.4} -> {:.4} in {} generations",
                    optimizer.name(),
                    evolved.initial_fitness,
                    evolved.best_fitness,
                    evolved.generations
                );
                assignment = evolved.best;
                elites = evolved.elites;
            }
            Err(Halt::Cancelled(CancelTier::Soft)) => {
                warn!("Soft cancellation during optimization, keeping the feasible schedule");
                return Ok(self.finalize(ctx, snapshot, strategy, optimizer.name(), cluster_count, feasible, Vec::new(), &fixed, None, true));
            }
            Err(halt) => return Err(halt),
        }

        // learning
        ctx.progress.enter_stage(Stage::Learn);
        let mut policy_source = None;
        if self.config.learning.enabled && !assignment.is_empty() {
            match self.learn(ctx, &input.institution, snapshot, &assignment, &pinned) {
                Ok((learned, source)) => {
                    policy_source = Some(source);
                    assignment = learned;
                }
                Err(Halt::Cancelled(CancelTier::Soft)) => {
                    warn!("Soft cancellation during learning, keeping the optimized schedule");
                    return Ok(self.finalize(ctx, snapshot, strategy, optimizer.name(), cluster_count, assignment, elites, &fixed, None, true));
                }
                Err(halt) => return Err(halt),
            }
        }

        ctx.safe_point()?;
        Ok(self.finalize(ctx, snapshot, strategy, optimizer.name(), cluster_count, assignment, elites, &fixed, policy_source, partial))
    }

    /// Learns on top of `optimized`; the learned schedule is kept only if it
    /// does not lower the soft objective or add conflicts.
    fn learn(
        &self,
        ctx: &StageContext<'_>,
        institution: &str,
        snapshot: &Arc<Snapshot>,
        optimized: &Assignment,
        pinned: &Arc<BTreeSet<SessionKey>>,
    ) -> StageResult<(Assignment, PolicySource)> {
        let profile = InstitutionProfile::from_snapshot(institution, snapshot);
        let (mut table, source) = learning::initial_table(self.store.as_ref(), &profile, &self.config.learning)?;
        let learner =
            ReinforcementLearner::new(Arc::clone(snapshot), self.config.learning.clone()).with_pinned(Arc::clone(pinned));
        let learned = learner.refine(ctx, optimized, &mut table)?;

        if let Err(e) = learning::persist(self.store.as_ref(), ctx.token, &profile, table, learned.episodes as u64) {
            warn!("Could not persist learned policy for {institution}: {e}");
        }

        let weights = &self.config.optimizer.weights;
        let before = objectives::evaluate(snapshot, optimized, weights).total;
        let after = objectives::evaluate(snapshot, &learned.assignment, weights).total;
        let conflicts_before = validation::count_conflicts(snapshot, optimized);
        let conflicts_after = validation::count_conflicts(snapshot, &learned.assignment);
        if after >= before && conflicts_after <= conflicts_before {
            info!("Learning kept: soft score {before:.4} -> {after:.4}");
            Ok((learned.assignment, source))
        } else {
            info!("Learning discarded: soft score {before:.4} -> {after:.4}");
            Ok((optimized.clone(), source))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        ctx: &StageContext<'_>,
        snapshot: &Snapshot,
        strategy: Strategy,
        optimizer: &str,
        clusters: usize,
        best: Assignment,
        elites: Vec<(Assignment, f64)>,
        fixed: &Assignment,
        policy_source: Option<PolicySource>,
        partial: bool,
    ) -> RunReport {
        ctx.progress.enter_stage(Stage::Finalize);
        let resolver = ConflictResolver::new(snapshot).protect(fixed.keys().copied());

        let mut best = best;
        let resolution = resolver.resolve(&mut best);
        let mut candidates = vec![best];
        for (elite, _) in elites {
            if candidates.len() >= self.config.job.variants.max(1) {
                break;
            }
            let mut elite = elite;
            resolver.resolve(&mut elite);
            if !candidates.contains(&elite) {
                candidates.push(elite);
            }
        }

        let weights = &self.config.optimizer.weights;
        let mut variants: Vec<SolutionVariant> = candidates
            .into_iter()
            .map(|assignment| {
                let breakdown = objectives::evaluate(snapshot, &assignment, weights);
                let unscheduled = validation::unscheduled(snapshot, &assignment);
                let solution = Solution {
                    soft_score: breakdown.total,
                    conflicts: validation::count_conflicts(snapshot, &assignment),
                    partial: partial || !unscheduled.is_empty(),
                    unscheduled,
                    unmet_soft_constraints: objectives::unmet_soft_constraints(snapshot, &assignment),
                    assignment,
                };
                SolutionVariant {
                    rank: 0,
                    solution,
                    objectives: breakdown,
                }
            })
            .collect();
        // the resolved best stays first unless another variant is strictly cleaner
        variants.sort_by(|a, b| {
            a.solution
                .conflicts
                .cmp(&b.solution.conflicts)
                .then(a.solution.unscheduled.len().cmp(&b.solution.unscheduled.len()))
                .then(b.solution.soft_score.total_cmp(&a.solution.soft_score))
        });
        for (i, v) in variants.iter_mut().enumerate() {
            v.rank = i + 1;
        }
        let partial = variants.first().is_some_and(|v| v.solution.partial);
        if let Some(best) = variants.first() {
            info!(
                "Best variant: soft score {:.4}, {} conflict(s), {} unscheduled{}",
                best.solution.soft_score,
                best.solution.conflicts,
                best.solution.unscheduled.len(),
                if partial { " (partial)" } else { "" }
            );
        }
        RunReport {
            strategy,
            optimizer: optimizer.to_string(),
            clusters,
            variants,
            resolution,
            policy_source,
            partial,
        }
    }
}
