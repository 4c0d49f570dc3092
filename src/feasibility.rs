//! Hard-constraint feasibility per cluster.
//!
//! Each (course, session) gets a domain of admissible (slot, room) pairs.
//! Sessions are placed most-constrained-first, greedily, rejecting anything
//! that clashes with what is already booked. A cluster the greedy pass cannot
//! finish goes to the exact ILP model once; if that fails too the stage
//! merges it with its most strongly coupled neighbour and tries again, a
//! bounded number of times, before reporting it infeasible.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::cluster::{self, Cluster, CouplingGraph};
use crate::config::FeasibilityConfig;
use crate::context::StageContext;
use crate::data::{Assignment, Course, CourseId, Placement, SessionKey, Snapshot};
use crate::error::{EngineError, Halt, StageResult};
use crate::solver;
use crate::validation::Occupancy;
use crate::workqueue::WorkQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveMethod {
    Greedy,
    Exact,
}

#[derive(Debug, Clone)]
pub struct ClusterSolution {
    pub cluster: usize,
    pub assignment: Assignment,
    pub method: SolveMethod,
}

/// A cluster whose hard constraints could not be satisfied.
#[derive(Debug, Clone)]
pub struct ClusterFailure {
    pub cluster: usize,
    pub unplaced: Vec<SessionKey>,
    /// Hard-clean placements made before running out of options.
    pub partial: Assignment,
}

impl ClusterFailure {
    pub fn to_error(&self) -> EngineError {
        EngineError::InfeasibleCluster {
            cluster: self.cluster,
            unplaced: self.unplaced.len(),
            sessions: self.unplaced.clone(),
        }
    }
}

pub type ClusterResult = std::result::Result<ClusterSolution, ClusterFailure>;

/// Solves single clusters. Cheap to clone into worker units.
#[derive(Debug, Clone)]
pub struct FeasibilitySolver {
    snapshot: Arc<Snapshot>,
    config: FeasibilityConfig,
    /// Bookings outside the clusters being solved (incremental runs).
    fixed: Arc<Assignment>,
}

impl FeasibilitySolver {
    pub fn new(snapshot: Arc<Snapshot>, config: FeasibilityConfig) -> Self {
        Self {
            snapshot,
            config,
            fixed: Arc::new(Assignment::new()),
        }
    }

    pub fn with_fixed(mut self, fixed: Arc<Assignment>) -> Self {
        self.fixed = fixed;
        self
    }

    /// Admissible placements of a course with its owning faculty, slot-major.
    pub fn domain(&self, course: &Course) -> Vec<Placement> {
        let rooms = self.snapshot.candidate_rooms(course);
        let fixed = Occupancy::from_assignment(&self.fixed);
        self.snapshot
            .time_slots()
            .iter()
            .flat_map(|s| {
                rooms.iter().map(move |&room| Placement {
                    slot: s.id,
                    room,
                    faculty: course.faculty_id,
                })
            })
            .filter(|p| self.snapshot.is_admissible(course, p))
            .filter(|p| !fixed.clashes(&self.snapshot, course.id, p))
            .collect()
    }

    /// Greedy most-constrained-first pass, then the exact model as the one
    /// local fallback.
    pub fn solve_cluster(&self, index: usize, courses: &[CourseId], token: &CancellationToken) -> ClusterResult {
        let mut domains: Vec<(&Course, Vec<Placement>)> = courses
            .iter()
            .filter_map(|id| self.snapshot.course(*id))
            .map(|c| (c, self.domain(c)))
            .collect();

        // spread independently solved clusters over different slots
        for (course, domain) in domains.iter_mut() {
            if !domain.is_empty() {
                let per_slot = self.snapshot.candidate_rooms(course).len().max(1);
                let shift = (index * per_slot) % domain.len();
                domain.rotate_left(shift);
            }
        }
        domains.sort_by(|(ca, da), (cb, db)| {
            da.len()
                .cmp(&db.len())
                .then_with(|| cb.sessions.cmp(&ca.sessions))
                .then_with(|| ca.id.cmp(&cb.id))
        });

        let (assignment, unplaced) = token.run_atomic(|| self.greedy(&domains));
        if unplaced.is_empty() {
            debug!("cluster {index}: greedy placed {} sessions", assignment.len());
            return Ok(ClusterSolution {
                cluster: index,
                assignment,
                method: SolveMethod::Greedy,
            });
        }

        debug!("cluster {index}: greedy left {} session(s) unplaced", unplaced.len());
        if self.config.exact_fallback {
            let session_domains: Vec<(SessionKey, Vec<Placement>)> = domains
                .iter()
                .flat_map(|(c, d)| (0..c.sessions).map(move |s| (SessionKey::new(c.id, s), d.clone())))
                .collect();
            let size = solver::model_size(&session_domains);
            if size <= self.config.exact_max_variables {
                match token.run_atomic(|| solver::solve_exact(&self.snapshot, &session_domains, 30.0)) {
                    Ok(Some(exact)) => {
                        info!("cluster {index}: exact model placed all {} sessions", exact.len());
                        return Ok(ClusterSolution {
                            cluster: index,
                            assignment: exact,
                            method: SolveMethod::Exact,
                        });
                    }
                    Ok(None) => debug!("cluster {index}: exact model infeasible"),
                    Err(e) => warn!("cluster {index}: exact model failed: {e}"),
                }
            } else {
                debug!("cluster {index}: exact model skipped ({size} variables)");
            }
        }

        Err(ClusterFailure {
            cluster: index,
            unplaced,
            partial: assignment,
        })
    }

    fn greedy(&self, domains: &[(&Course, Vec<Placement>)]) -> (Assignment, Vec<SessionKey>) {
        let mut occupancy = Occupancy::from_assignment(&self.fixed);
        let mut assignment = Assignment::new();
        let mut unplaced = Vec::new();

        for (course, domain) in domains {
            let mut used_days: BTreeSet<u32> = BTreeSet::new();
            for session in 0..course.sessions {
                let key = SessionKey::new(course.id, session);
                let free = |p: &&Placement| !occupancy.clashes(&self.snapshot, course.id, p);
                let fresh_day = |p: &&Placement| {
                    self.snapshot
                        .slot(p.slot)
                        .is_some_and(|s| !used_days.contains(&s.day))
                };
                // prefer a day the course does not meet yet
                let pick = domain
                    .iter()
                    .filter(free)
                    .find(fresh_day)
                    .or_else(|| domain.iter().find(free))
                    .copied();
                match pick {
                    Some(p) => {
                        occupancy.place(course.id, &p);
                        if let Some(s) = self.snapshot.slot(p.slot) {
                            used_days.insert(s.day);
                        }
                        assignment.insert(key, p);
                    }
                    None => unplaced.push(key),
                }
            }
        }
        (assignment, unplaced)
    }
}

/// Result of the whole feasibility stage.
#[derive(Debug, Clone)]
pub struct FeasibilityOutcome {
    pub assignment: Assignment,
    pub clusters: Vec<Cluster>,
    pub failures: Vec<ClusterFailure>,
}

/// Solves every cluster through the work queue, then retries failures with
/// relaxed clustering.
pub fn run_stage<Q: WorkQueue>(
    ctx: &StageContext<'_>,
    solver: &FeasibilitySolver,
    clusters: Vec<Cluster>,
    graph: &CouplingGraph,
    queue: &Q,
) -> StageResult<FeasibilityOutcome> {
    let total = clusters.len() as u64;
    let handles: Vec<_> = clusters
        .iter()
        .map(|cluster| {
            let solver = solver.clone();
            let courses = cluster.courses.clone();
            let index = cluster.id;
            let token = ctx.token.clone();
            queue.submit(move || solver.solve_cluster(index, &courses, &token))
        })
        .collect();

    let mut results: HashMap<usize, ClusterResult> = HashMap::new();
    for (done, handle) in handles.into_iter().enumerate() {
        let result = handle.join().map_err(Halt::Failed)?;
        let id = match &result {
            Ok(s) => s.cluster,
            Err(f) => f.cluster,
        };
        results.insert(id, result);
        ctx.progress.advance(done as u64 + 1, total);
        // between clusters
        ctx.safe_point()?;
    }

    let mut clusters = clusters;
    let mut attempts = 0;
    loop {
        let failed: Vec<usize> = clusters
            .iter()
            .map(|c| c.id)
            .filter(|id| matches!(results.get(id), Some(Err(_))))
            .collect();
        let Some(&failed_id) = failed.first() else { break };
        if attempts >= solver.config.max_relax_attempts || clusters.len() < 2 {
            break;
        }
        attempts += 1;
        let pos = clusters.iter().position(|c| c.id == failed_id).unwrap_or(0);
        let Some(neighbour) = cluster::strongest_neighbour(&clusters, pos, graph) else {
            break;
        };
        let merged = cluster::merge(&clusters[pos], &clusters[neighbour], graph);
        warn!(
            "cluster {} infeasible, retrying merged with cluster {} ({} courses, attempt {attempts})",
            failed_id,
            clusters[neighbour].id,
            merged.len()
        );
        results.remove(&clusters[neighbour].id);
        let (hi, lo) = if pos > neighbour { (pos, neighbour) } else { (neighbour, pos) };
        clusters.remove(hi);
        clusters.remove(lo);
        let result = solver.solve_cluster(merged.id, &merged.courses, ctx.token);
        results.insert(merged.id, result);
        clusters.push(merged);
        ctx.safe_point()?;
    }

    let mut assignment = Assignment::new();
    let mut failures = Vec::new();
    for cluster in &clusters {
        match results.remove(&cluster.id) {
            Some(Ok(solution)) => {
                assignment.merge(solution.assignment);
            }
            Some(Err(failure)) => {
                warn!("{}", failure.to_error());
                failures.push(failure);
            }
            None => {}
        }
    }
    info!(
        "Feasibility stage placed {} sessions across {} clusters ({} infeasible)",
        assignment.len(),
        clusters.len(),
        failures.len()
    );
    Ok(FeasibilityOutcome {
        assignment,
        clusters,
        failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures::*;
    use crate::validation::find_conflicts;

    fn solver_for(snapshot: Snapshot) -> FeasibilitySolver {
        FeasibilitySolver::new(Arc::new(snapshot), FeasibilityConfig::default())
    }

    #[test]
    fn test_greedy_solves_campus() {
        let snap = campus();
        let ids: Vec<CourseId> = snap.courses().iter().map(|c| c.id).collect();
        let total = snap.total_sessions();
        let solver = solver_for(snap.clone());
        let solution = solver.solve_cluster(0, &ids, &CancellationToken::new()).unwrap();
        assert_eq!(solution.method, SolveMethod::Greedy);
        assert_eq!(solution.assignment.len(), total);
        assert!(find_conflicts(&snap, &solution.assignment).is_empty());
    }

    #[test]
    fn test_domain_respects_capacity_features_availability() {
        let mut lab = course(1, 10, &[1, 2, 3, 4, 5], 1);
        lab.required_features.insert("bench".into());
        let mut f = faculty(10);
        f.available_slots.insert(2);
        let mut bench_room = room(2, 10);
        bench_room.features.insert("bench".into());
        let snap = Snapshot::new(vec![lab], vec![f], vec![room(1, 50), bench_room, room(3, 2)], grid(1, 3), vec![]);
        let solver = solver_for(snap.clone());
        let domain = solver.domain(snap.course(1).unwrap());
        assert_eq!(domain, vec![Placement { slot: 2, room: 2, faculty: 10 }]);
    }

    #[test]
    fn test_sessions_of_one_course_spread_over_days() {
        let snap = Snapshot::new(vec![course(1, 10, &[1], 3)], vec![faculty(10)], vec![room(1, 5)], grid(3, 2), vec![]);
        let solver = solver_for(snap.clone());
        let solution = solver.solve_cluster(0, &[1], &CancellationToken::new()).unwrap();
        let days: BTreeSet<u32> = solution
            .assignment
            .iter()
            .map(|(_, p)| snap.slot(p.slot).unwrap().day)
            .collect();
        assert_eq!(days.len(), 3);
    }

    #[test]
    fn test_fixed_bookings_are_respected() {
        let snap = Snapshot::new(
            vec![course(1, 10, &[1], 1), course(2, 10, &[2], 1)],
            vec![faculty(10)],
            vec![room(1, 5)],
            grid(1, 2),
            vec![],
        );
        let fixed: Assignment = [(SessionKey::new(1, 0), Placement { slot: 1, room: 1, faculty: 10 })]
            .into_iter()
            .collect();
        let solver = solver_for(snap.clone()).with_fixed(Arc::new(fixed));
        let solution = solver.solve_cluster(0, &[2], &CancellationToken::new()).unwrap();
        assert_eq!(solution.assignment.get(&SessionKey::new(2, 0)).unwrap().slot, 2);
    }

    #[test]
    fn test_infeasible_cluster_keeps_partial() {
        let snap = Snapshot::new(
            vec![course(1, 10, &[1], 1), course(2, 10, &[2], 1)],
            vec![faculty(10)],
            vec![room(1, 5)],
            grid(1, 1),
            vec![],
        );
        let solver = solver_for(snap);
        let failure = solver.solve_cluster(4, &[1, 2], &CancellationToken::new()).unwrap_err();
        assert_eq!(failure.cluster, 4);
        assert_eq!(failure.unplaced.len(), 1);
        assert_eq!(failure.partial.len(), 1);
        assert!(matches!(failure.to_error(), EngineError::InfeasibleCluster { cluster: 4, unplaced: 1, .. }));
    }
}
