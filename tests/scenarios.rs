mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use timetable_engine::cache::StampedeCache;
use timetable_engine::cancel::{CancelReason, CancelTier, CancellationToken, JobState, RequestOutcome};
use timetable_engine::config::{CacheConfig, EngineConfig, FeasibilityConfig, MemoryConfig, OptimizerConfig};
use timetable_engine::context::StageContext;
use timetable_engine::data::{Assignment, Snapshot};
use timetable_engine::error::{EngineError, Halt};
use timetable_engine::feasibility::FeasibilitySolver;
use timetable_engine::hardware::HardwareProfile;
use timetable_engine::learning::store::{InMemoryPolicyStore, PolicyStore};
use timetable_engine::memory::{FixedMemorySource, MemoryMonitor, PressureLevel};
use timetable_engine::optimizer::encoding::EncodingTable;
use timetable_engine::optimizer::{CpuOptimizer, Evolve};
use timetable_engine::orchestrator::{Orchestrator, RunInput};
use timetable_engine::progress::{ProgressReporter, Stage};
use timetable_engine::validation::find_conflicts;

fn course_ids(snapshot: &Snapshot) -> Vec<u32> {
    snapshot.courses().iter().map(|c| c.id).collect()
}

fn feasible(snapshot: Snapshot) -> (Arc<Snapshot>, Assignment) {
    let snapshot = Arc::new(snapshot);
    let solver = FeasibilitySolver::new(Arc::clone(&snapshot), FeasibilityConfig::default());
    let solved = solver
        .solve_cluster(0, &course_ids(&snapshot), &CancellationToken::new())
        .expect("feasible instance");
    (snapshot, solved.assignment)
}

/// No faculty, room or student clash and every room fits its class.
fn assert_committable(snapshot: &Snapshot, assignment: &Assignment) {
    assert!(find_conflicts(snapshot, assignment).is_empty());
    let entries: Vec<_> = assignment.iter().collect();
    for (i, (ka, pa)) in entries.iter().enumerate() {
        let course = snapshot.course(ka.course_id).unwrap();
        let room = snapshot.room(pa.room).unwrap();
        assert!(room.capacity >= snapshot.enrollment(course), "{ka} overfills room {}", room.id);
        for (kb, pb) in &entries[i + 1..] {
            if pa.slot != pb.slot {
                continue;
            }
            assert_ne!(pa.faculty, pb.faculty, "{ka} and {kb} share faculty");
            assert_ne!(pa.room, pb.room, "{ka} and {kb} share a room");
            assert!(!snapshot.courses_conflict(ka.course_id, kb.course_id), "{ka} and {kb} share students");
        }
    }
}

#[test]
fn scenario_a_disjoint_faculty_is_solved_completely() {
    let (snapshot, assignment) = feasible(common::scenario_a());
    assert_eq!(assignment.len(), 3);
    assert_committable(&snapshot, &assignment);
}

#[test]
fn scenario_b_single_slot_shared_faculty_is_infeasible() {
    let snapshot = Arc::new(common::scenario_b());
    let solver = FeasibilitySolver::new(Arc::clone(&snapshot), FeasibilityConfig::default());
    let failure = solver
        .solve_cluster(0, &course_ids(&snapshot), &CancellationToken::new())
        .unwrap_err();
    assert_eq!(failure.unplaced.len(), 1);
    assert!(matches!(
        failure.to_error(),
        EngineError::InfeasibleCluster { unplaced: 1, .. }
    ));
}

#[test]
fn scenario_c_cancel_during_optimization_discards_everything() {
    let mut config = EngineConfig::default();
    config.optimizer.population_size = 8;
    config.optimizer.generations = 1_000_000;
    config.optimizer.patience = 1_000_000;
    config.optimizer.quality_threshold = f64::INFINITY;
    let store = Arc::new(InMemoryPolicyStore::new());
    let orchestrator = Orchestrator::new(HardwareProfile::cpu_only(1), config, store.clone()).unwrap();

    let token = CancellationToken::new();
    token.start();
    let progress = Arc::new(ProgressReporter::new("scenario-c", Duration::from_millis(1), 1024));
    let watcher = {
        let token = token.clone();
        let progress = Arc::clone(&progress);
        thread::spawn(move || {
            while progress.stage() != Stage::Optimize {
                thread::sleep(Duration::from_millis(1));
            }
            thread::sleep(Duration::from_millis(20));
            token.request(CancelTier::Hard, CancelReason::UserRequested)
        })
    };

    let ctx = StageContext::new(&token, &progress);
    let input = RunInput {
        institution: "north".into(),
        snapshot: Arc::new(common::department()),
        prior: None,
    };
    let outcome = orchestrator.run(&ctx, &input);
    assert_eq!(watcher.join().unwrap(), RequestOutcome::Accepted);
    assert!(matches!(outcome, Err(Halt::Cancelled(CancelTier::Hard))));
    assert_eq!(token.finish(JobState::Success), JobState::Cancelled);
    // learning never ran, so nothing was persisted
    assert!(store.load("north").unwrap().is_none());
}

#[test]
fn scenario_d_memory_pressure_bounds_population() {
    let source = Arc::new(FixedMemorySource::new(0.90));
    let monitor = MemoryMonitor::new(source, MemoryConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        monitor.register("record", Box::new(move |level| seen.lock().unwrap().push(level)));
    }
    assert_eq!(monitor.poll_once(), PressureLevel::Aggressive);
    assert_eq!(*seen.lock().unwrap(), vec![PressureLevel::Aggressive]);

    let (snapshot, assignment) = feasible(common::department());
    let config = OptimizerConfig {
        population_size: 20,
        generations: 3,
        ..OptimizerConfig::default()
    };
    let token = CancellationToken::new();
    let progress = ProgressReporter::new("scenario-d", Duration::from_millis(1), 64);
    let ctx = StageContext::new(&token, &progress).with_memory(&monitor);
    let outcome = CpuOptimizer::new(snapshot, config).evolve(&ctx, &assignment).unwrap();
    assert!(outcome.population < 20);
    assert_eq!(outcome.population, 10);
}

#[test]
fn scenario_e_concurrent_expired_key_recomputes_once() {
    let config = CacheConfig {
        ttl_secs: 1,
        lock_timeout_ms: 2_000,
        poll_interval_ms: 10,
        max_poll_retries: 100,
    };
    let cache: Arc<StampedeCache<String, u64>> = Arc::new(StampedeCache::new(&config));
    cache.insert("courses".into(), 1);
    thread::sleep(Duration::from_millis(1_100));
    assert_eq!(cache.get(&"courses".to_string()), None);

    let computed = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));
    let callers: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let computed = Arc::clone(&computed);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache
                    .get_or_compute(&"courses".to_string(), || {
                        computed.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(100));
                        Ok::<_, EngineError>(2)
                    })
                    .unwrap()
            })
        })
        .collect();
    let values: Vec<u64> = callers.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(values.iter().all(|v| *v == 2));
    assert_eq!(computed.load(Ordering::SeqCst), 1);
    let stats = cache.stats();
    assert_eq!(stats.recomputes, 1);
    assert_eq!(stats.fallbacks, 0);
}

#[test]
fn repeated_cancellation_matches_a_single_request() {
    let once = CancellationToken::new();
    let twice = CancellationToken::new();
    for token in [&once, &twice] {
        token.start();
    }
    once.request(CancelTier::Soft, CancelReason::UserRequested);
    twice.request(CancelTier::Soft, CancelReason::UserRequested);
    assert_eq!(
        twice.request(CancelTier::Soft, CancelReason::UserRequested),
        RequestOutcome::AlreadyRequested
    );
    assert_eq!(once.state(), twice.state());
    assert_eq!(once.tier(), twice.tier());
    assert_eq!(once.reason(), twice.reason());
    assert_eq!(once.finish(JobState::Success), twice.finish(JobState::Success));
}

#[test]
fn progress_never_decreases() {
    let progress = ProgressReporter::new("mono", Duration::ZERO, 4096);
    let mut events = progress.subscribe();
    progress.enter_stage(Stage::Load);
    progress.enter_stage(Stage::Feasibility);
    for done in 0..=10 {
        progress.advance(done, 10);
        progress.tick();
    }
    // a later stage reporting little work must not pull progress back
    progress.enter_stage(Stage::Optimize);
    progress.advance(1, 100);
    progress.enter_stage(Stage::Feasibility);
    progress.advance(0, 10);
    progress.complete();

    let mut last = 0.0;
    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        assert!(event.progress >= last, "{} after {last}", event.progress);
        last = event.progress;
        count += 1;
    }
    assert!(count > 0);
    assert_eq!(last, 100.0);
}

#[test]
fn encoding_round_trip_preserves_assignment() {
    let (snapshot, assignment) = feasible(common::department());
    let table = EncodingTable::build(&snapshot, &assignment);
    let genes = table.encode(&assignment).unwrap();
    assert_eq!(genes.len(), snapshot.total_sessions());
    assert_eq!(table.decode(&genes), assignment);
}

#[test]
fn full_pipeline_commits_only_clean_schedules() {
    let mut config = EngineConfig::default();
    config.optimizer.population_size = 12;
    config.optimizer.generations = 10;
    config.learning.episodes = 4;
    config.clustering.max_cluster_size = 4;
    let orchestrator = Orchestrator::new(
        HardwareProfile::cpu_only(4),
        config,
        Arc::new(InMemoryPolicyStore::new()),
    )
    .unwrap();
    let token = CancellationToken::new();
    token.start();
    let progress = ProgressReporter::new("full", Duration::from_millis(1), 256);
    let ctx = StageContext::new(&token, &progress);
    let snapshot = Arc::new(common::department());
    let report = orchestrator
        .run(
            &ctx,
            &RunInput {
                institution: "north".into(),
                snapshot: Arc::clone(&snapshot),
                prior: None,
            },
        )
        .unwrap();
    for variant in &report.variants {
        if variant.solution.conflicts == 0 {
            assert_committable(&snapshot, &variant.solution.assignment);
        }
    }
    let best = &report.best().unwrap().solution;
    assert!(best.is_valid());
    assert_committable(&snapshot, &best.assignment);
}
