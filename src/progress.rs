//! Per-job progress reporting.
//!
//! Progress is monotone and stays below 100 until [`ProgressReporter::complete`]
//! publishes the explicit completion event. Each stage owns a fixed band of
//! the range; inside the band progress follows counted work units when the
//! stage reports them, otherwise a time curve that keeps creeping forward
//! past the expected duration instead of freezing.

use log::trace;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Load,
    Cluster,
    Feasibility,
    Optimize,
    Learn,
    Finalize,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Load,
        Stage::Cluster,
        Stage::Feasibility,
        Stage::Optimize,
        Stage::Learn,
        Stage::Finalize,
    ];

    /// Width of the stage's band, in percent.
    pub fn share(self) -> f64 {
        match self {
            Stage::Load => 5.0,
            Stage::Cluster => 10.0,
            Stage::Feasibility => 50.0,
            Stage::Optimize => 25.0,
            Stage::Learn => 8.0,
            Stage::Finalize => 2.0,
        }
    }

    /// Lower edge of the stage's band.
    pub fn start(self) -> f64 {
        Stage::ALL
            .iter()
            .take_while(|s| **s != self)
            .map(|s| s.share())
            .sum()
    }

    fn index(self) -> usize {
        Stage::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }

    fn default_expected(self) -> Duration {
        match self {
            Stage::Load => Duration::from_secs(2),
            Stage::Cluster => Duration::from_secs(2),
            Stage::Feasibility => Duration::from_secs(20),
            Stage::Optimize => Duration::from_secs(15),
            Stage::Learn => Duration::from_secs(5),
            Stage::Finalize => Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Payload published on a job's progress channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub progress: f64,
    pub stage: Stage,
    pub status: ProgressStatus,
    pub eta_seconds: Option<f64>,
}

// highest value a running job may report
const RUNNING_CAP: f64 = 99.9;
// time curve reaches 80% of the band at the expected duration
const CURVE_RATE: f64 = 1.609_437_9;

#[derive(Debug)]
struct Tracker {
    reached: f64,
    stage: Stage,
    stage_started: Instant,
    work: Option<(u64, u64)>,
    last_publish: Option<Instant>,
    finished: bool,
    expected: [Duration; 6],
}

#[derive(Debug)]
pub struct ProgressReporter {
    job_id: String,
    tx: broadcast::Sender<ProgressEvent>,
    publish_interval: Duration,
    tracker: Mutex<Tracker>,
}

impl ProgressReporter {
    pub fn new(job_id: impl Into<String>, publish_interval: Duration, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            job_id: job_id.into(),
            tx,
            publish_interval,
            tracker: Mutex::new(Tracker {
                reached: 0.0,
                stage: Stage::Load,
                stage_started: Instant::now(),
                work: None,
                last_publish: None,
                finished: false,
                expected: Stage::ALL.map(Stage::default_expected),
            }),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> f64 {
        self.lock().reached
    }

    pub fn stage(&self) -> Stage {
        self.lock().stage
    }

    /// Overrides the expected duration used by the time curve and the ETA.
    pub fn set_expected(&self, stage: Stage, expected: Duration) {
        self.lock().expected[stage.index()] = expected.max(Duration::from_millis(1));
    }

    /// Entering a stage never lowers progress already reached.
    pub fn enter_stage(&self, stage: Stage) {
        let mut t = self.lock();
        if t.finished {
            return;
        }
        t.stage = stage;
        t.stage_started = Instant::now();
        t.work = None;
        t.reached = t.reached.max(stage.start()).min(RUNNING_CAP);
        self.publish(&mut t, ProgressStatus::Running, true);
    }

    /// Work-unit progress inside the current stage.
    pub fn advance(&self, done: u64, total: u64) {
        let mut t = self.lock();
        if t.finished || total == 0 {
            return;
        }
        let done = done.min(total);
        t.work = Some((done, total));
        let value = t.stage.start() + t.stage.share() * done as f64 / total as f64;
        t.reached = t.reached.max(value).min(RUNNING_CAP);
        self.publish(&mut t, ProgressStatus::Running, false);
    }

    /// Time-based advance for stages without countable work; called by the
    /// job's ticker.
    pub fn tick(&self) {
        let mut t = self.lock();
        if t.finished {
            return;
        }
        if t.work.is_none() {
            let expected = t.expected[t.stage.index()].as_secs_f64();
            let elapsed = t.stage_started.elapsed().as_secs_f64();
            let fraction = (1.0 - (-CURVE_RATE * elapsed / expected).exp()).min(0.99);
            let value = t.stage.start() + t.stage.share() * fraction;
            t.reached = t.reached.max(value).min(RUNNING_CAP);
        }
        self.publish(&mut t, ProgressStatus::Running, false);
    }

    /// The only way progress reaches 100.
    pub fn complete(&self) {
        let mut t = self.lock();
        if t.finished {
            return;
        }
        t.reached = 100.0;
        t.stage = Stage::Finalize;
        t.finished = true;
        self.publish(&mut t, ProgressStatus::Completed, true);
    }

    pub fn fail(&self) {
        self.terminate(ProgressStatus::Failed);
    }

    pub fn cancel(&self) {
        self.terminate(ProgressStatus::Cancelled);
    }

    fn terminate(&self, status: ProgressStatus) {
        let mut t = self.lock();
        if t.finished {
            return;
        }
        t.finished = true;
        self.publish(&mut t, status, true);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, t: &mut Tracker, status: ProgressStatus, force: bool) {
        let now = Instant::now();
        if !force
            && t
                .last_publish
                .is_some_and(|last| now.duration_since(last) < self.publish_interval)
        {
            return;
        }
        t.last_publish = Some(now);
        let eta = match status {
            ProgressStatus::Running => Some(eta_seconds(t)),
            _ => Some(0.0),
        };
        let event = ProgressEvent {
            job_id: self.job_id.clone(),
            progress: t.reached,
            stage: t.stage,
            status,
            eta_seconds: eta,
        };
        trace!("progress {} {:.1}% {:?}", self.job_id, event.progress, event.stage);
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

fn eta_seconds(t: &Tracker) -> f64 {
    let idx = t.stage.index();
    let elapsed = t.stage_started.elapsed().as_secs_f64();
    let current = match t.work {
        Some((done, total)) if done > 0 => elapsed / done as f64 * (total - done) as f64,
        _ => (t.expected[idx].as_secs_f64() - elapsed).max(0.5),
    };
    let later: f64 = t.expected[idx + 1..].iter().map(Duration::as_secs_f64).sum();
    current + later
}
