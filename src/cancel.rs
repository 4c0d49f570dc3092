//! Cooperative cancellation.
//!
//! A job owns exactly one [`CancellationToken`]. Stages poll it at safe points
//! (between clusters, generations, episodes and persistence batches); work run
//! through [`CancellationToken::run_atomic`] is never interrupted, a request
//! arriving meanwhile is picked up by the first safe point after it.
//!
//! Job state lives in a single atomic so that "observe cancellation" and
//! "transition state" are one compare-and-swap, never two steps.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Halt, StageResult};

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum JobState {
    Created = 0,
    Running = 1,
    CancellationRequested = 2,
    Cancelled = 3,
    PartialSuccess = 4,
    Success = 5,
    Failed = 6,
}

impl JobState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => JobState::Created,
            1 => JobState::Running,
            2 => JobState::CancellationRequested,
            3 => JobState::Cancelled,
            4 => JobState::PartialSuccess,
            5 => JobState::Success,
            _ => JobState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Cancelled | JobState::PartialSuccess | JobState::Success | JobState::Failed
        )
    }
}

/// Escalation tier of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CancelTier {
    /// Finish the current atomic unit and keep safe partial artifacts.
    Soft = 1,
    /// Stop at the next safe point and discard partial results.
    Hard = 2,
    /// Process-level termination; recovery happens on the next run.
    Emergency = 3,
}

impl CancelTier {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(CancelTier::Soft),
            2 => Some(CancelTier::Hard),
            3 => Some(CancelTier::Emergency),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserRequested,
    Timeout,
    MemoryLimit,
    Error,
    SystemShutdown,
}

/// Result of [`CancellationToken::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Accepted,
    /// Same or lower tier already pending; nothing changed.
    AlreadyRequested,
    /// A pending request was raised to a higher tier.
    Escalated,
    AlreadyFinished(JobState),
}

#[derive(Debug)]
struct Inner {
    state: AtomicU8,
    tier: AtomicU8,
    reason: Mutex<Option<CancelReason>>,
    atomic_depth: AtomicUsize,
    deferred: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(JobState::Created as u8),
                tier: AtomicU8::new(0),
                reason: Mutex::new(None),
                atomic_depth: AtomicUsize::new(0),
                deferred: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: JobState, to: JobState) -> bool {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Created -> Running. False if the job was cancelled before it started.
    pub fn start(&self) -> bool {
        self.transition(JobState::Created, JobState::Running)
    }

    /// Requests cancellation. Repeating a request has no further effect,
    /// except that a higher tier escalates a pending one.
    pub fn request(&self, tier: CancelTier, reason: CancelReason) -> RequestOutcome {
        loop {
            let current = self.state();
            match current {
                s if s.is_terminal() => return RequestOutcome::AlreadyFinished(s),
                JobState::CancellationRequested => {
                    let prev = self.inner.tier.fetch_max(tier as u8, Ordering::SeqCst);
                    return if (tier as u8) > prev {
                        warn!("Cancellation escalated to {tier:?}");
                        RequestOutcome::Escalated
                    } else {
                        RequestOutcome::AlreadyRequested
                    };
                }
                _ => {
                    // tier and reason are published before the state flips
                    self.inner.tier.fetch_max(tier as u8, Ordering::SeqCst);
                    {
                        let mut guard = self.inner.reason.lock().unwrap_or_else(|p| p.into_inner());
                        guard.get_or_insert(reason);
                    }
                    if self.transition(current, JobState::CancellationRequested) {
                        warn!("Cancellation requested ({tier:?}, {reason:?})");
                        return RequestOutcome::Accepted;
                    }
                }
            }
        }
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.state() == JobState::CancellationRequested
    }

    pub fn tier(&self) -> Option<CancelTier> {
        CancelTier::from_u8(self.inner.tier.load(Ordering::SeqCst))
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.inner.reason.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Safe point. Inside an atomic section the request is only recorded.
    pub fn checkpoint(&self) -> Result<(), CancelTier> {
        if !self.is_cancellation_requested() {
            return Ok(());
        }
        if self.inner.atomic_depth.load(Ordering::SeqCst) > 0 {
            self.inner.deferred.store(true, Ordering::SeqCst);
            return Ok(());
        }
        Err(self.tier().unwrap_or(CancelTier::Hard))
    }

    /// [`checkpoint`](Self::checkpoint) lifted into a stage outcome.
    pub fn safe_point(&self) -> StageResult<()> {
        self.checkpoint().map_err(Halt::Cancelled)
    }

    /// Runs a non-cancelable unit of work.
    pub fn run_atomic<R>(&self, work: impl FnOnce() -> R) -> R {
        let _guard = AtomicSection::enter(self);
        work()
    }

    pub fn in_atomic_section(&self) -> bool {
        self.inner.atomic_depth.load(Ordering::SeqCst) > 0
    }

    /// Moves the job into a terminal state in one step.
    ///
    /// A pending cancellation overrides `target`: a timeout ends `Failed`,
    /// a soft request keeps completed work as `PartialSuccess`, anything
    /// else ends `Cancelled`. Returns the state actually reached.
    pub fn finish(&self, target: JobState) -> JobState {
        debug_assert!(target.is_terminal());
        loop {
            let current = self.state();
            let next = match current {
                s if s.is_terminal() => return s,
                JobState::CancellationRequested => {
                    if self.reason() == Some(CancelReason::Timeout) {
                        JobState::Failed
                    } else if self.tier() == Some(CancelTier::Soft)
                        && matches!(target, JobState::Success | JobState::PartialSuccess)
                    {
                        JobState::PartialSuccess
                    } else {
                        JobState::Cancelled
                    }
                }
                _ => target,
            };
            if self.transition(current, next) {
                info!("Job state {current:?} -> {next:?}");
                return next;
            }
        }
    }
}

/// Guard marking a non-cancelable region.
pub struct AtomicSection<'a> {
    token: &'a CancellationToken,
}

impl<'a> AtomicSection<'a> {
    pub fn enter(token: &'a CancellationToken) -> Self {
        token.inner.atomic_depth.fetch_add(1, Ordering::SeqCst);
        Self { token }
    }
}

impl Drop for AtomicSection<'_> {
    fn drop(&mut self) {
        let depth = self.token.inner.atomic_depth.fetch_sub(1, Ordering::SeqCst);
        if depth == 1 && self.token.inner.deferred.swap(false, Ordering::SeqCst) {
            debug!("Deferred cancellation released at end of atomic section");
        }
    }
}
