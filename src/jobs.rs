//! Job lifecycle on top of the orchestrator.
//!
//! Each submitted job gets its own cancellation token and progress channel.
//! The pipeline runs on the blocking pool under an overall timeout while a
//! ticker task keeps time-based progress moving. Successful schedules are
//! archived per organization, semester and scope; the archive is what the
//! incremental strategy compares new data against.

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::cancel::{CancelReason, CancelTier, CancellationToken, JobState, RequestOutcome};
use crate::config::EngineConfig;
use crate::context::StageContext;
use crate::data::{Assignment, BatchId, DepartmentId, Snapshot};
use crate::error::{EngineError, ErrorReport, Halt, Result, StageResult};
use crate::hardware::{HardwareProfile, Strategy};
use crate::learning::PolicySource;
use crate::learning::store::PolicyStore;
use crate::memory::MemoryMonitor;
use crate::orchestrator::{Orchestrator, RunInput, RunReport, SolutionVariant};
use crate::progress::{ProgressEvent, ProgressReporter, Stage};
use crate::provider::{CachingProvider, DataProvider};
use crate::resolver::ResolutionReport;

/// A scheduling request. `job_id` is the caller's idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub job_id: String,
    pub organization_id: String,
    pub semester: String,
    pub academic_year: String,
    #[serde(default)]
    pub department_id: Option<DepartmentId>,
    #[serde(default)]
    pub batch_id: Option<BatchId>,
}

impl JobRequest {
    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("jobId", &self.job_id),
            ("organizationId", &self.organization_id),
            ("semester", &self.semester),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::InvalidInput(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }

    fn archive_key(&self) -> ArchiveKey {
        ArchiveKey {
            organization: self.organization_id.clone(),
            semester: self.semester.clone(),
            department: self.department_id,
            batch: self.batch_id,
        }
    }

    /// Restricts the snapshot to the requested department and batch.
    fn scope(&self, snapshot: Snapshot) -> Result<Snapshot> {
        if self.department_id.is_none() && self.batch_id.is_none() {
            return Ok(snapshot);
        }
        let mut data = snapshot.data().clone();
        data.courses.retain(|c| {
            self.department_id.is_none_or(|d| c.department_id == d)
                && self.batch_id.is_none_or(|b| c.batch_ids.contains(&b))
        });
        if data.courses.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "no courses in scope (department {:?}, batch {:?})",
                self.department_id, self.batch_id
            )));
        }
        Ok(Snapshot::from(data))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ArchiveKey {
    organization: String,
    semester: String,
    department: Option<DepartmentId>,
    batch: Option<BatchId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Submission {
    Accepted,
    /// A job with this id already exists; nothing new was started.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub job_id: String,
    pub submission: Submission,
    pub state: JobState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub progress: f64,
    pub stage: Stage,
    pub cancel_tier: Option<CancelTier>,
    pub cancel_reason: Option<CancelReason>,
}

/// What a finished job hands back. Variants are only present for
/// `success` and `partial_success`; `error` only for `failed`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_id: String,
    pub state: JobState,
    pub partial: bool,
    pub strategy: Option<Strategy>,
    pub variants: Vec<SolutionVariant>,
    pub resolution: Option<ResolutionReport>,
    pub policy_source: Option<PolicySource>,
    pub error: Option<ErrorReport>,
}

impl JobResult {
    fn empty(job_id: &str, state: JobState) -> Self {
        Self {
            job_id: job_id.to_string(),
            state,
            partial: false,
            strategy: None,
            variants: Vec::new(),
            resolution: None,
            policy_source: None,
            error: None,
        }
    }
}

/// Called when an emergency cancellation is accepted.
pub type EmergencyHook = Box<dyn Fn(&str) + Send + Sync>;

struct JobEntry {
    request: JobRequest,
    token: CancellationToken,
    progress: Arc<ProgressReporter>,
    result: Mutex<Option<JobResult>>,
    done: watch::Sender<bool>,
}

impl JobEntry {
    fn result(&self) -> Option<JobResult> {
        self.result.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

struct Shared {
    config: EngineConfig,
    provider: Arc<CachingProvider<Arc<dyn DataProvider>>>,
    orchestrator: Orchestrator,
    memory: Option<Arc<MemoryMonitor>>,
    jobs: Mutex<HashMap<String, Arc<JobEntry>>>,
    // terminal job ids, oldest first
    finished: Mutex<VecDeque<String>>,
    archive: Mutex<HashMap<ArchiveKey, Assignment>>,
    emergency: Option<EmergencyHook>,
}

/// Cheap to clone; all clones share the same jobs.
#[derive(Clone)]
pub struct JobManager {
    shared: Arc<Shared>,
}

pub struct JobManagerBuilder {
    profile: HardwareProfile,
    config: EngineConfig,
    provider: Arc<dyn DataProvider>,
    store: Arc<dyn PolicyStore>,
    memory: Option<Arc<MemoryMonitor>>,
    emergency: Option<EmergencyHook>,
}

impl JobManagerBuilder {
    pub fn memory(mut self, monitor: Arc<MemoryMonitor>) -> Self {
        self.memory = Some(monitor);
        self
    }

    pub fn on_emergency(mut self, hook: EmergencyHook) -> Self {
        self.emergency = Some(hook);
        self
    }

    pub fn build(self) -> Result<JobManager> {
        self.config.validate()?;
        let provider = Arc::new(CachingProvider::new(self.provider, &self.config.cache, &self.config.job));
        if let Some(monitor) = &self.memory {
            let weak = Arc::downgrade(&provider);
            monitor.register(
                "data-cache",
                Box::new(move |level| {
                    if let Some(provider) = weak.upgrade() {
                        provider.relieve(level);
                    }
                }),
            );
        }
        let orchestrator = Orchestrator::new(self.profile, self.config.clone(), self.store)?;
        info!("Job manager ready: {:?}", self.profile);
        Ok(JobManager {
            shared: Arc::new(Shared {
                config: self.config,
                provider,
                orchestrator,
                memory: self.memory,
                jobs: Mutex::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
                archive: Mutex::new(HashMap::new()),
                emergency: self.emergency,
            }),
        })
    }
}

impl JobManager {
    pub fn builder(
        profile: HardwareProfile,
        config: EngineConfig,
        provider: Arc<dyn DataProvider>,
        store: Arc<dyn PolicyStore>,
    ) -> JobManagerBuilder {
        JobManagerBuilder {
            profile,
            config,
            provider,
            store,
            memory: None,
            emergency: None,
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, Arc<JobEntry>>> {
        self.shared.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn entry(&self, job_id: &str) -> Option<Arc<JobEntry>> {
        self.jobs().get(job_id).cloned()
    }

    fn evict_finished(&self, jobs: &mut HashMap<String, Arc<JobEntry>>) {
        let retain = self.shared.config.job.retain_finished;
        let mut finished = self.shared.finished.lock().unwrap_or_else(|p| p.into_inner());
        while finished.len() > retain {
            if let Some(job_id) = finished.pop_front() {
                debug!("Evicting finished job {job_id}");
                jobs.remove(&job_id);
            }
        }
    }

    /// Starts a job unless one with the same id exists. Must be called from
    /// within a tokio runtime. Ids of evicted finished jobs may be reused.
    pub fn submit(&self, request: JobRequest) -> Result<SubmitReceipt> {
        request.validate()?;
        let entry = {
            let mut jobs = self.jobs();
            self.evict_finished(&mut jobs);
            if let Some(existing) = jobs.get(&request.job_id) {
                info!("Job {} already submitted, not starting it again", request.job_id);
                return Ok(SubmitReceipt {
                    job_id: request.job_id,
                    submission: Submission::Duplicate,
                    state: existing.token.state(),
                });
            }
            let progress = &self.shared.config.progress;
            let entry = Arc::new(JobEntry {
                token: CancellationToken::new(),
                progress: Arc::new(ProgressReporter::new(
                    request.job_id.clone(),
                    Duration::from_millis(progress.publish_interval_ms),
                    progress.channel_capacity,
                )),
                result: Mutex::new(None),
                done: watch::Sender::new(false),
                request,
            });
            jobs.insert(entry.request.job_id.clone(), Arc::clone(&entry));
            entry
        };
        info!(
            "Job {} submitted for {} / {} ({})",
            entry.request.job_id, entry.request.organization_id, entry.request.semester, entry.request.academic_year
        );
        tokio::spawn(drive(Arc::clone(&self.shared), Arc::clone(&entry)));
        Ok(SubmitReceipt {
            job_id: entry.request.job_id.clone(),
            submission: Submission::Accepted,
            state: entry.token.state(),
        })
    }

    /// Repeating a request is harmless; a higher tier escalates.
    pub fn cancel(&self, job_id: &str, reason: CancelReason, tier: CancelTier) -> Result<RequestOutcome> {
        let entry = self
            .entry(job_id)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown job '{job_id}'")))?;
        let outcome = entry.token.request(tier, reason);
        info!("Cancel {job_id} ({tier:?}, {reason:?}): {outcome:?}");
        if tier == CancelTier::Emergency && matches!(outcome, RequestOutcome::Accepted | RequestOutcome::Escalated) {
            error!("Emergency cancellation of job {job_id}");
            if let Some(hook) = &self.shared.emergency {
                hook(job_id);
            }
        }
        Ok(outcome)
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        let entry = self.entry(job_id)?;
        Some(JobStatus {
            job_id: job_id.to_string(),
            state: entry.token.state(),
            progress: entry.progress.current(),
            stage: entry.progress.stage(),
            cancel_tier: entry.token.tier(),
            cancel_reason: entry.token.reason(),
        })
    }

    /// `None` while the job runs or when it is unknown.
    pub fn result(&self, job_id: &str) -> Option<JobResult> {
        self.entry(job_id)?.result()
    }

    pub fn subscribe(&self, job_id: &str) -> Option<broadcast::Receiver<ProgressEvent>> {
        Some(self.entry(job_id)?.progress.subscribe())
    }

    /// Resolves once the job reaches a terminal state.
    pub async fn wait(&self, job_id: &str) -> Option<JobResult> {
        let entry = self.entry(job_id)?;
        let mut done = entry.done.subscribe();
        // the sender lives in the entry, so the channel cannot close here
        let _ = done.wait_for(|d| *d).await;
        entry.result()
    }

    pub fn has_prior_solution(&self, request: &JobRequest) -> bool {
        self.shared
            .archive
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&request.archive_key())
    }
}

async fn drive(shared: Arc<Shared>, entry: Arc<JobEntry>) {
    let job_id = entry.request.job_id.clone();
    let ticker = {
        let progress = Arc::clone(&entry.progress);
        let period = Duration::from_millis(shared.config.progress.publish_interval_ms.max(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                progress.tick();
            }
        })
    };

    let timeout = Duration::from_secs(shared.config.job.timeout_secs);
    let mut work = {
        let shared = Arc::clone(&shared);
        let entry = Arc::clone(&entry);
        tokio::task::spawn_blocking(move || run(&shared, &entry))
    };
    let joined = match tokio::time::timeout(timeout, &mut work).await {
        Ok(joined) => joined,
        Err(_) => {
            warn!("Job {job_id} exceeded {timeout:?}");
            entry.token.request(CancelTier::Hard, CancelReason::Timeout);
            // the pipeline stops at its next safe point
            let grace = Duration::from_millis(shared.config.job.cancel_grace_ms);
            match tokio::time::timeout(grace, &mut work).await {
                Ok(joined) => joined,
                Err(_) => {
                    // the blocking task is left to finish on its own; its outcome is ignored
                    error!("Job {job_id} did not reach a safe point within {grace:?}");
                    Ok(Err(Halt::Failed(EngineError::Timeout(format!(
                        "job exceeded {}s",
                        timeout.as_secs()
                    )))))
                }
            }
        }
    };
    let outcome = joined.unwrap_or_else(|e| Err(Halt::Failed(EngineError::Internal(format!("job task: {e}")))));
    ticker.abort();

    let result = conclude(&shared, &entry, outcome, timeout);
    info!("Job {job_id} finished: {:?}", result.state);
    *entry.result.lock().unwrap_or_else(|p| p.into_inner()) = Some(result);
    shared
        .finished
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .push_back(job_id);
    entry.done.send_replace(true);
}

/// The blocking part of a job: load, then the pipeline.
fn run(shared: &Shared, entry: &JobEntry) -> StageResult<RunReport> {
    let token = &entry.token;
    if !token.start() {
        return Err(Halt::Cancelled(token.tier().unwrap_or(CancelTier::Hard)));
    }
    let mut ctx = StageContext::new(token, &entry.progress);
    if let Some(memory) = &shared.memory {
        ctx = ctx.with_memory(memory);
    }

    let request = &entry.request;
    entry.progress.enter_stage(Stage::Load);
    let snapshot = shared.provider.snapshot(&request.organization_id, &request.semester)?;
    let snapshot = request.scope(snapshot)?;
    ctx.safe_point()?;
    let prior = shared
        .archive
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .get(&request.archive_key())
        .cloned();
    entry.progress.advance(1, 1);

    shared.orchestrator.run(
        &ctx,
        &RunInput {
            institution: request.organization_id.clone(),
            snapshot: Arc::new(snapshot),
            prior,
        },
    )
}

/// Moves the job into its terminal state and builds the handoff.
fn conclude(shared: &Shared, entry: &JobEntry, outcome: StageResult<RunReport>, timeout: Duration) -> JobResult {
    let job_id = entry.request.job_id.as_str();
    let target = match &outcome {
        Ok(report) if report.partial => JobState::PartialSuccess,
        Ok(_) => JobState::Success,
        Err(Halt::Cancelled(_)) => JobState::Cancelled,
        Err(Halt::Failed(_)) => JobState::Failed,
    };
    let state = entry.token.finish(target);
    let mut result = JobResult::empty(job_id, state);

    match (state, outcome) {
        (JobState::Success | JobState::PartialSuccess, Ok(report)) => {
            if state == JobState::Success {
                shared
                    .archive
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(entry.request.archive_key(), report_assignment(&report));
            }
            result.partial = state == JobState::PartialSuccess;
            result.strategy = Some(report.strategy);
            result.variants = report.variants;
            result.resolution = Some(report.resolution);
            result.policy_source = report.policy_source;
            entry.progress.complete();
        }
        (JobState::Failed, outcome) => {
            let err = if entry.token.reason() == Some(CancelReason::Timeout) {
                EngineError::Timeout(format!("job exceeded {}s", timeout.as_secs()))
            } else {
                match outcome {
                    Err(Halt::Failed(e)) => e,
                    _ => EngineError::Internal("job failed without an error".into()),
                }
            };
            error!("Job {job_id} failed: {err}");
            result.error = Some(err.report());
            entry.progress.fail();
        }
        _ => {
            // cancelled: whatever was produced is dropped
            entry.progress.cancel();
        }
    }
    result
}

fn report_assignment(report: &RunReport) -> Assignment {
    report
        .best()
        .map(|v| v.solution.assignment.clone())
        .unwrap_or_default()
}
