//! HTTP adapter over the job manager.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde::Deserialize;

use crate::cancel::{CancelReason, CancelTier, RequestOutcome};
use crate::config::ServerConfig;
use crate::error::{EngineError, ErrorKind, ErrorReport, Result};
use crate::jobs::{JobManager, JobRequest, JobResult, JobStatus, Submission, SubmitReceipt};

struct ApiError(StatusCode, ErrorReport);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match e.kind() {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.report())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

fn not_found(job_id: &str) -> ApiError {
    ApiError(
        StatusCode::NOT_FOUND,
        ErrorReport {
            kind: ErrorKind::InvalidInput,
            message: format!("unknown job '{job_id}'"),
        },
    )
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    #[serde(default = "default_reason")]
    reason: CancelReason,
    #[serde(default = "default_tier")]
    tier: CancelTier,
}

fn default_reason() -> CancelReason {
    CancelReason::UserRequested
}

fn default_tier() -> CancelTier {
    CancelTier::Hard
}

async fn submit_handler(
    State(jobs): State<JobManager>,
    Json(request): Json<JobRequest>,
) -> std::result::Result<(StatusCode, Json<SubmitReceipt>), ApiError> {
    let receipt = jobs.submit(request)?;
    let status = match receipt.submission {
        Submission::Accepted => StatusCode::ACCEPTED,
        Submission::Duplicate => StatusCode::OK,
    };
    Ok((status, Json(receipt)))
}

async fn status_handler(
    State(jobs): State<JobManager>,
    Path(job_id): Path<String>,
) -> std::result::Result<Json<JobStatus>, ApiError> {
    jobs.status(&job_id).map(Json).ok_or_else(|| not_found(&job_id))
}

async fn result_handler(State(jobs): State<JobManager>, Path(job_id): Path<String>) -> Response {
    match (jobs.result(&job_id), jobs.status(&job_id)) {
        (Some(result), _) => Json::<JobResult>(result).into_response(),
        // still running: report progress instead
        (None, Some(status)) => (StatusCode::ACCEPTED, Json(status)).into_response(),
        (None, None) => not_found(&job_id).into_response(),
    }
}

async fn cancel_handler(
    State(jobs): State<JobManager>,
    Path(job_id): Path<String>,
    body: Option<Json<CancelBody>>,
) -> std::result::Result<Json<RequestOutcome>, ApiError> {
    if jobs.status(&job_id).is_none() {
        return Err(not_found(&job_id));
    }
    let (reason, tier) = body.map_or((default_reason(), default_tier()), |Json(b)| (b.reason, b.tier));
    Ok(Json(jobs.cancel(&job_id, reason, tier)?))
}

pub fn router(jobs: JobManager) -> Router {
    Router::new()
        .route("/v1/jobs", post(submit_handler))
        .route("/v1/jobs/:id", get(status_handler))
        .route("/v1/jobs/:id/result", get(result_handler))
        .route("/v1/jobs/:id/cancel", post(cancel_handler))
        .with_state(jobs)
}

pub async fn run_server(config: &ServerConfig, jobs: JobManager) -> Result<()> {
    let app = router(jobs);
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .map_err(|e| EngineError::InvalidInput(format!("binding {}: {e}", config.bind)))?;
    let addr = listener
        .local_addr()
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    info!("Server running at http://{addr}");
    axum::serve(listener, app)
        .await
        .map_err(|e| EngineError::Internal(format!("server: {e}")))
}
