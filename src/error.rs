//! Error types for the timetable engine.
//!
//! `EngineError` carries the failure taxonomy every stage reports through.
//! Cooperative cancellation is deliberately not part of it; see [`Halt`].

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::cancel::CancelTier;
use crate::data::SessionKey;

/// Main error type of the engine.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Hard constraints of a cluster cannot be satisfied.
    #[error("Infeasible cluster {cluster}: {unplaced} session(s) could not be placed")]
    InfeasibleCluster {
        cluster: usize,
        unplaced: usize,
        sessions: Vec<SessionKey>,
    },

    /// A stage or the whole job ran past its time budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Memory pressure stayed critical after emergency cleanup.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Data provider call failed after bounded retries.
    #[error("Transient data error: {0}")]
    TransientDataError(String),

    /// Snapshot or configuration rejected before the run.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The exact ILP backend failed for a reason other than infeasibility.
    #[error("Solver error: {0}")]
    Solver(String),

    /// Policy store I/O or (de)serialization failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Serializable error category exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InfeasibleCluster,
    Timeout,
    ResourceExhausted,
    TransientDataError,
    InvalidInput,
    Solver,
    Persistence,
    Internal,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InfeasibleCluster { .. } => ErrorKind::InfeasibleCluster,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            EngineError::TransientDataError(_) => ErrorKind::TransientDataError,
            EngineError::InvalidInput(_) => ErrorKind::InvalidInput,
            EngineError::Solver(_) => ErrorKind::Solver,
            EngineError::Persistence(_) => ErrorKind::Persistence,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// User-visible projection: kind and message only.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

/// What callers see when a job fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

/// Why a stage stopped before completing.
#[derive(Debug, Clone)]
pub enum Halt {
    /// A cancellation request was observed at a safe point.
    Cancelled(CancelTier),
    Failed(EngineError),
}

impl From<EngineError> for Halt {
    fn from(e: EngineError) -> Self {
        Halt::Failed(e)
    }
}

/// Outcome of a stage: `Ok` is the completed arm.
pub type StageResult<T> = std::result::Result<T, Halt>;
