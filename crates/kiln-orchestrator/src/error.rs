// Error types for orchestration

use crate::config::ConfigError;
use kiln_store::StoreError;
use kiln_training::{Stage, TrainingError, TrainingJobId};
use serde::Serialize;
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Coarse classification of an error for callers that map errors to
/// protocol status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    BadRequest,
    NotFound,
    Conflict,
    Store,
    Backend,
    Internal,
}

impl ErrorKind {
    /// HTTP-style status code for this kind.
    #[must_use]
    pub fn status_code(self) -> u16 {
        match self {
            Self::Validation | Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Backend => 502,
            Self::Store => 503,
            Self::Internal => 500,
        }
    }
}

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Out-of-range config, malformed model or credential. Nothing was changed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A required argument is missing.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Another writer already owns the job.
    #[error("Job {0} is already running")]
    AlreadyRunning(TrainingJobId),

    #[error("Illegal stage transition: {from} -> {to}")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("Store error: {0}")]
    Store(#[source] StoreError),

    /// Analysis, training backend or registry failure.
    #[error("Backend error: {0}")]
    Backend(#[source] TrainingError),

    /// Dataset analysis failed; the job is stored as `Failed`.
    #[error("Analysis of job {job_id} failed: {source}")]
    AnalysisFailed {
        job_id: TrainingJobId,
        #[source]
        source: TrainingError,
    },

    #[error("Orchestration cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestrationError {
    /// Job left behind by the failed operation, if one was created.
    #[must_use]
    pub fn job_id(&self) -> Option<&TrainingJobId> {
        match self {
            Self::AnalysisFailed { job_id, .. } | Self::AlreadyRunning(job_id) => Some(job_id),
            _ => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyRunning(_) | Self::InvalidTransition { .. } => ErrorKind::Conflict,
            Self::Store(_) => ErrorKind::Store,
            Self::Backend(_) | Self::AnalysisFailed { .. } => ErrorKind::Backend,
            Self::Cancelled | Self::Config(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<StoreError> for OrchestrationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            other => Self::Store(other),
        }
    }
}

impl From<TrainingError> for OrchestrationError {
    fn from(err: TrainingError) -> Self {
        match err {
            TrainingError::InvalidConfig(_)
            | TrainingError::InvalidModelSpec(_)
            | TrainingError::InvalidCredential(_) => Self::Validation(err.to_string()),
            TrainingError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            other => Self::Backend(other),
        }
    }
}
