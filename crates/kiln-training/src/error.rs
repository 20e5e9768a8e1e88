use crate::stage::Stage;
use std::time::Duration;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid training config: {0}")]
    InvalidConfig(String),

    #[error("invalid model spec: {0}")]
    InvalidModelSpec(String),

    #[error("invalid deployment credential: {0}")]
    InvalidCredential(String),

    #[error("illegal stage transition: {from} -> {to}")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("analysis failed: {0}")]
    Analysis(String),

    #[error("training backend error: {0}")]
    Backend(String),

    #[error("artifact registry error: {0}")]
    Registry(String),

    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    /// Whether a failed epoch step is worth repeating under a retry policy.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Timeout(_) | Self::Http(_))
    }
}
