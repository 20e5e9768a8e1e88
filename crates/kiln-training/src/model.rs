use crate::job::{ModelSpec, TrainingConfig};
use crate::metrics::MetricsSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Training status of a model as seen by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Registered,
    Training,
    Completed,
    Failed,
    Cancelled,
    Deployed,
}

impl ModelStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Training => "training",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Deployed => "deployed",
        }
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(Self::Registered),
            "training" => Ok(Self::Training),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "deployed" => Ok(Self::Deployed),
            other => Err(format!("unknown model status: {other}")),
        }
    }
}

/// Stored status of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model_id: String,
    pub user_id: String,
    pub name: String,
    pub status: ModelStatus,
    #[serde(default)]
    pub training_config: Option<TrainingConfig>,
    #[serde(default)]
    pub metrics: Option<MetricsSummary>,
    /// Registry repository of the latest successful deployment.
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub deployed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ModelRecord {
    #[must_use]
    pub fn registered(spec: &ModelSpec) -> Self {
        Self {
            model_id: spec.id.clone(),
            user_id: spec.user_id.clone(),
            name: spec.name.clone(),
            status: ModelStatus::Registered,
            training_config: None,
            metrics: None,
            repository: None,
            deployed_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Applies a status update; absent optional fields keep their value.
    pub fn apply(&mut self, update: &ModelStatusUpdate) {
        self.status = update.status;
        if let Some(config) = update.training_config {
            self.training_config = Some(config);
        }
        if let Some(metrics) = update.metrics {
            self.metrics = Some(metrics);
        }
        if let Some(repository) = &update.repository {
            self.repository = Some(repository.clone());
        }
        if let Some(at) = update.deployed_at {
            self.deployed_at = Some(at);
        }
        self.updated_at = Utc::now();
    }
}

/// New status for a model plus the fields that change with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatusUpdate {
    pub status: ModelStatus,
    pub training_config: Option<TrainingConfig>,
    pub metrics: Option<MetricsSummary>,
    pub repository: Option<String>,
    pub deployed_at: Option<DateTime<Utc>>,
}

impl ModelStatusUpdate {
    #[must_use]
    pub fn new(status: ModelStatus) -> Self {
        Self { status, training_config: None, metrics: None, repository: None, deployed_at: None }
    }

    #[must_use]
    pub fn training(config: TrainingConfig) -> Self {
        Self { training_config: Some(config), ..Self::new(ModelStatus::Training) }
    }

    #[must_use]
    pub fn completed(metrics: MetricsSummary) -> Self {
        Self { metrics: Some(metrics), ..Self::new(ModelStatus::Completed) }
    }

    #[must_use]
    pub fn deployed(repository: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            repository: Some(repository.into()),
            deployed_at: Some(at),
            ..Self::new(ModelStatus::Deployed)
        }
    }
}
