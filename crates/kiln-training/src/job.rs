use crate::error::{TrainingError, TrainingResult};
use crate::metrics::MetricsSummary;
use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix marking jobs that live only in the ephemeral (degraded-mode) store.
pub const EPHEMERAL_JOB_PREFIX: &str = "ephemeral-";

/// Identifier for a training job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrainingJobId(pub String);

impl TrainingJobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Id for a job that is not durably persisted.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self(format!("{EPHEMERAL_JOB_PREFIX}{}", Uuid::new_v4()))
    }

    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.0.starts_with(EPHEMERAL_JOB_PREFIX)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TrainingJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TrainingJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TrainingJobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    #[default]
    Supervised,
    Reinforcement,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CreationMode {
    #[default]
    FineTune,
    FromScratch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeClass {
    #[default]
    Cpu,
    Gpu,
    Tpu,
}

impl ComputeClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Tpu => "tpu",
        }
    }
}

/// The model being trained, as declared by its owner.
///
/// Owned by the model registry; the orchestrator only references it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub user_id: String,
    /// Display name; also the source of the deployment repository name.
    pub name: String,
    /// Base model for fine-tuning (e.g. "bert-base-uncased").
    #[serde(default)]
    pub base_model: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub training_mode: TrainingMode,
    #[serde(default)]
    pub creation_mode: CreationMode,
    #[serde(default)]
    pub compute: ComputeClass,
    #[serde(default = "default_target_column")]
    pub target_column: String,
    /// Dataset is discovered by the platform rather than uploaded.
    #[serde(default)]
    pub auto_find_dataset: bool,
}

fn default_task_type() -> String {
    "classification".to_string()
}

fn default_target_column() -> String {
    "label".to_string()
}

impl ModelSpec {
    #[must_use]
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            name: name.into(),
            base_model: String::new(),
            task_type: default_task_type(),
            training_mode: TrainingMode::default(),
            creation_mode: CreationMode::default(),
            compute: ComputeClass::default(),
            target_column: default_target_column(),
            auto_find_dataset: false,
        }
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.id.trim().is_empty() {
            return Err(TrainingError::InvalidModelSpec("model id is required".to_string()));
        }
        if self.user_id.trim().is_empty() {
            return Err(TrainingError::InvalidModelSpec("user id is required".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(TrainingError::InvalidModelSpec("model name is required".to_string()));
        }
        Ok(())
    }
}

/// Hyperparameters for one training job. A new job is needed to change them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub epochs: u32,
    pub batch_size: u32,
    pub learning_rate: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self { epochs: 10, batch_size: 32, learning_rate: 0.001 }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.epochs == 0 {
            return Err(TrainingError::InvalidConfig("epochs must be >= 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::InvalidConfig("batch_size must be >= 1".to_string()));
        }
        if !(self.learning_rate.is_finite()) || self.learning_rate <= 0.0 {
            return Err(TrainingError::InvalidConfig("learning_rate must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Percentage of `total` epochs completed after `current`, rounded half away from zero.
#[must_use]
pub fn progress_percent(current: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (f64::from(current.min(total)) / f64::from(total) * 100.0).round();
    pct as u8
}

/// Durable view of a training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJob {
    pub id: TrainingJobId,
    pub model_id: String,
    pub user_id: String,
    pub stage: Stage,
    pub total_epochs: u32,
    pub current_epoch: u32,
    /// Always `progress_percent(current_epoch, total_epochs)`.
    pub progress: u8,
    #[serde(default)]
    pub final_metrics: Option<MetricsSummary>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrainingJob {
    #[must_use]
    pub fn from_new(id: TrainingJobId, new: &NewTrainingJob) -> Self {
        let now = Utc::now();
        Self {
            id,
            model_id: new.model_id.clone(),
            user_id: new.user_id.clone(),
            stage: new.stage,
            total_epochs: new.total_epochs,
            current_epoch: 0,
            progress: 0,
            final_metrics: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Applies a partial update, keeping the epoch counters consistent.
    ///
    /// Rejects updates that would move `current_epoch` backwards or past
    /// `total_epochs`. Stage legality is the caller's concern.
    pub fn apply(&mut self, update: &JobUpdate) -> Result<(), String> {
        let total = update.total_epochs.unwrap_or(self.total_epochs);
        let current = update.current_epoch.unwrap_or(self.current_epoch);

        if current < self.current_epoch {
            return Err(format!(
                "current_epoch may not decrease ({} -> {current})",
                self.current_epoch
            ));
        }
        if current > total {
            return Err(format!("current_epoch {current} exceeds total_epochs {total}"));
        }

        if let Some(stage) = update.stage {
            self.stage = stage;
        }
        self.total_epochs = total;
        self.current_epoch = current;
        self.progress = progress_percent(current, total);
        if let Some(metrics) = update.final_metrics {
            self.final_metrics = Some(metrics);
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Fields needed to create a job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTrainingJob {
    pub model_id: String,
    pub user_id: String,
    pub stage: Stage,
    pub total_epochs: u32,
}

impl NewTrainingJob {
    #[must_use]
    pub fn for_model(model: &ModelSpec) -> Self {
        Self {
            model_id: model.id.clone(),
            user_id: model.user_id.clone(),
            stage: Stage::Analyzing,
            total_epochs: 0,
        }
    }
}

/// Partial update of a job record; `None` leaves a field untouched.
///
/// Progress is never set directly; it follows from the epoch counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub stage: Option<Stage>,
    pub total_epochs: Option<u32>,
    pub current_epoch: Option<u32>,
    pub final_metrics: Option<MetricsSummary>,
    pub error: Option<String>,
}

impl JobUpdate {
    #[must_use]
    pub fn stage(stage: Stage) -> Self {
        Self { stage: Some(stage), ..Self::default() }
    }

    #[must_use]
    pub fn epoch(current_epoch: u32) -> Self {
        Self { current_epoch: Some(current_epoch), ..Self::default() }
    }

    #[must_use]
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
