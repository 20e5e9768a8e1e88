use crate::error::{OrchestrationError, Result};
use chrono::{DateTime, Utc};
use kiln_store::JobStores;
use kiln_training::{DeploymentRecord, EpochRecord, MetricsSummary, Stage, TrainingJob, TrainingJobId};
use serde::{Deserialize, Serialize};

/// Point-in-time view of a job as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: TrainingJobId,
    pub model_id: String,
    pub stage: Stage,
    pub current_epoch: u32,
    pub total_epochs: u32,
    pub progress: u8,
    /// Training is over and no deployment is in flight.
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// False for jobs running in degraded mode; they vanish with the process.
    pub durable: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<TrainingJob> for JobStatus {
    fn from(job: TrainingJob) -> Self {
        Self {
            durable: !job.id.is_ephemeral(),
            terminal: job.stage.is_settled(),
            job_id: job.id,
            model_id: job.model_id,
            stage: job.stage,
            current_epoch: job.current_epoch,
            total_epochs: job.total_epochs,
            progress: job.progress,
            metrics: job.final_metrics,
            error: job.error,
            updated_at: job.updated_at,
        }
    }
}

/// Read-side queries over job state.
///
/// Every call reads the store, never an in-process cache, so a reporter in
/// another process sees what the epoch loop has persisted.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    stores: JobStores,
}

impl StatusReporter {
    #[must_use]
    pub fn new(stores: JobStores) -> Self {
        Self { stores }
    }

    pub async fn get_status(&self, job_id: Option<&str>) -> Result<JobStatus> {
        let id = require_id(job_id)?;
        let job = self.stores.for_job(&id).read_job(&id).await?;
        Ok(JobStatus::from(job))
    }

    /// Epoch records of a job in epoch order.
    pub async fn get_history(&self, job_id: Option<&str>) -> Result<Vec<EpochRecord>> {
        let id = require_id(job_id)?;
        Ok(self.stores.for_job(&id).list_epochs(&id).await?)
    }

    /// Every deployment attempt of a job, oldest first.
    pub async fn get_deployments(&self, job_id: Option<&str>) -> Result<Vec<DeploymentRecord>> {
        let id = require_id(job_id)?;
        let store = self.stores.for_job(&id);
        store.read_job(&id).await?;
        Ok(store.list_deployments(&id).await?)
    }
}

fn require_id(job_id: Option<&str>) -> Result<TrainingJobId> {
    match job_id.map(str::trim) {
        Some(id) if !id.is_empty() => Ok(TrainingJobId::from(id)),
        _ => Err(OrchestrationError::BadRequest("job id is required".to_string())),
    }
}
