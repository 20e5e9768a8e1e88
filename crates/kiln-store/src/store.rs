//! The persistence contract consumed by the orchestrator.

use crate::error::{StoreError, StoreResult};
use crate::memory::InMemoryJobStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_training::{
    DeploymentRecord, EpochRecord, JobUpdate, ModelRecord, ModelSpec, ModelStatusUpdate, NewTrainingJob, Stage,
    TrainingJob, TrainingJobId,
};
use std::sync::Arc;
use tracing::warn;

/// Durable storage of models, jobs, epoch history and deployment attempts.
///
/// Implementations guarantee read-your-writes for a single job id. Nothing
/// is atomic across calls: an epoch may be appended while the following job
/// update fails. The two deployment calls are the exception, each is a
/// single atomic step.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Registers the model if it is unknown and returns its stored record.
    async fn ensure_model(&self, spec: &ModelSpec) -> StoreResult<ModelRecord>;

    async fn read_model(&self, model_id: &str) -> StoreResult<ModelRecord>;

    async fn update_model_status(&self, model_id: &str, update: &ModelStatusUpdate) -> StoreResult<ModelRecord>;

    async fn create_job(&self, job: &NewTrainingJob) -> StoreResult<TrainingJob>;

    async fn read_job(&self, id: &TrainingJobId) -> StoreResult<TrainingJob>;

    /// Applies a partial update and returns the new snapshot.
    ///
    /// A stage change must be legal from the stored stage; repeating the
    /// stored stage is accepted so an update can be retried, except for
    /// `Deploying`, which is only entered through [`JobStore::begin_deployment`].
    async fn update_job(&self, id: &TrainingJobId, update: &JobUpdate) -> StoreResult<TrainingJob>;

    /// Appends the next epoch of a job.
    ///
    /// Fails with `Duplicate` if the epoch number is already stored and with
    /// `InvalidData` if it would leave a gap.
    async fn append_epoch(&self, record: &EpochRecord) -> StoreResult<()>;

    /// Epoch history of a job in epoch order.
    async fn list_epochs(&self, id: &TrainingJobId) -> StoreResult<Vec<EpochRecord>>;

    /// Moves a deployable job to `Deploying` as the only active attempt.
    ///
    /// A job already in `Deploying` is taken over only if its last update is
    /// older than `abandoned_before`; otherwise the call fails with
    /// `Conflict`.
    async fn begin_deployment(&self, id: &TrainingJobId, abandoned_before: DateTime<Utc>) -> StoreResult<TrainingJob>;

    /// Stores a finished deployment attempt and moves its job to `Deployed`
    /// or `DeployFailed`. A successful attempt also marks the model deployed.
    async fn finish_deployment(&self, record: &DeploymentRecord) -> StoreResult<TrainingJob>;

    /// Deployment attempts of a job, oldest first.
    async fn list_deployments(&self, id: &TrainingJobId) -> StoreResult<Vec<DeploymentRecord>>;
}

/// Applies `update` to `job` under the rules every store enforces.
pub(crate) fn apply_job_update(job: &mut TrainingJob, update: &JobUpdate) -> StoreResult<()> {
    if let Some(to) = update.stage {
        let repeat = to == job.stage && to != Stage::Deploying;
        if !repeat && !job.stage.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { from: job.stage, to });
        }
    }
    job.apply(update).map_err(StoreError::InvalidData)
}

/// Moves `job` to `Deploying` unless a live attempt already holds it.
pub(crate) fn claim_deployment(job: &mut TrainingJob, abandoned_before: DateTime<Utc>) -> StoreResult<()> {
    if job.stage != Stage::Deploying {
        return apply_job_update(job, &JobUpdate::stage(Stage::Deploying));
    }
    if job.updated_at >= abandoned_before {
        return Err(StoreError::Conflict(format!("job {} is already being deployed", job.id)));
    }
    warn!(job_id = %job.id, since = %job.updated_at, "taking over abandoned deployment");
    job.apply(&JobUpdate::stage(Stage::Deploying)).map_err(StoreError::InvalidData)
}

/// Stage a job ends in once `record` is stored.
pub(crate) fn deployment_outcome(record: &DeploymentRecord) -> JobUpdate {
    JobUpdate::stage(if record.success { Stage::Deployed } else { Stage::DeployFailed })
}

/// Model update stored with a successful deployment.
pub(crate) fn deployed_model(record: &DeploymentRecord) -> ModelStatusUpdate {
    ModelStatusUpdate::deployed(record.repository.clone(), record.deployed_at)
}

/// Checks that `epoch` is the next epoch of `job` given its last stored one.
pub(crate) fn check_next_epoch(job: &TrainingJob, last_stored: u32, epoch: u32) -> StoreResult<()> {
    if epoch == 0 || epoch > job.total_epochs {
        return Err(StoreError::InvalidData(format!(
            "epoch {epoch} outside 1..={} for job {}",
            job.total_epochs, job.id
        )));
    }
    if epoch <= last_stored {
        return Err(StoreError::Duplicate(format!("epoch {epoch} of job {}", job.id)));
    }
    if epoch != last_stored + 1 {
        return Err(StoreError::InvalidData(format!(
            "epoch {epoch} of job {} would leave a gap after epoch {last_stored}",
            job.id
        )));
    }
    Ok(())
}

/// Routes each job to the durable store or to the process-local ephemeral
/// store used in degraded mode, based on the job id.
#[derive(Clone)]
pub struct JobStores {
    durable: Arc<dyn JobStore>,
    ephemeral: Arc<dyn JobStore>,
}

impl JobStores {
    #[must_use]
    pub fn new(durable: Arc<dyn JobStore>) -> Self {
        Self { durable, ephemeral: Arc::new(InMemoryJobStore::ephemeral()) }
    }

    #[must_use]
    pub fn durable(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.durable)
    }

    #[must_use]
    pub fn ephemeral(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.ephemeral)
    }

    /// Store that owns `id`.
    #[must_use]
    pub fn for_job(&self, id: &TrainingJobId) -> Arc<dyn JobStore> {
        if id.is_ephemeral() { self.ephemeral() } else { self.durable() }
    }
}

impl std::fmt::Debug for JobStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStores").finish_non_exhaustive()
    }
}
