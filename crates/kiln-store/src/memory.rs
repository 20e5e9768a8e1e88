//! Process-local job store.
//!
//! Serves tests and the degraded mode; nothing survives the process.

use crate::error::{StoreError, StoreResult};
use crate::store::{JobStore, apply_job_update, check_next_epoch, claim_deployment, deployed_model, deployment_outcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_training::{
    DeploymentRecord, EpochRecord, JobUpdate, ModelRecord, ModelSpec, ModelStatusUpdate, NewTrainingJob,
    TrainingJob, TrainingJobId,
};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct State {
    models: HashMap<String, ModelRecord>,
    jobs: HashMap<TrainingJobId, TrainingJob>,
    epochs: HashMap<TrainingJobId, Vec<EpochRecord>>,
    deployments: Vec<DeploymentRecord>,
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<State>,
    ephemeral_ids: bool,
}

impl InMemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose job ids carry the ephemeral prefix.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self { state: RwLock::default(), ephemeral_ids: true }
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn ensure_model(&self, spec: &ModelSpec) -> StoreResult<ModelRecord> {
        let mut state = self.write()?;
        let record = state.models.entry(spec.id.clone()).or_insert_with(|| ModelRecord::registered(spec));
        Ok(record.clone())
    }

    async fn read_model(&self, model_id: &str) -> StoreResult<ModelRecord> {
        self.read()?
            .models
            .get(model_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("model {model_id}")))
    }

    async fn update_model_status(&self, model_id: &str, update: &ModelStatusUpdate) -> StoreResult<ModelRecord> {
        let mut state = self.write()?;
        let record = state
            .models
            .get_mut(model_id)
            .ok_or_else(|| StoreError::NotFound(format!("model {model_id}")))?;
        record.apply(update);
        Ok(record.clone())
    }

    async fn create_job(&self, job: &NewTrainingJob) -> StoreResult<TrainingJob> {
        let id = if self.ephemeral_ids { TrainingJobId::ephemeral() } else { TrainingJobId::new() };
        let created = TrainingJob::from_new(id.clone(), job);
        self.write()?.jobs.insert(id, created.clone());
        debug!(job_id = %created.id, "created job in memory");
        Ok(created)
    }

    async fn read_job(&self, id: &TrainingJobId) -> StoreResult<TrainingJob> {
        self.read()?.jobs.get(id).cloned().ok_or_else(|| StoreError::NotFound(format!("job {id}")))
    }

    async fn update_job(&self, id: &TrainingJobId, update: &JobUpdate) -> StoreResult<TrainingJob> {
        let mut state = self.write()?;
        let stored = state.jobs.get_mut(id).ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        let mut next = stored.clone();
        apply_job_update(&mut next, update)?;
        *stored = next.clone();
        Ok(next)
    }

    async fn append_epoch(&self, record: &EpochRecord) -> StoreResult<()> {
        let mut state = self.write()?;
        let job = state
            .jobs
            .get(&record.job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", record.job_id)))?;
        let history = state.epochs.get(&record.job_id);
        let last = history.and_then(|h| h.last()).map_or(0, |r| r.epoch_number);
        check_next_epoch(job, last, record.epoch_number)?;

        state.epochs.entry(record.job_id.clone()).or_default().push(record.clone());
        Ok(())
    }

    async fn list_epochs(&self, id: &TrainingJobId) -> StoreResult<Vec<EpochRecord>> {
        let state = self.read()?;
        if !state.jobs.contains_key(id) {
            return Err(StoreError::NotFound(format!("job {id}")));
        }
        Ok(state.epochs.get(id).cloned().unwrap_or_default())
    }

    async fn begin_deployment(&self, id: &TrainingJobId, abandoned_before: DateTime<Utc>) -> StoreResult<TrainingJob> {
        let mut state = self.write()?;
        let stored = state.jobs.get_mut(id).ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        let mut next = stored.clone();
        claim_deployment(&mut next, abandoned_before)?;
        *stored = next.clone();
        Ok(next)
    }

    async fn finish_deployment(&self, record: &DeploymentRecord) -> StoreResult<TrainingJob> {
        let mut guard = self.write()?;
        let state = &mut *guard;
        let stored = state
            .jobs
            .get_mut(&record.job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", record.job_id)))?;
        let mut next = stored.clone();
        apply_job_update(&mut next, &deployment_outcome(record))?;

        if record.success {
            let model = state
                .models
                .get_mut(&record.model_id)
                .ok_or_else(|| StoreError::NotFound(format!("model {}", record.model_id)))?;
            model.apply(&deployed_model(record));
        }
        *stored = next.clone();
        state.deployments.push(record.clone());
        Ok(next)
    }

    async fn list_deployments(&self, id: &TrainingJobId) -> StoreResult<Vec<DeploymentRecord>> {
        Ok(self.read()?.deployments.iter().filter(|d| &d.job_id == id).cloned().collect())
    }
}
