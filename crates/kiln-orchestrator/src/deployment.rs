//! Publishing completed jobs to the artifact registry.

use crate::config::KilnConfig;
use crate::error::{OrchestrationError, Result};
use crate::retry::{RetryPolicy, with_retry};
use chrono::{DateTime, Utc};
use kiln_store::{JobStore, JobStores, StoreError};
use kiln_training::{
    ArtifactRegistry, DeployCredential, DeploymentRecord, PublishRequest, Stage, TrainingError, TrainingJobId,
    TrainingResult, repository_id,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

/// Moves `Completed` (or `DeployFailed`) jobs through `Deploying` to
/// `Deployed` or `DeployFailed`.
///
/// Every attempt, successful or not, leaves one `DeploymentRecord`, stored in
/// the same step as the job's final stage. A failed attempt never touches the
/// job's training history and can be repeated.
///
/// Entering `Deploying` is a compare-and-set in the store, so only one
/// attempt per job runs at a time across processes. An attempt whose job has
/// sat in `Deploying` for twice the publish timeout is considered abandoned
/// and may be taken over.
#[derive(Clone)]
pub struct DeploymentCoordinator {
    stores: JobStores,
    registry: Arc<dyn ArtifactRegistry>,
    publish_timeout: Duration,
    retry: RetryPolicy,
    in_flight: Arc<Mutex<HashSet<TrainingJobId>>>,
}

/// Removes a job from the in-flight set when the attempt ends.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<TrainingJobId>>,
    job_id: TrainingJobId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.job_id);
    }
}

impl std::fmt::Debug for DeploymentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentCoordinator")
            .field("registry", &self.registry.id())
            .field("publish_timeout", &self.publish_timeout)
            .finish_non_exhaustive()
    }
}

impl DeploymentCoordinator {
    #[must_use]
    pub fn new(stores: JobStores, registry: Arc<dyn ArtifactRegistry>, publish_timeout: Duration, retry: RetryPolicy) -> Self {
        Self { stores, registry, publish_timeout, retry, in_flight: Arc::default() }
    }

    #[must_use]
    pub fn from_config(config: &KilnConfig, stores: JobStores) -> Self {
        Self::new(stores, config.build_registry(), config.publish_timeout(), config.retry.policy())
    }

    /// Publishes the model trained by `job_id`.
    ///
    /// The credential is checked before anything else; a missing or
    /// malformed one is rejected with the job untouched.
    pub async fn deploy(&self, job_id: &TrainingJobId, credential: Option<&str>) -> Result<DeploymentRecord> {
        let credential = match credential {
            Some(raw) if !raw.trim().is_empty() => DeployCredential::parse(raw)?,
            _ => return Err(OrchestrationError::Validation("a deployment credential is required".to_string())),
        };

        let store = self.stores.for_job(job_id);
        let job = with_retry(&self.retry, "read_job", || store.read_job(job_id)).await?;
        if !job.stage.is_deployable() && job.stage != Stage::Deploying {
            return Err(OrchestrationError::InvalidTransition { from: job.stage, to: Stage::Deploying });
        }
        let _guard = self.claim(job_id)?;

        let model = with_retry(&self.retry, "read_model", || store.read_model(&job.model_id)).await?;
        let request = PublishRequest {
            job_id: job_id.clone(),
            model_id: model.model_id.clone(),
            repository: repository_id(&job.user_id, &model.name),
        };

        let abandoned_before = self.abandoned_before();
        match with_retry(&self.retry, "begin_deployment", || store.begin_deployment(job_id, abandoned_before)).await {
            Ok(_) => {}
            Err(StoreError::Conflict(_)) => return Err(OrchestrationError::AlreadyRunning(job_id.clone())),
            Err(err) => return Err(err.into()),
        }
        info!(
            job_id = %job_id,
            repository = %request.repository,
            registry = self.registry.id(),
            "deploying model"
        );

        match self.publish(&request, &credential).await {
            Ok(()) => self.record_success(&store, &request).await,
            Err(err) => {
                warn!(job_id = %job_id, repository = %request.repository, error = %err, "deployment failed");
                self.record_failure(&store, &DeploymentRecord::failed(&request, err.to_string())).await;
                Err(OrchestrationError::Backend(err))
            }
        }
    }

    fn claim(&self, job_id: &TrainingJobId) -> Result<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(job_id.clone()) {
            return Err(OrchestrationError::AlreadyRunning(job_id.clone()));
        }
        Ok(InFlight { set: &self.in_flight, job_id: job_id.clone() })
    }

    /// Claims in `Deploying` last updated before this instant are abandoned.
    fn abandoned_before(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.publish_timeout.saturating_mul(2))
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    async fn publish(&self, request: &PublishRequest, credential: &DeployCredential) -> TrainingResult<()> {
        match tokio::time::timeout(self.publish_timeout, self.registry.publish(request, credential)).await {
            Ok(result) => result,
            Err(_) => Err(TrainingError::Timeout(self.publish_timeout)),
        }
    }

    async fn record_success(&self, store: &Arc<dyn JobStore>, request: &PublishRequest) -> Result<DeploymentRecord> {
        let record = DeploymentRecord::succeeded(request);
        match with_retry(&self.retry, "finish_deployment", || store.finish_deployment(&record)).await {
            Ok(_) => {
                info!(job_id = %request.job_id, repository = %request.repository, "model deployed");
                Ok(record)
            }
            Err(err) => {
                error!(job_id = %request.job_id, error = %err, "published but could not record the deployment");
                let failed = DeploymentRecord::failed(
                    request,
                    format!("published to {} but not recorded: {err}", request.repository),
                );
                self.record_failure(store, &failed).await;
                Err(err.into())
            }
        }
    }

    async fn record_failure(&self, store: &Arc<dyn JobStore>, record: &DeploymentRecord) {
        if let Err(err) = with_retry(&self.retry, "finish_deployment", || store.finish_deployment(record)).await {
            error!(job_id = %record.job_id, error = %err, "could not record failed deployment");
        }
    }
}
