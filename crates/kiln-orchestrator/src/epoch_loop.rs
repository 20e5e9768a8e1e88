//! The background epoch loop of one training job.
//!
//! Epoch `i` is persisted and acknowledged before epoch `i + 1` is
//! requested, so the stored history is gap-free and ordered. Cancellation is
//! only observed between epochs.

use crate::error::OrchestrationError;
use crate::orchestrator::{OrchestratorOptions, SessionMap, lock_sessions};
use crate::retry::with_retry;
use kiln_store::{JobStore, StoreError};
use kiln_training::{
    EpochRecord, EpochRequest, JobUpdate, MetricsSummary, ModelStatus, ModelStatusUpdate, ProgressEvent,
    ProgressSink, Stage, TrainingBackend, TrainingConfig, TrainingError, TrainingJobId,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) struct EpochLoop {
    pub(crate) job_id: TrainingJobId,
    pub(crate) model_id: String,
    pub(crate) config: TrainingConfig,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) backend: Arc<dyn TrainingBackend>,
    pub(crate) progress: Arc<dyn ProgressSink>,
    pub(crate) options: OrchestratorOptions,
    pub(crate) cancel: CancellationToken,
    pub(crate) sessions: SessionMap,
    pub(crate) done: watch::Sender<Option<Stage>>,
}

/// Why a step stopped the loop, and the last epoch known to be stored.
struct StepFailure {
    acknowledged: u32,
    error: OrchestrationError,
}

impl StepFailure {
    fn new(acknowledged: u32, error: impl Into<OrchestrationError>) -> Self {
        Self { acknowledged, error: error.into() }
    }
}

impl EpochLoop {
    pub(crate) async fn run(self) {
        self.mark_model_training().await;
        let stage = self.drive().await;

        lock_sessions(&self.sessions).finish(&self.job_id, stage, self.options.finished_retention);
        self.done.send_replace(Some(stage));
        self.progress.on_event(ProgressEvent::Finished { job_id: self.job_id.clone(), stage });
    }

    async fn mark_model_training(&self) {
        let store = &self.store;
        let training = ModelStatusUpdate::training(self.config);
        if let Err(err) =
            with_retry(&self.options.retry, "update_model_status", || store.update_model_status(&self.model_id, &training))
                .await
        {
            warn!(job_id = %self.job_id, model_id = %self.model_id, error = %err, "could not mark model as training");
        }
    }

    async fn drive(&self) -> Stage {
        let mut acknowledged = 0;
        for epoch in 1..=self.config.epochs {
            if self.cancel.is_cancelled() {
                return self.cancelled(acknowledged).await;
            }
            match self.step(epoch).await {
                Ok(()) => acknowledged = epoch,
                Err(failure) => return self.failed(failure).await,
            }
        }
        Stage::Completed
    }

    async fn step(&self, epoch: u32) -> Result<(), StepFailure> {
        let total = self.config.epochs;
        let retry = &self.options.retry;
        let store = &self.store;
        let job_id = &self.job_id;

        let request = EpochRequest {
            job_id: job_id.clone(),
            model_id: self.model_id.clone(),
            epoch,
            total_epochs: total,
            config: self.config,
        };
        let metrics = self.run_backend(&request).await.map_err(|e| StepFailure::new(epoch - 1, OrchestrationError::Backend(e)))?;

        let record = EpochRecord::new(job_id.clone(), epoch, metrics, self.config.learning_rate);
        let appended = with_retry(retry, "append_epoch", || store.append_epoch(&record)).await;
        let record = match appended {
            Ok(()) => record,
            Err(StoreError::Duplicate(_)) => {
                // An earlier attempt was stored but never acknowledged.
                debug!(job_id = %job_id, epoch, "epoch already stored, using stored record");
                self.stored_epoch(epoch).await.map_err(|e| StepFailure::new(epoch, e))?
            }
            Err(err) => return Err(StepFailure::new(epoch - 1, err)),
        };

        let is_final = epoch == total;
        let summary = MetricsSummary::from(&record);
        let update = if is_final {
            JobUpdate {
                stage: Some(Stage::Completed),
                current_epoch: Some(epoch),
                final_metrics: Some(summary),
                ..JobUpdate::default()
            }
        } else {
            JobUpdate::epoch(epoch)
        };
        let snapshot = with_retry(retry, "update_job", || store.update_job(job_id, &update))
            .await
            .map_err(|e| StepFailure::new(epoch, e))?;

        if is_final {
            info!(
                job_id = %job_id,
                final_loss = summary.final_loss,
                final_accuracy = summary.final_accuracy,
                "training completed"
            );
            let completed = ModelStatusUpdate::completed(summary);
            if let Err(err) =
                with_retry(retry, "update_model_status", || store.update_model_status(&self.model_id, &completed)).await
            {
                warn!(job_id = %job_id, model_id = %self.model_id, error = %err, "job completed but model status update failed");
            }
        }

        self.progress.on_event(ProgressEvent::Epoch {
            job_id: job_id.clone(),
            epoch,
            total_epochs: total,
            progress: snapshot.progress,
            metrics: record.metrics(),
        });
        Ok(())
    }

    /// One backend call per attempt, each bounded by the step timeout.
    async fn run_backend(&self, request: &EpochRequest) -> Result<kiln_training::EpochMetrics, TrainingError> {
        let backend = &self.backend;
        let timeout = self.options.step_timeout;

        with_retry(&self.options.retry, "run_epoch", || async move {
            match tokio::time::timeout(timeout, backend.run_epoch(request)).await {
                Ok(result) => result.and_then(|metrics| metrics.validate().map(|()| metrics)),
                Err(_) => {
                    warn!(job_id = %request.job_id, epoch = request.epoch, ?timeout, "epoch step timed out");
                    Err(TrainingError::Timeout(timeout))
                }
            }
        })
        .await
    }

    async fn stored_epoch(&self, epoch: u32) -> Result<EpochRecord, OrchestrationError> {
        let store = &self.store;
        let job_id = &self.job_id;
        let history = with_retry(&self.options.retry, "list_epochs", || store.list_epochs(job_id)).await?;
        history.into_iter().find(|r| r.epoch_number == epoch).ok_or_else(|| {
            OrchestrationError::Store(StoreError::InvalidData(format!(
                "epoch {epoch} of job {job_id} reported as duplicate but not found"
            )))
        })
    }

    async fn failed(&self, failure: StepFailure) -> Stage {
        let store = &self.store;
        let job_id = &self.job_id;
        error!(
            job_id = %job_id,
            acknowledged_epoch = failure.acknowledged,
            error = %failure.error,
            "training failed"
        );

        let update = JobUpdate {
            stage: Some(Stage::Failed),
            current_epoch: Some(failure.acknowledged),
            error: Some(failure.error.to_string()),
            ..JobUpdate::default()
        };
        if let Err(err) = with_retry(&self.options.retry, "update_job", || store.update_job(job_id, &update)).await {
            error!(job_id = %job_id, error = %err, "could not record failure, job keeps its last persisted state");
        }

        let status = ModelStatusUpdate::new(ModelStatus::Failed);
        if let Err(err) =
            with_retry(&self.options.retry, "update_model_status", || store.update_model_status(&self.model_id, &status))
                .await
        {
            warn!(job_id = %job_id, model_id = %self.model_id, error = %err, "could not mark model as failed");
        }
        Stage::Failed
    }

    async fn cancelled(&self, acknowledged: u32) -> Stage {
        let store = &self.store;
        let job_id = &self.job_id;
        info!(job_id = %job_id, acknowledged_epoch = acknowledged, "training cancelled");

        let update =
            JobUpdate { stage: Some(Stage::Cancelled), current_epoch: Some(acknowledged), ..JobUpdate::default() };
        if let Err(err) = with_retry(&self.options.retry, "update_job", || store.update_job(job_id, &update)).await {
            error!(job_id = %job_id, error = %err, "could not record cancellation");
        }

        let status = ModelStatusUpdate::new(ModelStatus::Cancelled);
        if let Err(err) =
            with_retry(&self.options.retry, "update_model_status", || store.update_model_status(&self.model_id, &status))
                .await
        {
            warn!(job_id = %job_id, model_id = %self.model_id, error = %err, "could not mark model as cancelled");
        }
        Stage::Cancelled
    }
}
