use crate::job::TrainingJobId;
use crate::metrics::EpochMetrics;
use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { job_id: TrainingJobId, total_epochs: u32 },
    Epoch { job_id: TrainingJobId, epoch: u32, total_epochs: u32, progress: u8, metrics: EpochMetrics },
    Finished { job_id: TrainingJobId, stage: Stage },
}

impl ProgressEvent {
    #[must_use]
    pub fn job_id(&self) -> &TrainingJobId {
        match self {
            Self::Started { job_id, .. } | Self::Epoch { job_id, .. } | Self::Finished { job_id, .. } => job_id,
        }
    }
}

/// Receives progress events from the epoch loop. Called only after the
/// state the event describes has been persisted.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Writes progress events to the `tracing` pipeline.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { job_id, total_epochs } => {
                info!(job_id = %job_id, total_epochs, "training started");
            }
            ProgressEvent::Epoch { job_id, epoch, total_epochs, progress, metrics } => {
                info!(
                    job_id = %job_id,
                    epoch,
                    total_epochs,
                    progress,
                    loss = metrics.loss,
                    accuracy = metrics.accuracy,
                    "epoch complete"
                );
            }
            ProgressEvent::Finished { job_id, stage } => {
                info!(job_id = %job_id, stage = %stage, "training finished");
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn on_event(&self, _event: ProgressEvent) {}
}
