use crate::error::{TrainingError, TrainingResult};
use crate::job::{TrainingConfig, TrainingJobId};
use crate::metrics::{EpochMetrics, MetricsGenerator};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

/// One unit of work handed to a backend: run epoch `epoch` of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRequest {
    pub job_id: TrainingJobId,
    pub model_id: String,
    /// 1-based.
    pub epoch: u32,
    pub total_epochs: u32,
    pub config: TrainingConfig,
}

/// Executes training epochs and reports their metrics.
///
/// A backend must tolerate being asked for the same epoch twice: the caller
/// retries a step whose outcome it never observed.
#[async_trait]
pub trait TrainingBackend: Send + Sync {
    fn id(&self) -> &'static str;

    async fn run_epoch(&self, request: &EpochRequest) -> TrainingResult<EpochMetrics>;
}

/// Backend that sleeps for a fixed delay and samples metrics from a
/// [`MetricsGenerator`].
#[derive(Debug, Clone, Default)]
pub struct SimulatedBackend {
    generator: MetricsGenerator,
    epoch_delay: Duration,
}

impl SimulatedBackend {
    #[must_use]
    pub fn new(epoch_delay: Duration) -> Self {
        Self { generator: MetricsGenerator::default(), epoch_delay }
    }

    #[must_use]
    pub fn with_generator(mut self, generator: MetricsGenerator) -> Self {
        self.generator = generator;
        self
    }
}

#[async_trait]
impl TrainingBackend for SimulatedBackend {
    fn id(&self) -> &'static str {
        "simulated"
    }

    async fn run_epoch(&self, request: &EpochRequest) -> TrainingResult<EpochMetrics> {
        if !self.epoch_delay.is_zero() {
            tokio::time::sleep(self.epoch_delay).await;
        }
        Ok(self.generator.generate(request.epoch, &request.config))
    }
}

/// Backend that delegates each epoch to an HTTP training service.
///
/// The service receives the [`EpochRequest`] as JSON on `POST {base_url}/train`
/// and answers with the epoch's metrics.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    base_url: String,
    client: Client,
}

#[derive(Deserialize)]
struct RemoteEpochResponse {
    loss: f64,
    accuracy: f64,
    #[serde(alias = "val_loss")]
    validation_loss: f64,
    #[serde(alias = "val_accuracy")]
    validation_accuracy: f64,
}

impl RemoteBackend {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    #[must_use]
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl TrainingBackend for RemoteBackend {
    fn id(&self) -> &'static str {
        "remote"
    }

    async fn run_epoch(&self, request: &EpochRequest) -> TrainingResult<EpochMetrics> {
        let url = format!("{}/train", self.base_url);
        debug!(job_id = %request.job_id, epoch = request.epoch, url = %url, "requesting epoch");

        let response = self.client.post(&url).json(request).send().await.map_err(|e| {
            error!(error = %e, base_url = %self.base_url, "training service unreachable");
            TrainingError::Http(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            error!(status = %status, error = %body, "training service returned error status");
            return Err(TrainingError::Backend(format!("training service error ({status}): {body}")));
        }

        let body: RemoteEpochResponse = response.json().await?;
        let metrics = EpochMetrics {
            loss: body.loss,
            accuracy: body.accuracy,
            validation_loss: body.validation_loss,
            validation_accuracy: body.validation_accuracy,
        };
        metrics.validate()?;
        Ok(metrics)
    }
}
