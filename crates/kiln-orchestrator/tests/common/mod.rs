//! Shared fixtures for orchestrator integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_orchestrator::{DeploymentCoordinator, OrchestratorOptions, RetryPolicy, TrainingOrchestrator};
use kiln_store::{InMemoryJobStore, JobStore, JobStores, StoreError, StoreResult};
use kiln_training::{
    AnalysisResult, ArtifactRegistry, DatasetAnalyzer, DeployCredential, DeploymentRecord, EpochMetrics,
    EpochRecord, EpochRequest, JobUpdate, ModelRecord, ModelSpec, ModelStatusUpdate, NewTrainingJob,
    PublishRequest, SimulatedAnalyzer, SimulatedBackend, SimulatedRegistry, TrainingBackend, TrainingError,
    TrainingJob, TrainingJobId, TrainingResult,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};

pub const VALID_TOKEN: &str = "hf_abcdefghijklmnopqrstuvwxyz";

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5), 2.0)
}

pub fn fast_options() -> OrchestratorOptions {
    OrchestratorOptions {
        step_timeout: Duration::from_secs(5),
        retry: fast_retry(),
        allow_degraded_fallback: false,
        finished_retention: 64,
    }
}

pub fn model(id: &str) -> ModelSpec {
    ModelSpec::new(id, "abcdef1234567890", "My Classifier")
}

pub fn instant_backend() -> Arc<dyn TrainingBackend> {
    Arc::new(SimulatedBackend::new(Duration::ZERO))
}

pub fn instant_analyzer() -> Arc<dyn DatasetAnalyzer> {
    Arc::new(SimulatedAnalyzer::new(Duration::ZERO))
}

pub fn orchestrator(store: Arc<dyn JobStore>, backend: Arc<dyn TrainingBackend>) -> TrainingOrchestrator {
    TrainingOrchestrator::new(JobStores::new(store), backend, instant_analyzer(), fast_options())
}

pub fn coordinator(stores: JobStores, registry: Arc<dyn ArtifactRegistry>) -> DeploymentCoordinator {
    DeploymentCoordinator::new(stores, registry, Duration::from_secs(5), fast_retry())
}

pub fn instant_registry() -> Arc<dyn ArtifactRegistry> {
    Arc::new(SimulatedRegistry::new(Duration::ZERO))
}

fn unavailable(what: &str) -> StoreError {
    StoreError::Unavailable(format!("injected failure: {what}"))
}

/// In-memory store with injectable failures.
#[derive(Default)]
pub struct FaultyStore {
    inner: InMemoryJobStore,
    /// Appends of this epoch always fail.
    fail_append_at: Option<u32>,
    /// Appends of this epoch are stored once but reported as failed.
    lose_ack_at: Option<u32>,
    ack_lost: AtomicBool,
    fail_create: bool,
    /// Successful deployments cannot be recorded.
    fail_deployment_success: bool,
    /// Number of upcoming `update_job` calls that fail.
    update_failures: AtomicU32,
    append_calls: Mutex<HashMap<u32, u32>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_append_at(epoch: u32) -> Self {
        Self { fail_append_at: Some(epoch), ..Self::default() }
    }

    pub fn losing_ack_at(epoch: u32) -> Self {
        Self { lose_ack_at: Some(epoch), ..Self::default() }
    }

    pub fn failing_create() -> Self {
        Self { fail_create: true, ..Self::default() }
    }

    pub fn failing_successful_deployments() -> Self {
        Self { fail_deployment_success: true, ..Self::default() }
    }

    pub fn fail_next_updates(&self, count: u32) {
        self.update_failures.store(count, Ordering::SeqCst);
    }

    pub fn append_calls(&self, epoch: u32) -> u32 {
        self.append_calls.lock().unwrap().get(&epoch).copied().unwrap_or(0)
    }
}

#[async_trait]
impl JobStore for FaultyStore {
    async fn ensure_model(&self, spec: &ModelSpec) -> StoreResult<ModelRecord> {
        if self.fail_create {
            return Err(unavailable("ensure_model"));
        }
        self.inner.ensure_model(spec).await
    }

    async fn read_model(&self, model_id: &str) -> StoreResult<ModelRecord> {
        self.inner.read_model(model_id).await
    }

    async fn update_model_status(&self, model_id: &str, update: &ModelStatusUpdate) -> StoreResult<ModelRecord> {
        self.inner.update_model_status(model_id, update).await
    }

    async fn create_job(&self, job: &NewTrainingJob) -> StoreResult<TrainingJob> {
        if self.fail_create {
            return Err(unavailable("create_job"));
        }
        self.inner.create_job(job).await
    }

    async fn read_job(&self, id: &TrainingJobId) -> StoreResult<TrainingJob> {
        self.inner.read_job(id).await
    }

    async fn update_job(&self, id: &TrainingJobId, update: &JobUpdate) -> StoreResult<TrainingJob> {
        let remaining = self.update_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.update_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(unavailable("update_job"));
        }
        self.inner.update_job(id, update).await
    }

    async fn append_epoch(&self, record: &EpochRecord) -> StoreResult<()> {
        *self.append_calls.lock().unwrap().entry(record.epoch_number).or_default() += 1;

        if self.fail_append_at == Some(record.epoch_number) {
            return Err(unavailable("append_epoch"));
        }
        if self.lose_ack_at == Some(record.epoch_number) && !self.ack_lost.swap(true, Ordering::SeqCst) {
            self.inner.append_epoch(record).await?;
            return Err(unavailable("append_epoch acknowledgement"));
        }
        self.inner.append_epoch(record).await
    }

    async fn list_epochs(&self, id: &TrainingJobId) -> StoreResult<Vec<EpochRecord>> {
        self.inner.list_epochs(id).await
    }

    async fn begin_deployment(&self, id: &TrainingJobId, abandoned_before: DateTime<Utc>) -> StoreResult<TrainingJob> {
        self.inner.begin_deployment(id, abandoned_before).await
    }

    async fn finish_deployment(&self, record: &DeploymentRecord) -> StoreResult<TrainingJob> {
        if record.success && self.fail_deployment_success {
            return Err(unavailable("finish_deployment"));
        }
        self.inner.finish_deployment(record).await
    }

    async fn list_deployments(&self, id: &TrainingJobId) -> StoreResult<Vec<DeploymentRecord>> {
        self.inner.list_deployments(id).await
    }
}

/// Simulated backend that counts calls per job.
pub struct CountingBackend {
    inner: SimulatedBackend,
    calls: Mutex<HashMap<TrainingJobId, Vec<u32>>>,
}

impl CountingBackend {
    pub fn new() -> Self {
        Self { inner: SimulatedBackend::new(Duration::from_millis(2)), calls: Mutex::default() }
    }

    pub fn epochs_requested(&self, job_id: &TrainingJobId) -> Vec<u32> {
        self.calls.lock().unwrap().get(job_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl TrainingBackend for CountingBackend {
    fn id(&self) -> &'static str {
        "counting"
    }

    async fn run_epoch(&self, request: &EpochRequest) -> TrainingResult<EpochMetrics> {
        self.calls.lock().unwrap().entry(request.job_id.clone()).or_default().push(request.epoch);
        self.inner.run_epoch(request).await
    }
}

/// Backend whose calls fail for one epoch, either a fixed number of times
/// or always.
pub struct FlakyBackend {
    inner: SimulatedBackend,
    epoch: u32,
    failures_left: AtomicU32,
}

impl FlakyBackend {
    pub fn new(epoch: u32, failures: u32) -> Self {
        Self { inner: SimulatedBackend::new(Duration::ZERO), epoch, failures_left: AtomicU32::new(failures) }
    }

    pub fn always_failing_at(epoch: u32) -> Self {
        Self::new(epoch, u32::MAX)
    }
}

#[async_trait]
impl TrainingBackend for FlakyBackend {
    fn id(&self) -> &'static str {
        "flaky"
    }

    async fn run_epoch(&self, request: &EpochRequest) -> TrainingResult<EpochMetrics> {
        if request.epoch == self.epoch {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left.saturating_sub(1), Ordering::SeqCst);
                return Err(TrainingError::Backend(format!("epoch {} crashed", request.epoch)));
            }
        }
        self.inner.run_epoch(request).await
    }
}

/// Backend that never finishes an epoch in time.
pub struct StalledBackend;

#[async_trait]
impl TrainingBackend for StalledBackend {
    fn id(&self) -> &'static str {
        "stalled"
    }

    async fn run_epoch(&self, _request: &EpochRequest) -> TrainingResult<EpochMetrics> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(TrainingError::Backend("unreachable".to_string()))
    }
}

/// Backend that reports each epoch it enters and waits for a permit
/// before returning its metrics.
pub struct GatedBackend {
    inner: SimulatedBackend,
    permits: Arc<Semaphore>,
    entered: mpsc::UnboundedSender<u32>,
}

impl GatedBackend {
    pub fn new() -> (Self, Arc<Semaphore>, mpsc::UnboundedReceiver<u32>) {
        let permits = Arc::new(Semaphore::new(0));
        let (entered, rx) = mpsc::unbounded_channel();
        let backend = Self { inner: SimulatedBackend::new(Duration::ZERO), permits: Arc::clone(&permits), entered };
        (backend, permits, rx)
    }
}

#[async_trait]
impl TrainingBackend for GatedBackend {
    fn id(&self) -> &'static str {
        "gated"
    }

    async fn run_epoch(&self, request: &EpochRequest) -> TrainingResult<EpochMetrics> {
        let _ = self.entered.send(request.epoch);
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| TrainingError::Backend(format!("gate closed: {e}")))?;
        permit.forget();
        self.inner.run_epoch(request).await
    }
}

/// Analyzer that always fails.
pub struct BrokenAnalyzer;

#[async_trait]
impl DatasetAnalyzer for BrokenAnalyzer {
    fn id(&self) -> &'static str {
        "broken"
    }

    async fn analyze(&self, _model: &ModelSpec) -> TrainingResult<AnalysisResult> {
        Err(TrainingError::Analysis("dataset unreadable".to_string()))
    }
}

/// Registry that rejects the first `failures` publish calls.
pub struct FlakyRegistry {
    failures_left: AtomicU32,
    published: Mutex<Vec<String>>,
}

impl FlakyRegistry {
    pub fn new(failures: u32) -> Self {
        Self { failures_left: AtomicU32::new(failures), published: Mutex::default() }
    }

    pub fn published(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactRegistry for FlakyRegistry {
    fn id(&self) -> &'static str {
        "flaky"
    }

    async fn publish(&self, request: &PublishRequest, _credential: &DeployCredential) -> TrainingResult<()> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(TrainingError::Registry("registry unavailable".to_string()));
        }
        self.published.lock().unwrap().push(request.repository.clone());
        Ok(())
    }
}
