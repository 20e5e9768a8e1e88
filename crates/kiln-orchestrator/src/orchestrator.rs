//! The training state machine.
//!
//! A job is created in `Analyzing`, moves to `Configuring` once its dataset
//! analysis is attached, and to `Training` on an explicit start. The epoch
//! loop then runs as its own tokio task; see [`crate::epoch_loop`].

use crate::config::KilnConfig;
use crate::epoch_loop::EpochLoop;
use crate::error::{OrchestrationError, Result};
use crate::retry::{RetryPolicy, with_retry};
use crate::status::StatusReporter;
use kiln_store::{JobStore, JobStores, StoreResult};
use kiln_training::{
    AnalysisResult, DatasetAnalyzer, JobUpdate, ModelSpec, NewTrainingJob, ProgressEvent, ProgressSink, Stage,
    TracingProgressSink, TrainingBackend, TrainingConfig, TrainingJob, TrainingJobId,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Upper bound for a single epoch step before it counts as failed.
    pub step_timeout: Duration,
    /// Applied to every store operation and every epoch step.
    pub retry: RetryPolicy,
    /// Create jobs in the ephemeral store when the durable one fails.
    pub allow_degraded_fallback: bool,
    /// Finished jobs kept for `join` and `analysis`; older ones are
    /// forgotten. Their stored state is unaffected.
    pub finished_retention: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            allow_degraded_fallback: false,
            finished_retention: 1024,
        }
    }
}

/// A job whose analysis is attached and which waits for a training config.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedJob {
    pub job_id: TrainingJobId,
    pub stage: Stage,
    pub analysis: AnalysisResult,
    /// The job lives only in this process's ephemeral store.
    pub degraded: bool,
}

/// Immediate answer to a start request; the epoch loop runs on afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartAck {
    pub job_id: TrainingJobId,
    pub stage: Stage,
    pub total_epochs: u32,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTrainingRequest {
    pub model: ModelSpec,
    pub config: TrainingConfig,
}

pub(crate) enum Phase {
    Configuring,
    Running { cancel: CancellationToken, done: watch::Receiver<Option<Stage>> },
    Finished(Stage),
}

/// In-process state of a job owned by this orchestrator.
pub(crate) struct Session {
    model: ModelSpec,
    analysis: AnalysisResult,
    degraded: bool,
    pub(crate) phase: Phase,
}

/// Sessions by job id, with finished jobs queued in completion order.
#[derive(Default)]
pub(crate) struct Sessions {
    by_job: HashMap<TrainingJobId, Session>,
    finished: VecDeque<TrainingJobId>,
}

impl Sessions {
    fn get(&self, job_id: &TrainingJobId) -> Option<&Session> {
        self.by_job.get(job_id)
    }

    fn get_mut(&mut self, job_id: &TrainingJobId) -> Option<&mut Session> {
        self.by_job.get_mut(job_id)
    }

    fn insert(&mut self, job_id: TrainingJobId, session: Session) {
        self.by_job.insert(job_id, session);
    }

    /// Marks the job finished and forgets the oldest finished jobs beyond
    /// `retention`.
    pub(crate) fn finish(&mut self, job_id: &TrainingJobId, stage: Stage, retention: usize) {
        let Some(session) = self.by_job.get_mut(job_id) else { return };
        session.phase = Phase::Finished(stage);
        self.finished.push_back(job_id.clone());
        while self.finished.len() > retention {
            let Some(evicted) = self.finished.pop_front() else { break };
            self.by_job.remove(&evicted);
            debug!(job_id = %evicted, "forgot finished session");
        }
    }
}

pub(crate) type SessionMap = Arc<Mutex<Sessions>>;

pub(crate) fn lock_sessions(sessions: &SessionMap) -> MutexGuard<'_, Sessions> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A session claimed by `start`. Unless the epoch loop was spawned, dropping
/// it returns the session to `Configuring`, also when the `start` future
/// itself is dropped.
struct StartClaim<'a> {
    sessions: &'a SessionMap,
    job_id: &'a TrainingJobId,
    spawned: bool,
}

impl Drop for StartClaim<'_> {
    fn drop(&mut self) {
        if self.spawned {
            return;
        }
        if let Some(session) = lock_sessions(self.sessions).get_mut(self.job_id) {
            session.phase = Phase::Configuring;
        }
    }
}

/// Drives training jobs through their stages.
///
/// Only the orchestrator that prepared a job may start it, and it runs at
/// most one epoch loop per job. The session lock is never held across an
/// await point.
#[derive(Clone)]
pub struct TrainingOrchestrator {
    stores: JobStores,
    backend: Arc<dyn TrainingBackend>,
    analyzer: Arc<dyn DatasetAnalyzer>,
    progress: Arc<dyn ProgressSink>,
    options: OrchestratorOptions,
    sessions: SessionMap,
}

impl std::fmt::Debug for TrainingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingOrchestrator")
            .field("backend", &self.backend.id())
            .field("analyzer", &self.analyzer.id())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl TrainingOrchestrator {
    #[must_use]
    pub fn new(
        stores: JobStores,
        backend: Arc<dyn TrainingBackend>,
        analyzer: Arc<dyn DatasetAnalyzer>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            stores,
            backend,
            analyzer,
            progress: Arc::new(TracingProgressSink),
            options,
            sessions: Arc::default(),
        }
    }

    #[must_use]
    pub fn from_config(config: &KilnConfig, stores: JobStores) -> Self {
        Self::new(stores, config.build_backend(), config.build_analyzer(), config.orchestrator_options())
    }

    #[must_use]
    pub fn with_progress_sink(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn stores(&self) -> &JobStores {
        &self.stores
    }

    #[must_use]
    pub fn status_reporter(&self) -> StatusReporter {
        StatusReporter::new(self.stores.clone())
    }

    /// Creates a job for `model`, runs dataset analysis and leaves the job
    /// in `Configuring`.
    ///
    /// If analysis fails the job moves to `Failed` and the returned
    /// `AnalysisFailed` error names it.
    pub async fn prepare(&self, model: ModelSpec) -> Result<PreparedJob> {
        model.validate()?;
        let (job, degraded) = self.create_job(&model).await?;
        let store = self.stores.for_job(&job.id);
        info!(job_id = %job.id, model_id = %model.id, degraded, analyzer = self.analyzer.id(), "analyzing dataset");

        let analysis = match self.analyzer.analyze(&model).await {
            Ok(analysis) => analysis,
            Err(err) => {
                error!(job_id = %job.id, error = %err, "analysis failed");
                let failed = JobUpdate::stage(Stage::Failed).with_error(err.to_string());
                if let Err(store_err) =
                    with_retry(&self.options.retry, "update_job", || store.update_job(&job.id, &failed)).await
                {
                    error!(job_id = %job.id, error = %store_err, "could not record analysis failure");
                }
                return Err(OrchestrationError::AnalysisFailed { job_id: job.id, source: err });
            }
        };

        let configuring = JobUpdate::stage(Stage::Configuring);
        with_retry(&self.options.retry, "update_job", || store.update_job(&job.id, &configuring)).await?;
        info!(
            job_id = %job.id,
            suggested_epochs = analysis.suggested_epochs,
            architecture = %analysis.architecture,
            "analysis attached, waiting for configuration"
        );

        lock_sessions(&self.sessions).insert(
            job.id.clone(),
            Session { model, analysis: analysis.clone(), degraded, phase: Phase::Configuring },
        );

        Ok(PreparedJob { job_id: job.id, stage: Stage::Configuring, analysis, degraded })
    }

    async fn create_job(&self, model: &ModelSpec) -> Result<(TrainingJob, bool)> {
        match self.create_in(&self.stores.durable(), model).await {
            Ok(job) => Ok((job, false)),
            Err(err) if self.options.allow_degraded_fallback => {
                warn!(
                    model_id = %model.id,
                    error = %err,
                    "durable store unavailable, creating job in degraded mode"
                );
                let job = self.create_in(&self.stores.ephemeral(), model).await?;
                Ok((job, true))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn create_in(&self, store: &Arc<dyn JobStore>, model: &ModelSpec) -> StoreResult<TrainingJob> {
        with_retry(&self.options.retry, "ensure_model", || store.ensure_model(model)).await?;
        let new_job = NewTrainingJob::for_model(model);
        with_retry(&self.options.retry, "create_job", || store.create_job(&new_job)).await
    }

    /// Moves a configured job to `Training` and spawns its epoch loop.
    ///
    /// An out-of-range config is rejected without any state change. A second
    /// start for the same job fails with `AlreadyRunning`. If the call fails
    /// or is dropped before the loop is spawned, the job can be started again.
    pub async fn start(&self, job_id: &TrainingJobId, config: TrainingConfig) -> Result<StartAck> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        let (model_id, degraded) = {
            let mut sessions = lock_sessions(&self.sessions);
            let session = sessions
                .get_mut(job_id)
                .ok_or_else(|| OrchestrationError::NotFound(format!("no prepared job {job_id}")))?;
            match &session.phase {
                Phase::Configuring => {}
                Phase::Running { .. } => return Err(OrchestrationError::AlreadyRunning(job_id.clone())),
                Phase::Finished(stage) => {
                    return Err(OrchestrationError::InvalidTransition { from: *stage, to: Stage::Training });
                }
            }
            session.phase = Phase::Running { cancel: cancel.clone(), done: done_rx };
            (session.model.id.clone(), session.degraded)
        };
        let mut claim = StartClaim { sessions: &self.sessions, job_id, spawned: false };

        let store = self.stores.for_job(job_id);
        let begin = JobUpdate { total_epochs: Some(config.epochs), ..JobUpdate::stage(Stage::Training) };
        if let Err(err) = with_retry(&self.options.retry, "update_job", || store.update_job(job_id, &begin)).await {
            error!(job_id = %job_id, error = %err, "could not start training");
            return Err(err.into());
        }

        // No await from here until the loop is spawned.
        info!(
            job_id = %job_id,
            total_epochs = config.epochs,
            batch_size = config.batch_size,
            learning_rate = config.learning_rate,
            backend = self.backend.id(),
            "training started"
        );
        self.progress.on_event(ProgressEvent::Started { job_id: job_id.clone(), total_epochs: config.epochs });

        let epoch_loop = EpochLoop {
            job_id: job_id.clone(),
            model_id,
            config,
            store,
            backend: Arc::clone(&self.backend),
            progress: Arc::clone(&self.progress),
            options: self.options.clone(),
            cancel,
            sessions: Arc::clone(&self.sessions),
            done: done_tx,
        };
        tokio::spawn(epoch_loop.run());
        claim.spawned = true;

        Ok(StartAck { job_id: job_id.clone(), stage: Stage::Training, total_epochs: config.epochs, degraded })
    }

    /// Prepares and starts a job in one call.
    pub async fn start_training(&self, request: StartTrainingRequest) -> Result<StartAck> {
        request.config.validate()?;
        let prepared = self.prepare(request.model).await?;
        self.start(&prepared.job_id, request.config).await
    }

    /// Asks a running job to stop before its next epoch.
    pub fn cancel(&self, job_id: &TrainingJobId) -> Result<()> {
        let sessions = lock_sessions(&self.sessions);
        match sessions.get(job_id).map(|s| &s.phase) {
            Some(Phase::Running { cancel, .. }) => {
                cancel.cancel();
                info!(job_id = %job_id, "cancellation requested");
                Ok(())
            }
            Some(Phase::Configuring) => {
                Err(OrchestrationError::InvalidTransition { from: Stage::Configuring, to: Stage::Cancelled })
            }
            Some(Phase::Finished(stage)) => {
                Err(OrchestrationError::InvalidTransition { from: *stage, to: Stage::Cancelled })
            }
            None => Err(OrchestrationError::NotFound(format!("no job {job_id} in this orchestrator"))),
        }
    }

    /// Waits for the epoch loop of `job_id` and returns the stage it ended in.
    ///
    /// Jobs finished longer ago than the retention allows are `NotFound`
    /// here; their stored status stays readable.
    pub async fn join(&self, job_id: &TrainingJobId) -> Result<Stage> {
        let mut done = {
            let sessions = lock_sessions(&self.sessions);
            match sessions.get(job_id).map(|s| &s.phase) {
                Some(Phase::Running { done, .. }) => done.clone(),
                Some(Phase::Finished(stage)) => return Ok(*stage),
                Some(Phase::Configuring) => {
                    return Err(OrchestrationError::BadRequest(format!("job {job_id} has not been started")));
                }
                None => return Err(OrchestrationError::NotFound(format!("no job {job_id} in this orchestrator"))),
            }
        };

        let stage = *done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| OrchestrationError::Internal(format!("epoch loop for job {job_id} ended unexpectedly")))?;
        stage.ok_or_else(|| OrchestrationError::Internal(format!("epoch loop for job {job_id} reported no stage")))
    }

    /// Analysis attached to a job prepared by this orchestrator.
    pub fn analysis(&self, job_id: &TrainingJobId) -> Result<AnalysisResult> {
        lock_sessions(&self.sessions)
            .get(job_id)
            .map(|s| s.analysis.clone())
            .ok_or_else(|| OrchestrationError::NotFound(format!("no job {job_id} in this orchestrator")))
    }

    #[must_use]
    pub fn is_running(&self, job_id: &TrainingJobId) -> bool {
        matches!(lock_sessions(&self.sessions).get(job_id).map(|s| &s.phase), Some(Phase::Running { .. }))
    }
}
