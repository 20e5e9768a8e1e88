//! End-to-end training runs against the in-memory store.

mod common;

use common::{BrokenAnalyzer, FaultyStore, fast_options, instant_analyzer, instant_backend, model, orchestrator};
use kiln_orchestrator::{ErrorKind, OrchestrationError, StartTrainingRequest, TrainingOrchestrator};
use kiln_store::{InMemoryJobStore, JobStore, JobStores};
use kiln_training::{
    ModelStatus, ProgressEvent, ProgressSink, Stage, TrainingConfig, TrainingJobId, progress_percent,
};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressSink for RecordingSink {
    fn on_event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn config(epochs: u32) -> TrainingConfig {
    TrainingConfig { epochs, batch_size: 16, learning_rate: 0.001 }
}

async fn train_to_end(orchestrator: &TrainingOrchestrator, model_id: &str, epochs: u32) -> TrainingJobId {
    let ack = orchestrator
        .start_training(StartTrainingRequest { model: model(model_id), config: config(epochs) })
        .await
        .unwrap();
    assert_eq!(ack.stage, Stage::Training);
    assert_eq!(ack.total_epochs, epochs);
    assert!(!ack.degraded);

    let stage = orchestrator.join(&ack.job_id).await.unwrap();
    assert_eq!(stage, Stage::Completed);
    ack.job_id
}

#[tokio::test]
async fn test_completion_records_every_epoch_once() {
    let store = Arc::new(InMemoryJobStore::new());
    let orchestrator = orchestrator(store.clone(), instant_backend());

    let job_id = train_to_end(&orchestrator, "m-complete", 7).await;

    let history = store.list_epochs(&job_id).await.unwrap();
    let numbers: Vec<u32> = history.iter().map(|r| r.epoch_number).collect();
    assert_eq!(numbers, (1..=7).collect::<Vec<_>>());
    assert!(history.iter().all(|r| r.job_id == job_id));
}

#[tokio::test]
async fn test_three_epoch_run_matches_last_record() {
    let store = Arc::new(InMemoryJobStore::new());
    let orchestrator = orchestrator(store.clone(), instant_backend());

    let job_id = train_to_end(&orchestrator, "m-three", 3).await;

    let job = store.read_job(&job_id).await.unwrap();
    assert_eq!(job.stage, Stage::Completed);
    assert_eq!(job.current_epoch, 3);
    assert_eq!(job.total_epochs, 3);
    assert_eq!(job.progress, 100);

    let history = store.list_epochs(&job_id).await.unwrap();
    assert_eq!(history.len(), 3);
    let last = &history[2];
    let summary = job.final_metrics.unwrap();
    assert_eq!(summary.final_loss, last.loss);
    assert_eq!(summary.final_accuracy, last.accuracy);

    let model = store.read_model("m-three").await.unwrap();
    assert_eq!(model.status, ModelStatus::Completed);
    assert_eq!(model.metrics, Some(summary));
    assert_eq!(model.training_config, Some(config(3)));
}

#[tokio::test]
async fn test_progress_events_follow_epoch_counter() {
    let sink = Arc::new(RecordingSink::default());
    let orchestrator = orchestrator(Arc::new(InMemoryJobStore::new()), instant_backend())
        .with_progress_sink(sink.clone());

    let job_id = train_to_end(&orchestrator, "m-progress", 6).await;

    let events = sink.events.lock().unwrap().clone();
    assert!(matches!(events.first(), Some(ProgressEvent::Started { total_epochs: 6, .. })));
    assert!(matches!(events.last(), Some(ProgressEvent::Finished { stage: Stage::Completed, .. })));

    let progress: Vec<(u32, u8)> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Epoch { epoch, progress, .. } => Some((*epoch, *progress)),
            _ => None,
        })
        .collect();
    let expected: Vec<(u32, u8)> = (1..=6).map(|i| (i, progress_percent(i, 6))).collect();
    assert_eq!(progress, expected);
    assert_eq!(progress.last(), Some(&(6, 100)));
    assert!(events.iter().all(|e| e.job_id() == &job_id));
}

#[tokio::test]
async fn test_invalid_config_leaves_job_configuring() {
    let store = Arc::new(InMemoryJobStore::new());
    let orchestrator = orchestrator(store.clone(), instant_backend());
    let prepared = orchestrator.prepare(model("m-invalid")).await.unwrap();

    for bad in [
        TrainingConfig { epochs: 0, ..config(1) },
        TrainingConfig { batch_size: 0, ..config(1) },
        TrainingConfig { learning_rate: 0.0, ..config(1) },
        TrainingConfig { learning_rate: f64::NAN, ..config(1) },
    ] {
        let err = orchestrator.start(&prepared.job_id, bad).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    let job = store.read_job(&prepared.job_id).await.unwrap();
    assert_eq!(job.stage, Stage::Configuring);
    assert_eq!(job.current_epoch, 0);
    assert!(!orchestrator.is_running(&prepared.job_id));

    // The job is still startable after the rejections.
    orchestrator.start(&prepared.job_id, config(2)).await.unwrap();
    assert_eq!(orchestrator.join(&prepared.job_id).await.unwrap(), Stage::Completed);
}

#[tokio::test]
async fn test_start_training_rejects_bad_config_before_creating_a_job() {
    let store = Arc::new(InMemoryJobStore::new());
    let orchestrator = orchestrator(store.clone(), instant_backend());

    let err = orchestrator
        .start_training(StartTrainingRequest { model: model("m-nojob"), config: config(0) })
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Validation(_)));
    assert!(store.read_model("m-nojob").await.is_err());
}

#[tokio::test]
async fn test_prepare_attaches_analysis() {
    let store = Arc::new(InMemoryJobStore::new());
    let orchestrator = orchestrator(store.clone(), instant_backend());

    let prepared = orchestrator.prepare(model("m-analysis")).await.unwrap();

    assert_eq!(prepared.stage, Stage::Configuring);
    assert!(prepared.analysis.suggested_epochs > 0);
    assert_eq!(prepared.analysis.target_column, "label");
    assert_eq!(orchestrator.analysis(&prepared.job_id).unwrap(), prepared.analysis);
    assert_eq!(store.read_job(&prepared.job_id).await.unwrap().stage, Stage::Configuring);
    assert_eq!(store.read_model("m-analysis").await.unwrap().status, ModelStatus::Registered);
}

#[tokio::test]
async fn test_analysis_failure_fails_the_job() {
    let store = Arc::new(InMemoryJobStore::new());
    let orchestrator = TrainingOrchestrator::new(
        JobStores::new(store.clone()),
        instant_backend(),
        Arc::new(BrokenAnalyzer),
        fast_options(),
    );

    let err = orchestrator.prepare(model("m-broken")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Backend);
    let OrchestrationError::AnalysisFailed { job_id, .. } = &err else {
        panic!("expected an analysis failure, got {err:?}");
    };

    let job = store.read_job(job_id).await.unwrap();
    assert_eq!(job.stage, Stage::Failed);
    assert!(job.error.as_deref().unwrap().contains("dataset unreadable"));

    let status = orchestrator.status_reporter().get_status(Some(job_id.as_str())).await.unwrap();
    assert_eq!(status.stage, Stage::Failed);
    assert!(status.terminal);
    assert!(orchestrator.status_reporter().get_history(Some(job_id.as_str())).await.unwrap().is_empty());
    assert!(orchestrator.start(job_id, config(2)).await.is_err());
}

#[tokio::test]
async fn test_invalid_model_spec_is_rejected() {
    let orchestrator = orchestrator(Arc::new(InMemoryJobStore::new()), instant_backend());
    let mut spec = model("m-nameless");
    spec.name = "  ".to_string();

    let err = orchestrator.prepare(spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_unprepared_job_cannot_start() {
    let orchestrator = orchestrator(Arc::new(InMemoryJobStore::new()), instant_backend());

    let err = orchestrator.start(&TrainingJobId::from("never-prepared"), config(2)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_finished_job_cannot_restart() {
    let orchestrator = orchestrator(Arc::new(InMemoryJobStore::new()), instant_backend());
    let job_id = train_to_end(&orchestrator, "m-restart", 2).await;

    let err = orchestrator.start(&job_id, config(2)).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::InvalidTransition { from: Stage::Completed, to: Stage::Training }));
}

#[tokio::test]
async fn test_finished_sessions_are_forgotten_beyond_retention() {
    let store = Arc::new(InMemoryJobStore::new());
    let mut options = fast_options();
    options.finished_retention = 1;
    let orchestrator =
        TrainingOrchestrator::new(JobStores::new(store.clone()), instant_backend(), instant_analyzer(), options);

    let first = train_to_end(&orchestrator, "m-retained-1", 2).await;
    assert_eq!(orchestrator.join(&first).await.unwrap(), Stage::Completed);
    let second = train_to_end(&orchestrator, "m-retained-2", 2).await;

    assert_eq!(orchestrator.join(&first).await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(orchestrator.analysis(&first).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(orchestrator.join(&second).await.unwrap(), Stage::Completed);

    let status = orchestrator.status_reporter().get_status(Some(first.as_str())).await.unwrap();
    assert_eq!(status.stage, Stage::Completed);
    assert_eq!(store.list_epochs(&first).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_degraded_mode_is_opt_in() {
    let strict = orchestrator(Arc::new(FaultyStore::failing_create()), instant_backend());
    let err = strict.prepare(model("m-strict")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Store);

    let mut options = fast_options();
    options.allow_degraded_fallback = true;
    let stores = JobStores::new(Arc::new(FaultyStore::failing_create()));
    let lenient = TrainingOrchestrator::new(stores.clone(), instant_backend(), instant_analyzer(), options);

    let ack = lenient
        .start_training(StartTrainingRequest { model: model("m-degraded"), config: config(2) })
        .await
        .unwrap();
    assert!(ack.degraded);
    assert!(ack.job_id.is_ephemeral());
    assert_eq!(lenient.join(&ack.job_id).await.unwrap(), Stage::Completed);

    let status = lenient.status_reporter().get_status(Some(ack.job_id.as_str())).await.unwrap();
    assert!(!status.durable);
    assert_eq!(status.stage, Stage::Completed);
    assert_eq!(stores.ephemeral().list_epochs(&ack.job_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_status_and_history_read_the_store() {
    let orchestrator = orchestrator(Arc::new(InMemoryJobStore::new()), instant_backend());
    let reporter = orchestrator.status_reporter();
    let job_id = train_to_end(&orchestrator, "m-status", 4).await;

    let status = reporter.get_status(Some(job_id.as_str())).await.unwrap();
    assert_eq!(status.stage, Stage::Completed);
    assert_eq!(status.current_epoch, 4);
    assert_eq!(status.progress, 100);
    assert!(status.terminal);
    assert!(status.durable);
    assert!(status.metrics.is_some());

    let history = reporter.get_history(Some(job_id.as_str())).await.unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(reporter.get_status(None).await.unwrap_err().kind(), ErrorKind::BadRequest);
}
