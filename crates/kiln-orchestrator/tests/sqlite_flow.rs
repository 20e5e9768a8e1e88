//! Training and deployment persisted to a SQLite file.

mod common;

use common::{VALID_TOKEN, coordinator, instant_backend, instant_registry, model, orchestrator};
use kiln_orchestrator::{StartTrainingRequest, StatusReporter};
use kiln_store::{JobStores, SqliteJobStore};
use kiln_training::{Stage, TrainingConfig};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_state_is_visible_from_another_connection() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("kiln.db");

    let store = Arc::new(SqliteJobStore::open(&path).unwrap());
    let orchestrator = orchestrator(store, instant_backend());
    let config = TrainingConfig { epochs: 4, batch_size: 16, learning_rate: 0.001 };
    let ack = orchestrator.start_training(StartTrainingRequest { model: model("m-sqlite"), config }).await.unwrap();
    assert_eq!(orchestrator.join(&ack.job_id).await.unwrap(), Stage::Completed);

    let deployer = coordinator(orchestrator.stores().clone(), instant_registry());
    let record = deployer.deploy(&ack.job_id, Some(VALID_TOKEN)).await.unwrap();

    // A reader with its own connection, as a status process would have.
    let reader = StatusReporter::new(JobStores::new(Arc::new(SqliteJobStore::open(&path).unwrap())));
    let status = reader.get_status(Some(ack.job_id.as_str())).await.unwrap();
    assert_eq!(status.stage, Stage::Deployed);
    assert_eq!(status.current_epoch, 4);
    assert_eq!(status.progress, 100);
    assert!(status.durable);

    let history = reader.get_history(Some(ack.job_id.as_str())).await.unwrap();
    assert_eq!(history.iter().map(|r| r.epoch_number).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    let summary = status.metrics.unwrap();
    assert!((summary.final_loss - history[3].loss).abs() < 1e-9);
    assert!((summary.final_accuracy - history[3].accuracy).abs() < 1e-9);

    let deployments = reader.get_deployments(Some(ack.job_id.as_str())).await.unwrap();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].repository, record.repository);
    assert!(deployments[0].success);
}

#[tokio::test]
async fn test_reopened_store_keeps_failed_job() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("kiln.db");

    let job_id = {
        let store = Arc::new(SqliteJobStore::open(&path).unwrap());
        let orchestrator = orchestrator(store, Arc::new(common::FlakyBackend::always_failing_at(2)));
        let config = TrainingConfig { epochs: 3, batch_size: 8, learning_rate: 0.01 };
        let ack =
            orchestrator.start_training(StartTrainingRequest { model: model("m-reopen"), config }).await.unwrap();
        assert_eq!(orchestrator.join(&ack.job_id).await.unwrap(), Stage::Failed);
        ack.job_id
    };

    let reader = StatusReporter::new(JobStores::new(Arc::new(SqliteJobStore::open(&path).unwrap())));
    let status = reader.get_status(Some(job_id.as_str())).await.unwrap();
    assert_eq!(status.stage, Stage::Failed);
    assert_eq!(status.current_epoch, 1);
    assert!(status.error.unwrap().contains("epoch 2 crashed"));
    assert_eq!(reader.get_history(Some(job_id.as_str())).await.unwrap().len(), 1);
}
