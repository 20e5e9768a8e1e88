//! SQLite implementation of [`JobStore`].

use crate::database::Database;
use crate::error::{StoreError, StoreResult};
use crate::store::{JobStore, apply_job_update, check_next_epoch, claim_deployment, deployed_model, deployment_outcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_training::{
    DeploymentRecord, EpochRecord, JobUpdate, ModelRecord, ModelSpec, ModelStatusUpdate, NewTrainingJob,
    TrainingJob, TrainingJobId,
};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const JOB_COLUMNS: &str = "id, model_id, user_id, stage, total_epochs, current_epoch, progress, \
                           final_metrics_json, error, created_at, updated_at";
const MODEL_COLUMNS: &str = "model_id, user_id, name, status, training_config_json, metrics_json, \
                             repository, deployed_at, updated_at";

/// Durable job store over a single SQLite connection.
///
/// Every call runs on the blocking pool; the connection mutex is held only
/// for the duration of one call.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { conn: Arc::new(Mutex::new(db.into_connection())) }
    }

    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard =
                conn.lock().map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await?
    }
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore").finish_non_exhaustive()
    }
}

fn invalid_column(idx: usize, column_name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, column_name.to_string(), rusqlite::types::Type::Text)
}

/// Parses an RFC3339 timestamp string from a row into a `DateTime<Utc>`.
fn parse_timestamp(row: &Row, idx: usize, column_name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let timestamp_str: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&timestamp_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| invalid_column(idx, column_name))
}

fn parse_optional_timestamp(row: &Row, idx: usize, column_name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let timestamp_str: Option<String> = row.get(idx)?;
    timestamp_str
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| invalid_column(idx, column_name))
        })
        .transpose()
}

/// Parses an optional JSON field from a row into a deserializable type.
fn parse_optional_json_field<T>(row: &Row, idx: usize, column_name: &str) -> rusqlite::Result<Option<T>>
where
    T: serde::de::DeserializeOwned,
{
    let json_str: Option<String> = row.get(idx)?;
    match json_str {
        Some(s) => serde_json::from_str(&s).map(Some).map_err(|_| invalid_column(idx, column_name)),
        None => Ok(None),
    }
}

fn parse_text<T: std::str::FromStr>(row: &Row, idx: usize, column_name: &str) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|_| invalid_column(idx, column_name))
}

fn to_optional_json<T: serde::Serialize>(value: Option<&T>) -> StoreResult<Option<String>> {
    Ok(value.map(serde_json::to_string).transpose()?)
}

fn job_from_row(row: &Row) -> rusqlite::Result<TrainingJob> {
    Ok(TrainingJob {
        id: TrainingJobId(row.get(0)?),
        model_id: row.get(1)?,
        user_id: row.get(2)?,
        stage: parse_text(row, 3, "stage")?,
        total_epochs: row.get(4)?,
        current_epoch: row.get(5)?,
        progress: row.get(6)?,
        final_metrics: parse_optional_json_field(row, 7, "final_metrics_json")?,
        error: row.get(8)?,
        created_at: parse_timestamp(row, 9, "created_at")?,
        updated_at: parse_timestamp(row, 10, "updated_at")?,
    })
}

fn model_from_row(row: &Row) -> rusqlite::Result<ModelRecord> {
    Ok(ModelRecord {
        model_id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        status: parse_text(row, 3, "status")?,
        training_config: parse_optional_json_field(row, 4, "training_config_json")?,
        metrics: parse_optional_json_field(row, 5, "metrics_json")?,
        repository: row.get(6)?,
        deployed_at: parse_optional_timestamp(row, 7, "deployed_at")?,
        updated_at: parse_timestamp(row, 8, "updated_at")?,
    })
}

fn epoch_from_row(row: &Row) -> rusqlite::Result<EpochRecord> {
    Ok(EpochRecord {
        job_id: TrainingJobId(row.get(0)?),
        epoch_number: row.get(1)?,
        loss: row.get(2)?,
        accuracy: row.get(3)?,
        validation_loss: row.get(4)?,
        validation_accuracy: row.get(5)?,
        learning_rate: row.get(6)?,
        recorded_at: parse_timestamp(row, 7, "recorded_at")?,
    })
}

fn deployment_from_row(row: &Row) -> rusqlite::Result<DeploymentRecord> {
    let success: i64 = row.get(4)?;
    Ok(DeploymentRecord {
        job_id: TrainingJobId(row.get(0)?),
        model_id: row.get(1)?,
        repository: row.get(2)?,
        deployed_at: parse_timestamp(row, 3, "deployed_at")?,
        success: success != 0,
        error: row.get(5)?,
    })
}

fn select_job(conn: &Connection, id: &str) -> StoreResult<TrainingJob> {
    conn.query_row(&format!("SELECT {JOB_COLUMNS} FROM training_jobs WHERE id = ?1"), params![id], job_from_row)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("job {id}")))
}

fn select_model(conn: &Connection, model_id: &str) -> StoreResult<ModelRecord> {
    conn.query_row(
        &format!("SELECT {MODEL_COLUMNS} FROM models WHERE model_id = ?1"),
        params![model_id],
        model_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("model {model_id}")))
}

fn write_job(conn: &Connection, job: &TrainingJob) -> StoreResult<()> {
    conn.execute(
        "UPDATE training_jobs SET stage = ?2, total_epochs = ?3, current_epoch = ?4, progress = ?5, \
         final_metrics_json = ?6, error = ?7, updated_at = ?8 WHERE id = ?1",
        params![
            job.id.as_str(),
            job.stage.as_str(),
            job.total_epochs,
            job.current_epoch,
            job.progress,
            to_optional_json(job.final_metrics.as_ref())?,
            job.error,
            job.updated_at.to_rfc3339()
        ],
    )?;
    Ok(())
}

fn write_model(conn: &Connection, record: &ModelRecord) -> StoreResult<()> {
    conn.execute(
        "UPDATE models SET status = ?2, training_config_json = ?3, metrics_json = ?4, \
         repository = ?5, deployed_at = ?6, updated_at = ?7 WHERE model_id = ?1",
        params![
            record.model_id,
            record.status.as_str(),
            to_optional_json(record.training_config.as_ref())?,
            to_optional_json(record.metrics.as_ref())?,
            record.repository,
            record.deployed_at.map(|at| at.to_rfc3339()),
            record.updated_at.to_rfc3339()
        ],
    )?;
    Ok(())
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn ensure_model(&self, spec: &ModelSpec) -> StoreResult<ModelRecord> {
        let record = ModelRecord::registered(spec);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO models (model_id, user_id, name, status, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.model_id,
                    record.user_id,
                    record.name,
                    record.status.as_str(),
                    record.updated_at.to_rfc3339()
                ],
            )?;
            select_model(conn, &record.model_id)
        })
        .await
    }

    async fn read_model(&self, model_id: &str) -> StoreResult<ModelRecord> {
        let model_id = model_id.to_string();
        self.with_conn(move |conn| select_model(conn, &model_id)).await
    }

    async fn update_model_status(&self, model_id: &str, update: &ModelStatusUpdate) -> StoreResult<ModelRecord> {
        let model_id = model_id.to_string();
        let update = update.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut record = select_model(&tx, &model_id)?;
            record.apply(&update);
            write_model(&tx, &record)?;
            tx.commit()?;
            debug!(model_id = %record.model_id, status = %record.status, "Updated model status");
            Ok(record)
        })
        .await
    }

    async fn create_job(&self, job: &NewTrainingJob) -> StoreResult<TrainingJob> {
        let created = TrainingJob::from_new(TrainingJobId::new(), job);
        self.with_conn(move |conn| {
            conn.execute(
                &format!("INSERT INTO training_jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                params![
                    created.id.as_str(),
                    created.model_id,
                    created.user_id,
                    created.stage.as_str(),
                    created.total_epochs,
                    created.current_epoch,
                    created.progress,
                    to_optional_json(created.final_metrics.as_ref())?,
                    created.error,
                    created.created_at.to_rfc3339(),
                    created.updated_at.to_rfc3339()
                ],
            )?;
            info!(job_id = %created.id, model_id = %created.model_id, "Created training job");
            Ok(created)
        })
        .await
    }

    async fn read_job(&self, id: &TrainingJobId) -> StoreResult<TrainingJob> {
        let id = id.clone();
        self.with_conn(move |conn| select_job(conn, id.as_str())).await
    }

    async fn update_job(&self, id: &TrainingJobId, update: &JobUpdate) -> StoreResult<TrainingJob> {
        let id = id.clone();
        let update = update.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut job = select_job(&tx, id.as_str())?;
            apply_job_update(&mut job, &update)?;
            write_job(&tx, &job)?;
            tx.commit()?;
            debug!(job_id = %job.id, stage = %job.stage, current_epoch = job.current_epoch, "Updated job");
            Ok(job)
        })
        .await
    }

    async fn append_epoch(&self, record: &EpochRecord) -> StoreResult<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let job = select_job(&tx, record.job_id.as_str())?;
            let last: u32 = tx.query_row(
                "SELECT COALESCE(MAX(epoch_number), 0) FROM training_epochs WHERE job_id = ?1",
                params![record.job_id.as_str()],
                |row| row.get(0),
            )?;
            check_next_epoch(&job, last, record.epoch_number)?;
            tx.execute(
                "INSERT INTO training_epochs (job_id, epoch_number, loss, accuracy, validation_loss, \
                 validation_accuracy, learning_rate, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.job_id.as_str(),
                    record.epoch_number,
                    record.loss,
                    record.accuracy,
                    record.validation_loss,
                    record.validation_accuracy,
                    record.learning_rate,
                    record.recorded_at.to_rfc3339()
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_epochs(&self, id: &TrainingJobId) -> StoreResult<Vec<EpochRecord>> {
        let id = id.clone();
        self.with_conn(move |conn| {
            select_job(conn, id.as_str())?;
            let mut stmt = conn.prepare(
                "SELECT job_id, epoch_number, loss, accuracy, validation_loss, validation_accuracy, \
                 learning_rate, recorded_at FROM training_epochs WHERE job_id = ?1 ORDER BY epoch_number",
            )?;
            let epochs = stmt
                .query_map(params![id.as_str()], epoch_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(epochs)
        })
        .await
    }

    async fn begin_deployment(&self, id: &TrainingJobId, abandoned_before: DateTime<Utc>) -> StoreResult<TrainingJob> {
        let id = id.clone();
        self.with_conn(move |conn| {
            // Takes the write lock before reading so other processes see the claim.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut job = select_job(&tx, id.as_str())?;
            claim_deployment(&mut job, abandoned_before)?;
            write_job(&tx, &job)?;
            tx.commit()?;
            info!(job_id = %job.id, "Claimed job for deployment");
            Ok(job)
        })
        .await
    }

    async fn finish_deployment(&self, record: &DeploymentRecord) -> StoreResult<TrainingJob> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut job = select_job(&tx, record.job_id.as_str())?;
            apply_job_update(&mut job, &deployment_outcome(&record))?;
            if record.success {
                let mut model = select_model(&tx, &record.model_id)?;
                model.apply(&deployed_model(&record));
                write_model(&tx, &model)?;
            }
            tx.execute(
                "INSERT INTO deployments (job_id, model_id, repository, deployed_at, success, error) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.job_id.as_str(),
                    record.model_id,
                    record.repository,
                    record.deployed_at.to_rfc3339(),
                    i64::from(record.success),
                    record.error
                ],
            )?;
            write_job(&tx, &job)?;
            tx.commit()?;
            info!(job_id = %job.id, stage = %job.stage, repository = %record.repository, "Recorded deployment");
            Ok(job)
        })
        .await
    }

    async fn list_deployments(&self, id: &TrainingJobId) -> StoreResult<Vec<DeploymentRecord>> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT job_id, model_id, repository, deployed_at, success, error FROM deployments \
                 WHERE job_id = ?1 ORDER BY id",
            )?;
            let deployments = stmt
                .query_map(params![id.as_str()], deployment_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(deployments)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_training::{EpochMetrics, MetricsSummary, ModelStatus, PublishRequest, Stage, TrainingConfig};

    async fn training_job(store: &SqliteJobStore, total: u32) -> TrainingJob {
        let spec = ModelSpec::new("m1", "abcdef1234", "My Classifier");
        store.ensure_model(&spec).await.unwrap();
        let job = store.create_job(&NewTrainingJob::for_model(&spec)).await.unwrap();
        store.update_job(&job.id, &JobUpdate::stage(Stage::Configuring)).await.unwrap();
        let update = JobUpdate { total_epochs: Some(total), ..JobUpdate::stage(Stage::Training) };
        store.update_job(&job.id, &update).await.unwrap()
    }

    fn metrics(epoch: u32) -> EpochMetrics {
        EpochMetrics {
            loss: 2.0 / f64::from(epoch),
            accuracy: 0.5,
            validation_loss: 2.5 / f64::from(epoch),
            validation_accuracy: 0.45,
        }
    }

    #[tokio::test]
    async fn test_job_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.db");

        let job_id = {
            let store = SqliteJobStore::open(&path).unwrap();
            let job = training_job(&store, 2).await;
            for epoch in 1..=2 {
                store.append_epoch(&EpochRecord::new(job.id.clone(), epoch, metrics(epoch), 0.001)).await.unwrap();
            }
            let summary = MetricsSummary { final_loss: 1.0, final_accuracy: 0.5 };
            let done = JobUpdate { final_metrics: Some(summary), ..JobUpdate::epoch(2).with_stage(Stage::Completed) };
            store.update_job(&job.id, &done).await.unwrap();
            job.id
        };

        let reopened = SqliteJobStore::open(&path).unwrap();
        let job = reopened.read_job(&job_id).await.unwrap();
        assert_eq!(job.stage, Stage::Completed);
        assert_eq!((job.current_epoch, job.total_epochs, job.progress), (2, 2, 100));
        assert_eq!(job.final_metrics.map(|m| m.final_loss), Some(1.0));

        let epochs = reopened.list_epochs(&job_id).await.unwrap();
        assert_eq!(epochs.iter().map(|e| e.epoch_number).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(epochs[1].loss, 1.0);
    }

    #[tokio::test]
    async fn test_append_epoch_rejects_duplicates_and_gaps() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let job = training_job(&store, 3).await;

        store.append_epoch(&EpochRecord::new(job.id.clone(), 1, metrics(1), 0.001)).await.unwrap();
        let dup = store.append_epoch(&EpochRecord::new(job.id.clone(), 1, metrics(1), 0.001)).await;
        assert!(matches!(dup, Err(StoreError::Duplicate(_))));
        let gap = store.append_epoch(&EpochRecord::new(job.id.clone(), 3, metrics(3), 0.001)).await;
        assert!(matches!(gap, Err(StoreError::InvalidData(_))));
        assert_eq!(store.list_epochs(&job.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stage_rules_apply() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let job = training_job(&store, 3).await;

        let err = store.update_job(&job.id, &JobUpdate::stage(Stage::Deploying)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(store.read_job(&job.id).await.unwrap().stage, Stage::Training);
    }

    #[tokio::test]
    async fn test_model_status_round_trip() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let spec = ModelSpec::new("m1", "abcdef1234", "My Classifier");
        store.ensure_model(&spec).await.unwrap();

        store.update_model_status("m1", &ModelStatusUpdate::training(TrainingConfig::default())).await.unwrap();
        let at = Utc::now();
        let record = store
            .update_model_status("m1", &ModelStatusUpdate::deployed("abcdef12/my-classifier", at))
            .await
            .unwrap();

        let read = store.read_model("m1").await.unwrap();
        assert_eq!(read, record);
        assert_eq!(read.status, ModelStatus::Deployed);
        assert_eq!(read.training_config, Some(TrainingConfig::default()));
        assert_eq!(read.repository.as_deref(), Some("abcdef12/my-classifier"));
        assert!(matches!(
            store.update_model_status("missing", &ModelStatusUpdate::new(ModelStatus::Failed)).await,
            Err(StoreError::NotFound(_))
        ));
    }

    async fn completed_job(store: &SqliteJobStore) -> TrainingJob {
        let job = training_job(store, 1).await;
        let summary = MetricsSummary { final_loss: 0.5, final_accuracy: 0.5 };
        let done = JobUpdate { final_metrics: Some(summary), ..JobUpdate::epoch(1).with_stage(Stage::Completed) };
        store.update_job(&job.id, &done).await.unwrap()
    }

    fn an_hour_ago() -> DateTime<Utc> {
        Utc::now() - chrono::Duration::hours(1)
    }

    #[tokio::test]
    async fn test_deployments_are_listed_in_order() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let job = completed_job(&store).await;
        let request = PublishRequest {
            job_id: job.id.clone(),
            model_id: job.model_id.clone(),
            repository: "abcdef12/my-classifier".to_string(),
        };

        store.begin_deployment(&job.id, an_hour_ago()).await.unwrap();
        let failed = store.finish_deployment(&DeploymentRecord::failed(&request, "registry down")).await.unwrap();
        assert_eq!(failed.stage, Stage::DeployFailed);
        assert_eq!(store.read_model("m1").await.unwrap().status, ModelStatus::Registered);

        store.begin_deployment(&job.id, an_hour_ago()).await.unwrap();
        let deployed = store.finish_deployment(&DeploymentRecord::succeeded(&request)).await.unwrap();
        assert_eq!(deployed.stage, Stage::Deployed);
        assert_eq!(store.read_model("m1").await.unwrap().repository.as_deref(), Some("abcdef12/my-classifier"));

        let attempts = store.list_deployments(&job.id).await.unwrap();
        assert_eq!(attempts.iter().map(|d| d.success).collect::<Vec<_>>(), vec![false, true]);
        assert_eq!(attempts[0].error.as_deref(), Some("registry down"));
    }

    #[tokio::test]
    async fn test_only_one_connection_claims_a_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.db");
        let first = SqliteJobStore::open(&path).unwrap();
        let second = SqliteJobStore::open(&path).unwrap();
        let job = completed_job(&first).await;

        let (a, b) = tokio::join!(
            first.begin_deployment(&job.id, an_hour_ago()),
            second.begin_deployment(&job.id, an_hour_ago())
        );
        let claimed = [a.is_ok(), b.is_ok()];
        assert_eq!(claimed.iter().filter(|ok| **ok).count(), 1, "{claimed:?}");
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(loser, Err(StoreError::Conflict(_))));
        assert_eq!(second.read_job(&job.id).await.unwrap().stage, Stage::Deploying);
    }

    #[tokio::test]
    async fn test_stale_claim_is_taken_over_from_another_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.db");
        let crashed = SqliteJobStore::open(&path).unwrap();
        let job = completed_job(&crashed).await;
        let claimed = crashed.begin_deployment(&job.id, an_hour_ago()).await.unwrap();
        drop(crashed);

        let store = SqliteJobStore::open(&path).unwrap();
        let taken = store
            .begin_deployment(&job.id, claimed.updated_at + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(taken.stage, Stage::Deploying);
        assert!(taken.updated_at >= claimed.updated_at);
    }
}
