//! Database connection and schema management.

use crate::error::StoreResult;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection wrapper.
///
/// Manages the SQLite connection, its pragmas, and schema initialization.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (creating if needed) the database file at `path`.
    ///
    /// The file is switched to WAL mode so status readers in other
    /// processes are not blocked by the epoch loop's writes.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "opened database");
        Self::from_connection(conn)
    }

    /// Opens an in-memory database for testing.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Gets a reference to the underlying connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn into_connection(self) -> Connection {
        self.conn
    }

    fn init_schema(&self) -> StoreResult<()> {
        info!("Initializing database schema");

        self.conn.execute(
            r"
            CREATE TABLE IF NOT EXISTS models (
                model_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                training_config_json TEXT,
                metrics_json TEXT,
                repository TEXT,
                deployed_at TEXT,
                updated_at TEXT NOT NULL
            )
            ",
            [],
        )?;

        self.conn.execute(
            r"
            CREATE TABLE IF NOT EXISTS training_jobs (
                id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                total_epochs INTEGER NOT NULL,
                current_epoch INTEGER NOT NULL,
                progress INTEGER NOT NULL,
                final_metrics_json TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
            [],
        )?;

        // (job_id, epoch_number) is the uniqueness constraint of the history.
        self.conn.execute(
            r"
            CREATE TABLE IF NOT EXISTS training_epochs (
                job_id TEXT NOT NULL,
                epoch_number INTEGER NOT NULL,
                loss REAL NOT NULL,
                accuracy REAL NOT NULL,
                validation_loss REAL NOT NULL,
                validation_accuracy REAL NOT NULL,
                learning_rate REAL NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (job_id, epoch_number)
            )
            ",
            [],
        )?;

        self.conn.execute(
            r"
            CREATE TABLE IF NOT EXISTS deployments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                repository TEXT NOT NULL,
                deployed_at TEXT NOT NULL,
                success INTEGER NOT NULL,
                error TEXT
            )
            ",
            [],
        )?;

        self.conn
            .execute("CREATE INDEX IF NOT EXISTS idx_training_jobs_model_id ON training_jobs(model_id)", [])?;
        self.conn.execute("CREATE INDEX IF NOT EXISTS idx_deployments_job_id ON deployments(job_id)", [])?;

        Ok(())
    }
}
