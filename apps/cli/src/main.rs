//! Kiln CLI - Command-line interface for the Kiln training orchestrator
//!
//! This CLI provides a `kiln` command that trains a model through the epoch
//! loop, reports job status and history from the job store, and deploys
//! completed jobs.

mod commands;
mod render;

use anyhow::Context;
use clap::{Parser, Subcommand};
use commands::{deploy, history, status, train};
use kiln_orchestrator::KilnConfig;
use kiln_store::JobStores;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Kiln - training job orchestration
#[derive(Parser, Debug)]
#[command(name = "kiln", author, version, about = "Kiln - training job orchestration")]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Configuration file (defaults to ./kiln.toml, then ~/.kiln/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Job database path (overrides the configuration)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze a dataset and train a model, following progress until the
    /// job finishes. Ctrl-C cancels the job between epochs.
    Train(train::TrainArgs),

    /// Show the stored status of a job
    Status {
        /// Job identifier
        job_id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the epoch history of a job
    History {
        /// Job identifier
        job_id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Publish the model of a completed job to the artifact registry
    Deploy {
        /// Job identifier
        job_id: String,

        /// Registry access token
        #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so JSON output on stdout stays parseable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = KilnConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(db) = args.db {
        config.store.path = db;
    }
    debug!(db = %config.store.path.display(), "configuration loaded");

    let store = config
        .open_store()
        .with_context(|| format!("Failed to open job store at {}", config.store.path.display()))?;
    let stores = JobStores::new(Arc::new(store));

    match args.command {
        Command::Train(train_args) => train::execute(&config, stores, train_args).await,
        Command::Status { job_id, json } => status::execute(stores, &job_id, json).await,
        Command::History { job_id, json } => history::execute(stores, &job_id, json).await,
        Command::Deploy { job_id, token, json } => deploy::execute(&config, stores, &job_id, token, json).await,
    }
}
