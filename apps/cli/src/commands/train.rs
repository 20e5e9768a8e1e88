//! Training command implementation.

use crate::render::{self, ConsoleProgress};
use anyhow::{Context, Result, bail};
use clap::{Args, ValueEnum};
use colored::Colorize;
use kiln_orchestrator::{KilnConfig, OrchestrationError, TrainingOrchestrator};
use kiln_store::JobStores;
use kiln_training::{
    AnalysisResult, ComputeClass, CreationMode, ModelSpec, NoopProgressSink, Stage, TrainingConfig, TrainingMode,
};
use std::sync::Arc;
use tracing::warn;

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Model name; the deployed repository is named after it
    #[arg(long)]
    pub name: String,

    /// Model identifier (generated when omitted)
    #[arg(long)]
    pub model_id: Option<String>,

    /// Owner of the model
    #[arg(long, default_value = "local-user")]
    pub user_id: String,

    /// Base model to fine-tune
    #[arg(long, default_value = "")]
    pub base_model: String,

    #[arg(long, default_value = "classification")]
    pub task_type: String,

    #[arg(long, value_enum, default_value_t = ModeArg::Supervised)]
    pub mode: ModeArg,

    /// Train from scratch instead of fine-tuning
    #[arg(long)]
    pub from_scratch: bool,

    #[arg(long, value_enum, default_value_t = ComputeArg::Cpu)]
    pub compute: ComputeArg,

    #[arg(long, default_value = "label")]
    pub target_column: String,

    /// Let the platform find a dataset instead of using an uploaded one
    #[arg(long)]
    pub auto_dataset: bool,

    /// Number of epochs (defaults to the analysis suggestion)
    #[arg(long)]
    pub epochs: Option<u32>,

    /// Batch size (defaults to the analysis suggestion)
    #[arg(long)]
    pub batch_size: Option<u32>,

    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Print only the final job status as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Supervised,
    Reinforcement,
    Other,
}

impl From<ModeArg> for TrainingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Supervised => Self::Supervised,
            ModeArg::Reinforcement => Self::Reinforcement,
            ModeArg::Other => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ComputeArg {
    Cpu,
    Gpu,
    Tpu,
}

impl From<ComputeArg> for ComputeClass {
    fn from(compute: ComputeArg) -> Self {
        match compute {
            ComputeArg::Cpu => Self::Cpu,
            ComputeArg::Gpu => Self::Gpu,
            ComputeArg::Tpu => Self::Tpu,
        }
    }
}

impl TrainArgs {
    fn model(&self) -> ModelSpec {
        let id = self.model_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        ModelSpec {
            base_model: self.base_model.clone(),
            task_type: self.task_type.clone(),
            training_mode: self.mode.into(),
            creation_mode: if self.from_scratch { CreationMode::FromScratch } else { CreationMode::FineTune },
            compute: self.compute.into(),
            target_column: self.target_column.clone(),
            auto_find_dataset: self.auto_dataset,
            ..ModelSpec::new(id, self.user_id.clone(), self.name.clone())
        }
    }

    /// Explicit values win over the analysis suggestion.
    fn training_config(&self, analysis: &AnalysisResult) -> TrainingConfig {
        let suggested = analysis.suggested_config();
        TrainingConfig {
            epochs: self.epochs.unwrap_or(suggested.epochs),
            batch_size: self.batch_size.unwrap_or(suggested.batch_size),
            learning_rate: self.learning_rate.unwrap_or(suggested.learning_rate),
        }
    }

    /// Rejects explicit out-of-range values before a job is created.
    fn check_overrides(&self) -> Result<()> {
        let defaults = TrainingConfig::default();
        TrainingConfig {
            epochs: self.epochs.unwrap_or(defaults.epochs),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            learning_rate: self.learning_rate.unwrap_or(defaults.learning_rate),
        }
        .validate()?;
        Ok(())
    }
}

pub async fn execute(config: &KilnConfig, stores: JobStores, args: TrainArgs) -> Result<()> {
    args.check_overrides()?;

    let orchestrator = TrainingOrchestrator::from_config(config, stores);
    let orchestrator = if args.json {
        orchestrator.with_progress_sink(Arc::new(NoopProgressSink))
    } else {
        orchestrator.with_progress_sink(Arc::new(ConsoleProgress))
    };

    let prepared = orchestrator.prepare(args.model()).await.context("Failed to prepare training job")?;
    let job_id = prepared.job_id.clone();
    if !args.json {
        render::print_analysis(&prepared);
    }

    let training = args.training_config(&prepared.analysis);
    orchestrator.start(&job_id, training).await.context("Failed to start training")?;

    let stage = tokio::select! {
        stage = orchestrator.join(&job_id) => stage?,
        Ok(()) = tokio::signal::ctrl_c() => {
            eprintln!("{}", "Cancelling after the current epoch...".yellow());
            if let Err(err) = orchestrator.cancel(&job_id) {
                warn!(job_id = %job_id, error = %err, "cancellation not applied");
            }
            orchestrator.join(&job_id).await?
        }
    };

    let status = orchestrator.status_reporter().get_status(Some(job_id.as_str())).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        render::print_status(&status);
    }

    match stage {
        Stage::Failed => bail!("training failed: {}", status.error.as_deref().unwrap_or("unknown error")),
        Stage::Cancelled => Err(OrchestrationError::Cancelled.into()),
        _ => Ok(()),
    }
}
