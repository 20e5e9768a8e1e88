//! Terminal rendering of progress, status and history.

use colored::{ColoredString, Colorize};
use kiln_orchestrator::{JobStatus, PreparedJob};
use kiln_training::{EpochRecord, ProgressEvent, ProgressSink, Stage};

const BAR_WIDTH: usize = 20;

/// Prints one line per persisted epoch.
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { job_id, total_epochs } => {
                println!("{}", format!("Training {} ({} epochs)", job_id, total_epochs).bold());
            }
            ProgressEvent::Epoch { epoch, total_epochs, progress, metrics, .. } => {
                println!(
                    "  Epoch {:>3}/{:<3} {} {:>3}%  loss {:.4}  acc {:.4}  val_loss {:.4}  val_acc {:.4}",
                    epoch,
                    total_epochs,
                    bar(progress).cyan(),
                    progress,
                    metrics.loss,
                    metrics.accuracy,
                    metrics.validation_loss,
                    metrics.validation_accuracy,
                );
            }
            ProgressEvent::Finished { stage, .. } => {
                println!("{} {}", "Finished:".bold(), stage_label(stage));
            }
        }
    }
}

fn bar(progress: u8) -> String {
    let filled = usize::from(progress.min(100)) * BAR_WIDTH / 100;
    format!("{}{}", "█".repeat(filled), "░".repeat(BAR_WIDTH - filled))
}

fn stage_label(stage: Stage) -> ColoredString {
    let label = stage.as_str();
    match stage {
        Stage::Completed | Stage::Deployed => label.green(),
        Stage::Failed | Stage::DeployFailed => label.red(),
        Stage::Cancelled => label.yellow(),
        Stage::Analyzing | Stage::Configuring | Stage::Training | Stage::Deploying => label.cyan(),
    }
}

pub fn print_analysis(prepared: &PreparedJob) {
    let analysis = &prepared.analysis;
    println!();
    println!("{}", "Dataset analysis".bold().cyan());
    println!("  Job:          {}", prepared.job_id.as_str().cyan());
    if prepared.degraded {
        println!("  {}", "Degraded mode: this job is not persisted".yellow());
    }
    println!(
        "  Shape:        {} rows x {} columns ({} numerical, {} categorical)",
        analysis.shape.rows, analysis.shape.columns, analysis.shape.numerical_columns, analysis.shape.categorical_columns
    );
    println!("  Target:       {}", analysis.target_column);
    println!("  Architecture: {}", analysis.architecture);
    println!(
        "  Suggested:    {} epochs, batch size {} (about {})",
        analysis.suggested_epochs, analysis.suggested_batch_size, analysis.estimated_time
    );
    println!();
}

pub fn print_status(status: &JobStatus) {
    println!();
    println!("{}", "Job Status".bold().cyan());
    println!("  Job:      {}", status.job_id.as_str().cyan());
    println!("  Model:    {}", status.model_id);
    println!("  Stage:    {}", stage_label(status.stage));
    println!(
        "  Progress: {} {}% ({}/{} epochs)",
        bar(status.progress).cyan(),
        status.progress,
        status.current_epoch,
        status.total_epochs
    );
    if let Some(metrics) = &status.metrics {
        println!("  Final:    loss {:.4}, accuracy {:.4}", metrics.final_loss, metrics.final_accuracy);
    }
    if let Some(error) = &status.error {
        println!("  Error:    {}", error.red());
    }
    if !status.durable {
        println!("  {}", "Not persisted (degraded mode)".yellow());
    }
    println!("  Updated:  {}", status.updated_at.to_rfc3339().dimmed());
    println!();
}

pub fn print_history(job_id: &str, history: &[EpochRecord]) {
    println!();
    println!("{}", format!("Epoch History ({})", job_id).bold().cyan());
    println!();

    if history.is_empty() {
        println!("  {}", "No epochs recorded yet.".dimmed());
        println!();
        return;
    }

    println!("{:>6} {:>10} {:>10} {:>10} {:>10}", "Epoch", "Loss", "Accuracy", "Val Loss", "Val Acc");
    println!("{}", "─".repeat(50));
    for record in history {
        println!(
            "{:>6} {:>10.4} {:>10.4} {:>10.4} {:>10.4}",
            record.epoch_number, record.loss, record.accuracy, record.validation_loss, record.validation_accuracy
        );
    }
    println!();
}
