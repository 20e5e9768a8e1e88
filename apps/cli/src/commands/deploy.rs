//! Deployment command implementation.

use anyhow::Result;
use colored::Colorize;
use kiln_orchestrator::{DeploymentCoordinator, KilnConfig};
use kiln_store::JobStores;
use kiln_training::TrainingJobId;

pub async fn execute(
    config: &KilnConfig,
    stores: JobStores,
    job_id: &str,
    token: Option<String>,
    json: bool,
) -> Result<()> {
    let coordinator = DeploymentCoordinator::from_config(config, stores);
    let record = coordinator.deploy(&TrainingJobId::from(job_id), token.as_deref()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!();
    println!("{}", "Model deployed".bold().green());
    println!("  Job:        {}", record.job_id.as_str().cyan());
    println!("  Repository: {}", record.repository.cyan());
    println!("  Deployed:   {}", record.deployed_at.to_rfc3339().dimmed());
    println!();
    Ok(())
}
