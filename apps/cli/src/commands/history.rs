//! Epoch history command implementation.

use crate::render;
use anyhow::Result;
use kiln_orchestrator::StatusReporter;
use kiln_store::JobStores;

pub async fn execute(stores: JobStores, job_id: &str, json: bool) -> Result<()> {
    let reporter = StatusReporter::new(stores);
    // Unknown jobs are an error rather than an empty history.
    reporter.get_status(Some(job_id)).await?;
    let history = reporter.get_history(Some(job_id)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
    } else {
        render::print_history(job_id, &history);
    }
    Ok(())
}
