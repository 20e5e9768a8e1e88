//! Status command implementation.

use crate::render;
use anyhow::Result;
use kiln_orchestrator::StatusReporter;
use kiln_store::JobStores;

/// Prints the stored snapshot of a job. Reads the store directly, so it
/// works while another process runs the job.
pub async fn execute(stores: JobStores, job_id: &str, json: bool) -> Result<()> {
    let status = StatusReporter::new(stores).get_status(Some(job_id)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        render::print_status(&status);
    }
    Ok(())
}
