//! Training job orchestration for Kiln.
//!
//! Drives a job from dataset analysis through the epoch loop to deployment,
//! persisting every step through [`kiln_store::JobStore`].

pub mod config;
pub mod deployment;
mod epoch_loop;
pub mod error;
pub mod orchestrator;
pub mod retry;
pub mod status;

pub use config::{
    BackendKind, BackendSettings, ConfigError, KilnConfig, OrchestratorSettings, RegistryKind, RegistrySettings,
    RetrySettings, StoreSettings,
};
pub use deployment::DeploymentCoordinator;
pub use error::{ErrorKind, OrchestrationError, Result};
pub use orchestrator::{OrchestratorOptions, PreparedJob, StartAck, StartTrainingRequest, TrainingOrchestrator};
pub use retry::{RetryPolicy, Retryable, with_retry};
pub use status::{JobStatus, StatusReporter};
