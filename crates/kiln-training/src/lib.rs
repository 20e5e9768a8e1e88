//! Kiln Training
//!
//! Domain types and pluggable backends for the training orchestrator:
//! - Job stages and their transition table (`Stage`)
//! - Jobs, configs, epoch metrics and model status records
//! - Dataset analysis (`DatasetAnalyzer`)
//! - Epoch execution (`TrainingBackend`)
//! - Publishing to an artifact registry (`ArtifactRegistry`)

pub mod analysis;
pub mod backend;
pub mod deployment;
pub mod error;
pub mod job;
pub mod metrics;
pub mod model;
pub mod progress;
pub mod stage;

pub use analysis::{AnalysisResult, DatasetAnalyzer, DatasetShape, SimulatedAnalyzer, analyze_declared};
pub use backend::{EpochRequest, RemoteBackend, SimulatedBackend, TrainingBackend};
pub use deployment::{
    ArtifactRegistry, DeployCredential, DeploymentRecord, HubRegistry, PublishRequest, SimulatedRegistry,
    repository_id,
};
pub use error::{TrainingError, TrainingResult};
pub use job::{
    ComputeClass, CreationMode, EPHEMERAL_JOB_PREFIX, JobUpdate, ModelSpec, NewTrainingJob, TrainingConfig,
    TrainingJob, TrainingJobId, TrainingMode, progress_percent,
};
pub use metrics::{EpochMetrics, EpochRecord, MetricsGenerator, MetricsSummary};
pub use model::{ModelRecord, ModelStatus, ModelStatusUpdate};
pub use progress::{NoopProgressSink, ProgressEvent, ProgressSink, TracingProgressSink};
pub use stage::Stage;
