//! Dataset analysis that precedes configuration.
//!
//! The result is advisory and ephemeral: it is attached to a job while it
//! waits in `Configuring` and is never persisted by the core.

use crate::error::TrainingResult;
use crate::job::{ComputeClass, CreationMode, ModelSpec, TrainingConfig, TrainingMode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetShape {
    pub rows: u64,
    pub columns: u32,
    pub numerical_columns: u32,
    pub categorical_columns: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub shape: DatasetShape,
    pub features: Vec<String>,
    pub target_column: String,
    pub suggested_epochs: u32,
    pub suggested_batch_size: u32,
    /// Human-readable range, e.g. "15-25 minutes".
    pub estimated_time: String,
    pub architecture: String,
}

impl AnalysisResult {
    /// Training config built from the suggestions and the default learning rate.
    #[must_use]
    pub fn suggested_config(&self) -> TrainingConfig {
        TrainingConfig {
            epochs: self.suggested_epochs,
            batch_size: self.suggested_batch_size,
            ..TrainingConfig::default()
        }
    }
}

#[async_trait]
pub trait DatasetAnalyzer: Send + Sync {
    fn id(&self) -> &'static str;

    async fn analyze(&self, model: &ModelSpec) -> TrainingResult<AnalysisResult>;
}

/// Analyzer that derives its result from the model's declared settings after
/// an artificial delay.
#[derive(Debug, Clone, Default)]
pub struct SimulatedAnalyzer {
    delay: Duration,
}

impl SimulatedAnalyzer {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl DatasetAnalyzer for SimulatedAnalyzer {
    fn id(&self) -> &'static str {
        "simulated"
    }

    async fn analyze(&self, model: &ModelSpec) -> TrainingResult<AnalysisResult> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(analyze_declared(model))
    }
}

/// Heuristic analysis from the model's declared mode and compute class.
#[must_use]
pub fn analyze_declared(model: &ModelSpec) -> AnalysisResult {
    let reinforcement = model.training_mode == TrainingMode::Reinforcement;
    let compute = model.compute.as_str().to_uppercase();

    let suggested_epochs = if reinforcement {
        20
    } else {
        match model.compute {
            ComputeClass::Tpu => 5,
            ComputeClass::Gpu => 8,
            ComputeClass::Cpu => 10,
        }
    };
    let suggested_batch_size = match model.compute {
        ComputeClass::Tpu => 64,
        ComputeClass::Gpu => 32,
        ComputeClass::Cpu => 16,
    };
    let estimated_time = if reinforcement {
        "30-45 minutes"
    } else {
        match model.compute {
            ComputeClass::Tpu => "5-8 minutes",
            ComputeClass::Gpu => "10-15 minutes",
            ComputeClass::Cpu => "15-25 minutes",
        }
    };
    let architecture = match model.creation_mode {
        CreationMode::FromScratch => {
            format!("Custom {} model with PyTorch {compute}", mode_label(model.training_mode))
        }
        CreationMode::FineTune => {
            let base = if model.base_model.is_empty() { "base model" } else { model.base_model.as_str() };
            format!("{base} fine-tuning with PyTorch {compute}")
        }
    };
    let target_column = if model.target_column.trim().is_empty() {
        "label".to_string()
    } else {
        model.target_column.clone()
    };

    AnalysisResult {
        shape: DatasetShape {
            rows: if model.auto_find_dataset { 100_000 } else { 50_000 },
            columns: 15,
            numerical_columns: 10,
            categorical_columns: 5,
        },
        features: (1..=5).map(|i| format!("feature{i}")).collect(),
        target_column,
        suggested_epochs,
        suggested_batch_size,
        estimated_time: estimated_time.to_string(),
        architecture,
    }
}

fn mode_label(mode: TrainingMode) -> &'static str {
    match mode {
        TrainingMode::Supervised => "Supervised",
        TrainingMode::Reinforcement => "Reinforcement",
        TrainingMode::Other => "Other",
    }
}
