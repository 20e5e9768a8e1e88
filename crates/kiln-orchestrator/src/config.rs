//! Runtime configuration loaded from TOML with environment overrides.

use crate::orchestrator::OrchestratorOptions;
use crate::retry::RetryPolicy;
use kiln_store::{SqliteJobStore, StoreResult};
use kiln_training::{
    ArtifactRegistry, DatasetAnalyzer, HubRegistry, RemoteBackend, SimulatedAnalyzer, SimulatedBackend,
    SimulatedRegistry, TrainingBackend,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    pub orchestrator: OrchestratorSettings,
    pub retry: RetrySettings,
    pub store: StoreSettings,
    pub backend: BackendSettings,
    pub registry: RegistrySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Simulated computation time per epoch.
    pub epoch_delay_ms: u64,
    /// Upper bound for one epoch step, including its backend call.
    pub step_timeout_ms: u64,
    pub analysis_delay_ms: u64,
    /// Run jobs in the ephemeral store when the durable store cannot create them.
    pub allow_degraded_fallback: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self { epoch_delay_ms: 2000, step_timeout_ms: 30_000, analysis_delay_ms: 2000, allow_degraded_fallback: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_retries: 3, initial_delay_ms: 100, max_delay_ms: 5000, multiplier: 2.0 }
    }
}

impl RetrySettings {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.multiplier,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self { path: PathBuf::from("kiln.db") }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Simulated,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub url: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self { kind: BackendKind::Simulated, url: "http://localhost:8000".to_string() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    #[default]
    Simulated,
    Hub,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub kind: RegistryKind,
    pub url: String,
    pub publish_delay_ms: u64,
    pub publish_timeout_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            kind: RegistryKind::Simulated,
            url: "https://huggingface.co".to_string(),
            publish_delay_ms: 3000,
            publish_timeout_ms: 60_000,
        }
    }
}

impl KilnConfig {
    /// Loads configuration.
    ///
    /// Uses `explicit` when given. Otherwise searches in order:
    /// 1. `./kiln.toml` (workspace config)
    /// 2. `~/.kiln/config.toml` (home directory config)
    ///
    /// Falls back to defaults if no file is found. Environment overrides are
    /// applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => Self::discover()?,
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn discover() -> Result<Self, ConfigError> {
        let workspace_config = Path::new("./kiln.toml");
        if workspace_config.exists() {
            return Self::from_file(workspace_config);
        }

        if let Ok(home) = std::env::var("HOME") {
            let home_config = PathBuf::from(home).join(".kiln/config.toml");
            if home_config.exists() {
                return Self::from_file(&home_config);
            }
        }

        Ok(Self::default())
    }

    /// Parses a TOML file without environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Applies `KILN_*` overrides obtained through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("KILN_DB_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(url) = lookup("KILN_BACKEND_URL") {
            self.backend.url = url;
            self.backend.kind = BackendKind::Remote;
        }
        if let Some(delay) = lookup("KILN_EPOCH_DELAY_MS") {
            self.orchestrator.epoch_delay_ms = delay.trim().parse().map_err(|_| {
                ConfigError::Validation(format!("KILN_EPOCH_DELAY_MS must be an integer, got {delay:?}"))
            })?;
        }
        if let Some(url) = lookup("KILN_REGISTRY_URL") {
            self.registry.url = url;
            self.registry.kind = RegistryKind::Hub;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.step_timeout_ms == 0 {
            return Err(ConfigError::Validation("orchestrator.step_timeout_ms must be > 0".to_string()));
        }
        if self.registry.publish_timeout_ms == 0 {
            return Err(ConfigError::Validation("registry.publish_timeout_ms must be > 0".to_string()));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(ConfigError::Validation(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(ConfigError::Validation("retry.max_delay_ms must be >= retry.initial_delay_ms".to_string()));
        }
        if self.store.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation("store.path cannot be empty".to_string()));
        }
        if self.backend.kind == BackendKind::Remote && self.backend.url.trim().is_empty() {
            return Err(ConfigError::Validation("backend.url is required for the remote backend".to_string()));
        }
        if self.registry.kind == RegistryKind::Hub && self.registry.url.trim().is_empty() {
            return Err(ConfigError::Validation("registry.url is required for the hub registry".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            step_timeout: Duration::from_millis(self.orchestrator.step_timeout_ms),
            retry: self.retry.policy(),
            allow_degraded_fallback: self.orchestrator.allow_degraded_fallback,
            ..OrchestratorOptions::default()
        }
    }

    #[must_use]
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.registry.publish_timeout_ms)
    }

    pub fn open_store(&self) -> StoreResult<SqliteJobStore> {
        SqliteJobStore::open(&self.store.path)
    }

    #[must_use]
    pub fn build_backend(&self) -> Arc<dyn TrainingBackend> {
        match self.backend.kind {
            BackendKind::Simulated => {
                Arc::new(SimulatedBackend::new(Duration::from_millis(self.orchestrator.epoch_delay_ms)))
            }
            BackendKind::Remote => Arc::new(RemoteBackend::new(self.backend.url.clone())),
        }
    }

    #[must_use]
    pub fn build_analyzer(&self) -> Arc<dyn DatasetAnalyzer> {
        Arc::new(SimulatedAnalyzer::new(Duration::from_millis(self.orchestrator.analysis_delay_ms)))
    }

    #[must_use]
    pub fn build_registry(&self) -> Arc<dyn ArtifactRegistry> {
        match self.registry.kind {
            RegistryKind::Simulated => {
                Arc::new(SimulatedRegistry::new(Duration::from_millis(self.registry.publish_delay_ms)))
            }
            RegistryKind::Hub => Arc::new(HubRegistry::new(self.registry.url.clone())),
        }
    }
}
