//! Publishing trained models to an artifact registry.

use crate::error::{TrainingError, TrainingResult};
use crate::job::TrainingJobId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error};

const CREDENTIAL_PREFIX: &str = "hf_";
const CREDENTIAL_MIN_LEN: usize = 20;
const OWNER_PREFIX_LEN: usize = 8;

/// Registry access token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct DeployCredential(String);

impl DeployCredential {
    /// Checks the token's shape without contacting the registry.
    pub fn parse(raw: &str) -> TrainingResult<Self> {
        let token = raw.trim();
        if token.is_empty() {
            return Err(TrainingError::InvalidCredential("token is empty".to_string()));
        }
        if !token.starts_with(CREDENTIAL_PREFIX) {
            return Err(TrainingError::InvalidCredential(format!(
                "token must start with '{CREDENTIAL_PREFIX}'"
            )));
        }
        if token.chars().count() < CREDENTIAL_MIN_LEN {
            return Err(TrainingError::InvalidCredential(format!(
                "token must be at least {CREDENTIAL_MIN_LEN} characters"
            )));
        }
        Ok(Self(token.to_string()))
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeployCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeployCredential(***)")
    }
}

/// Repository id for a model: `<first 8 chars of owner>/<slugged name>`.
///
/// The name is lowercased and every whitespace run becomes a single `-`.
#[must_use]
pub fn repository_id(user_id: &str, model_name: &str) -> String {
    let owner: String = user_id.chars().take(OWNER_PREFIX_LEN).collect();
    let slug = model_name.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join("-");
    format!("{owner}/{slug}")
}

/// Outcome of one deployment attempt. Failed attempts are recorded too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub job_id: TrainingJobId,
    pub model_id: String,
    pub repository: String,
    pub deployed_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl DeploymentRecord {
    #[must_use]
    pub fn succeeded(request: &PublishRequest) -> Self {
        Self {
            job_id: request.job_id.clone(),
            model_id: request.model_id.clone(),
            repository: request.repository.clone(),
            deployed_at: Utc::now(),
            success: true,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(request: &PublishRequest, error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), ..Self::succeeded(request) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub job_id: TrainingJobId,
    pub model_id: String,
    pub repository: String,
}

impl PublishRequest {
    /// Owner half of `repository`.
    #[must_use]
    pub fn organization(&self) -> &str {
        self.repository.split_once('/').map_or("", |(owner, _)| owner)
    }

    /// Name half of `repository`.
    #[must_use]
    pub fn name(&self) -> &str {
        self.repository.split_once('/').map_or(self.repository.as_str(), |(_, name)| name)
    }
}

#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    fn id(&self) -> &'static str;

    async fn publish(&self, request: &PublishRequest, credential: &DeployCredential) -> TrainingResult<()>;
}

/// Registry that accepts every well-formed request after a delay.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRegistry {
    delay: Duration,
}

impl SimulatedRegistry {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ArtifactRegistry for SimulatedRegistry {
    fn id(&self) -> &'static str {
        "simulated"
    }

    async fn publish(&self, request: &PublishRequest, _credential: &DeployCredential) -> TrainingResult<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        debug!(repository = %request.repository, "simulated publish");
        Ok(())
    }
}

/// Registry backed by a Hugging Face compatible hub API.
#[derive(Debug, Clone)]
pub struct HubRegistry {
    base_url: String,
    client: Client,
}

#[derive(Serialize)]
struct CreateRepoRequest<'a> {
    name: &'a str,
    organization: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

impl HubRegistry {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client: Client::new() }
    }
}

#[async_trait]
impl ArtifactRegistry for HubRegistry {
    fn id(&self) -> &'static str {
        "hub"
    }

    async fn publish(&self, request: &PublishRequest, credential: &DeployCredential) -> TrainingResult<()> {
        let url = format!("{}/api/repos/create", self.base_url);
        let body = CreateRepoRequest {
            name: request.name(),
            organization: request.organization(),
            kind: "model",
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(credential.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, base_url = %self.base_url, "registry unreachable");
                TrainingError::Registry(format!("registry unreachable: {e}"))
            })?;

        let status = response.status();
        // 409: repository already exists.
        if status.is_success() || status == StatusCode::CONFLICT {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        error!(status = %status, error = %text, repository = %request.repository, "registry rejected publish");
        Err(TrainingError::Registry(format!("registry error ({status}): {text}")))
    }
}
