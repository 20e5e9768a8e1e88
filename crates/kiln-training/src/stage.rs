//! Training job stages and the transition table between them.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coarse lifecycle phase of a training job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Dataset analysis is running; initial stage.
    Analyzing,
    /// Analysis is attached and the job waits for a training config.
    Configuring,
    /// The epoch loop is running.
    Training,
    /// Every epoch is persisted. The job may still be deployed.
    Completed,
    /// The epoch loop stopped on an unrecoverable error.
    Failed,
    /// The epoch loop stopped on request before reaching the last epoch.
    Cancelled,
    /// A deployment attempt is in flight.
    Deploying,
    /// The latest deployment attempt succeeded.
    Deployed,
    /// The latest deployment attempt failed; deployment may be retried.
    DeployFailed,
}

impl Stage {
    pub const ALL: [Self; 9] = [
        Self::Analyzing,
        Self::Configuring,
        Self::Training,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Deploying,
        Self::Deployed,
        Self::DeployFailed,
    ];

    /// Checks whether the job can move from this stage to `to`.
    ///
    /// Only the transitions listed here are legal; self-transitions are not.
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm is a distinct rule of the table
    pub fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (Self::Analyzing, Self::Configuring | Self::Failed) => true,
            (Self::Configuring, Self::Training) => true,
            (Self::Training, Self::Completed | Self::Failed | Self::Cancelled) => true,
            (Self::Completed, Self::Deploying) => true,
            (Self::Deploying, Self::Deployed | Self::DeployFailed) => true,
            (Self::DeployFailed, Self::Deploying) => true,
            _ => false,
        }
    }

    /// Returns `to` if the transition is legal.
    pub fn transition(self, to: Self) -> TrainingResult<Self> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(TrainingError::InvalidTransition { from: self, to })
        }
    }

    /// No further transition is possible from a terminal stage.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Deployed)
    }

    /// Whether the job has stopped moving on its own: training is over and
    /// no deployment is in flight.
    #[must_use]
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::Analyzing | Self::Configuring | Self::Training | Self::Deploying)
    }

    /// Whether a deployment attempt may start from this stage.
    #[must_use]
    pub fn is_deployable(self) -> bool {
        self.can_transition_to(Self::Deploying)
    }

    /// Stable string form used in storage and on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analyzing => "analyzing",
            Self::Configuring => "configuring",
            Self::Training => "training",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Deploying => "deploying",
            Self::Deployed => "deployed",
            Self::DeployFailed => "deploy_failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| TrainingError::Other(anyhow::anyhow!("unknown stage: {s}")))
    }
}
