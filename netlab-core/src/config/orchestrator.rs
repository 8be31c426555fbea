//! Orchestrator configuration

use super::defaults::*;
use super::parse_duration_secs_from_env;
use crate::error::{NetlabError, NetlabResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What the orchestrator does when a node fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Mark the node failed, block its dependents, let unrelated nodes finish
    #[default]
    BestEffort,
    /// Cancel every other node unit and abort the run on the first failure
    Strict,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::BestEffort => write!(f, "best-effort"),
            FailurePolicy::Strict => write!(f, "strict"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = NetlabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best-effort" | "besteffort" => Ok(FailurePolicy::BestEffort),
            "strict" | "fail-fast" => Ok(FailurePolicy::Strict),
            other => Err(NetlabError::configuration(
                "orchestrator.failure_policy",
                format!("unknown failure policy {:?}", other),
            )),
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Failure policy for the whole run
    pub failure_policy: FailurePolicy,

    /// Maximum number of node hooks running at once (0 = unbounded)
    pub max_workers: usize,

    /// Deadline for the whole deployment (0 = none)
    #[serde(with = "humantime_serde")]
    pub deploy_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            max_workers: DEFAULT_MAX_WORKERS,
            deploy_timeout: Duration::from_secs(DEFAULT_DEPLOY_TIMEOUT_SECS),
        }
    }
}

impl OrchestratorConfig {
    /// Load orchestrator configuration from environment variables
    pub fn from_env() -> NetlabResult<Self> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("NETLAB_FAILURE_POLICY") {
            config.failure_policy = val.parse()?;
        }

        if let Ok(val) = std::env::var("NETLAB_MAX_WORKERS") {
            config.max_workers = val.parse().map_err(|_| {
                NetlabError::configuration("orchestrator.max_workers", "Invalid NETLAB_MAX_WORKERS")
            })?;
        }

        config.deploy_timeout =
            parse_duration_secs_from_env("NETLAB_DEPLOY_TIMEOUT_SECS", config.deploy_timeout);

        Ok(config)
    }

    /// The whole-run deadline, if one is configured
    pub fn deadline(&self) -> Option<Duration> {
        (!self.deploy_timeout.is_zero()).then_some(self.deploy_timeout)
    }
}
