//! Configuration for netlab
//!
//! This module provides a structured configuration system with sensible defaults,
//! environment variable support, file loading and runtime validation.

use crate::error::{NetlabError, NetlabResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub mod defaults;
pub mod orchestrator;
pub mod readiness;
pub mod wiring;

pub use defaults::*;
pub use orchestrator::{FailurePolicy, OrchestratorConfig};
pub use readiness::{BackoffKind, ReadinessConfig};
pub use wiring::WiringConfig;

/// Root configuration structure for netlab
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetlabConfig {
    /// Scheduling and failure handling
    pub orchestrator: OrchestratorConfig,

    /// Default readiness probe bounds (kinds may override)
    pub readiness: ReadinessConfig,

    /// Link wiring
    pub wiring: WiringConfig,
}

impl NetlabConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> NetlabResult<Self> {
        let config = Self {
            orchestrator: OrchestratorConfig::from_env()?,
            readiness: ReadinessConfig::from_env()?,
            wiring: WiringConfig::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML or TOML file, chosen by extension
    pub fn from_file(path: &Path) -> NetlabResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content).map_err(|e| {
                NetlabError::configuration(path.display().to_string(), e.to_string())
            })?,
            Some("yaml") | Some("yml") | Some("json") => serde_yaml::from_str(&content)?,
            _ => {
                return Err(NetlabError::configuration(
                    path.display().to_string(),
                    "unsupported config file extension, expected .yaml, .yml, .json or .toml",
                ))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> NetlabResult<()> {
        self.readiness.validate()?;
        self.wiring.validate()?;
        Ok(())
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.orchestrator.failure_policy = policy;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.orchestrator.max_workers = max_workers;
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessConfig) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_deploy_timeout(mut self, timeout: Duration) -> Self {
        self.orchestrator.deploy_timeout = timeout;
        self
    }
}

/// Parse a duration given in whole seconds from an environment variable
pub(crate) fn parse_duration_secs_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_validation() {
        let config = NetlabConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.orchestrator.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(config.orchestrator.deadline(), None);
    }

    #[test]
    fn test_invalid_readiness_rejected() {
        let config = NetlabConfig::default().with_readiness(ReadinessConfig::fixed(
            Duration::from_secs(10),
            Duration::from_secs(1),
        ));
        assert!(matches!(
            config.validate(),
            Err(NetlabError::Configuration { .. })
        ));
    }

    #[test]
    fn test_yaml_file_with_humantime_durations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("netlab.yaml");
        std::fs::write(
            &path,
            "orchestrator:\n  failure_policy: strict\n  deploy_timeout: 10m\nreadiness:\n  interval: 500ms\n  timeout: 2m\n  backoff: exponential\n",
        )
        .unwrap();

        let config = NetlabConfig::from_file(&path).unwrap();
        assert_eq!(config.orchestrator.failure_policy, FailurePolicy::Strict);
        assert_eq!(config.orchestrator.deadline(), Some(Duration::from_secs(600)));
        assert_eq!(config.readiness.interval, Duration::from_millis(500));
        assert_eq!(config.readiness.backoff, BackoffKind::Exponential);
        // untouched sections keep their defaults
        assert_eq!(config.wiring.ip_binary, DEFAULT_IP_BINARY);
    }

    #[test]
    fn test_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("netlab.toml");
        std::fs::write(&path, "[orchestrator]\nmax_workers = 4\n\n[wiring]\ndisable_tx_offload = false\n").unwrap();

        let config = NetlabConfig::from_file(&path).unwrap();
        assert_eq!(config.orchestrator.max_workers, 4);
        assert!(!config.wiring.disable_tx_offload);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("netlab.ini");
        std::fs::write(&path, "").unwrap();
        assert!(NetlabConfig::from_file(&path).is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("NETLAB_FAILURE_POLICY", "strict");
        std::env::set_var("NETLAB_READINESS_TIMEOUT_SECS", "42");
        let config = NetlabConfig::from_env();
        std::env::remove_var("NETLAB_FAILURE_POLICY");
        std::env::remove_var("NETLAB_READINESS_TIMEOUT_SECS");

        let config = config.unwrap();
        assert_eq!(config.orchestrator.failure_policy, FailurePolicy::Strict);
        assert_eq!(config.readiness.timeout, Duration::from_secs(42));
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_policy() {
        std::env::set_var("NETLAB_FAILURE_POLICY", "sometimes");
        let result = NetlabConfig::from_env();
        std::env::remove_var("NETLAB_FAILURE_POLICY");
        assert!(result.is_err());
    }
}
