//! Link wiring configuration

use super::defaults::*;
use super::parse_duration_secs_from_env;
use crate::error::{NetlabError, NetlabResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Link wiring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WiringConfig {
    /// `ip` binary used by the command-backed netlink handle
    pub ip_binary: String,

    pub ethtool_binary: String,

    /// Used to run commands inside a namespace given by path
    pub nsenter_binary: String,

    /// Timeout for each netlink command
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Turn off tx checksum offload on wired veth legs
    pub disable_tx_offload: bool,
}

impl Default for WiringConfig {
    fn default() -> Self {
        Self {
            ip_binary: DEFAULT_IP_BINARY.to_string(),
            ethtool_binary: DEFAULT_ETHTOOL_BINARY.to_string(),
            nsenter_binary: DEFAULT_NSENTER_BINARY.to_string(),
            command_timeout: Duration::from_secs(DEFAULT_WIRING_COMMAND_TIMEOUT_SECS),
            disable_tx_offload: DEFAULT_DISABLE_TX_OFFLOAD,
        }
    }
}

impl WiringConfig {
    pub fn from_env() -> NetlabResult<Self> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("NETLAB_IP_BINARY") {
            config.ip_binary = val;
        }
        if let Ok(val) = std::env::var("NETLAB_ETHTOOL_BINARY") {
            config.ethtool_binary = val;
        }
        if let Ok(val) = std::env::var("NETLAB_NSENTER_BINARY") {
            config.nsenter_binary = val;
        }
        config.command_timeout = parse_duration_secs_from_env(
            "NETLAB_WIRING_COMMAND_TIMEOUT_SECS",
            config.command_timeout,
        );
        if let Ok(val) = std::env::var("NETLAB_DISABLE_TX_OFFLOAD") {
            config.disable_tx_offload = val.parse().map_err(|_| {
                NetlabError::configuration(
                    "wiring.disable_tx_offload",
                    "Invalid NETLAB_DISABLE_TX_OFFLOAD",
                )
            })?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> NetlabResult<()> {
        if self.ip_binary.trim().is_empty() {
            return Err(NetlabError::configuration("wiring.ip_binary", "must not be empty"));
        }
        if self.command_timeout.is_zero() {
            return Err(NetlabError::configuration(
                "wiring.command_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}
