//! Default configuration values for netlab
//!
//! This module centralizes all default values to make them easy to find and modify.

// Orchestrator defaults
pub const DEFAULT_MAX_WORKERS: usize = 0; // unbounded
pub const DEFAULT_DEPLOY_TIMEOUT_SECS: u64 = 0; // no whole-run deadline

// Readiness probe defaults
pub const DEFAULT_READINESS_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 300; // 5 minutes
pub const DEFAULT_READINESS_MAX_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_READINESS_MULTIPLIER: f64 = 2.0;

// Link wiring defaults
pub const DEFAULT_IP_BINARY: &str = "ip";
pub const DEFAULT_ETHTOOL_BINARY: &str = "ethtool";
pub const DEFAULT_NSENTER_BINARY: &str = "nsenter";
pub const DEFAULT_WIRING_COMMAND_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DISABLE_TX_OFFLOAD: bool = true;

// Host commands (iptables, ovs-vsctl, host exec)
pub const DEFAULT_HOST_COMMAND_TIMEOUT_SECS: u64 = 300;

// Kernel limits
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

// Logging
pub const DEFAULT_LOG_DIRECTIVE: &str = "netlab=info";
