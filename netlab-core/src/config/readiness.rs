//! Readiness probe configuration

use super::defaults::*;
use super::parse_duration_secs_from_env;
use crate::error::{NetlabError, NetlabResult};
use crate::readiness::BackoffStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shape of the delay between readiness polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Bounded-retry parameters for a node's readiness probe
///
/// Every kind gets these defaults; a kind may carry its own override in its
/// registry entry because boot times differ by orders of magnitude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Delay between polls (base delay for exponential backoff)
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Overall bound on the wait
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    pub backoff: BackoffKind,

    /// Cap for exponential backoff
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_READINESS_INTERVAL_SECS),
            timeout: Duration::from_secs(DEFAULT_READINESS_TIMEOUT_SECS),
            backoff: BackoffKind::Fixed,
            max_interval: Duration::from_secs(DEFAULT_READINESS_MAX_INTERVAL_SECS),
        }
    }
}

impl ReadinessConfig {
    /// Fixed-interval probe with the given bounds
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            backoff: BackoffKind::Fixed,
            max_interval: interval,
        }
    }

    pub fn from_env() -> NetlabResult<Self> {
        let mut config = Self::default();

        config.interval =
            parse_duration_secs_from_env("NETLAB_READINESS_INTERVAL_SECS", config.interval);
        config.timeout = parse_duration_secs_from_env("NETLAB_READINESS_TIMEOUT_SECS", config.timeout);

        if let Ok(val) = std::env::var("NETLAB_READINESS_BACKOFF") {
            config.backoff = match val.to_ascii_lowercase().as_str() {
                "fixed" => BackoffKind::Fixed,
                "exponential" => BackoffKind::Exponential,
                _ => {
                    return Err(NetlabError::configuration(
                        "readiness.backoff",
                        "Invalid NETLAB_READINESS_BACKOFF",
                    ))
                }
            };
        }

        Ok(config)
    }

    pub fn validate(&self) -> NetlabResult<()> {
        if self.interval.is_zero() {
            return Err(NetlabError::configuration(
                "readiness.interval",
                "must be greater than zero",
            ));
        }
        if self.timeout < self.interval {
            return Err(NetlabError::configuration(
                "readiness.timeout",
                "must not be shorter than the poll interval",
            ));
        }
        Ok(())
    }

    /// Backoff strategy described by this configuration
    pub fn backoff_strategy(&self) -> BackoffStrategy {
        match self.backoff {
            BackoffKind::Fixed => BackoffStrategy::Fixed(self.interval),
            BackoffKind::Exponential => BackoffStrategy::Exponential {
                base: self.interval,
                max: self.max_interval.max(self.interval),
                multiplier: DEFAULT_READINESS_MULTIPLIER,
            },
        }
    }
}
