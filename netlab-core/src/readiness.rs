//! Bounded readiness polling
//!
//! Node kinds report readiness through a cheap probe (an exec inside the
//! container, a socket check, ...). This module turns such a probe into a
//! bounded, cancellable wait with a configurable backoff.

use crate::config::ReadinessConfig;
use crate::error::{NetlabError, NetlabResult};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backoff strategy between readiness polls
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between polls
    Fixed(Duration),
    /// Exponential increase in delay (base * multiplier^(attempt-1)), capped at max
    Exponential {
        base: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl BackoffStrategy {
    /// Calculate the delay after a given (1-based) attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(duration) => *duration,
            BackoffStrategy::Exponential {
                base,
                max,
                multiplier,
            } => {
                let factor = multiplier.powf(attempt.saturating_sub(1) as f64);
                let delay_ms = (base.as_millis() as f64 * factor) as u64;
                std::cmp::min(Duration::from_millis(delay_ms), *max)
            }
        }
    }
}

/// Poll `probe` until it reports ready.
///
/// Returns the number of attempts on success. Fails with
/// [`NetlabError::ReadinessTimeout`] once `config.timeout` is exhausted
/// and with [`NetlabError::Cancelled`] when `cancel` fires. Probe errors
/// count as "not ready yet"; the last one is kept for the timeout message.
pub async fn poll_until_ready<F, Fut>(
    node: &str,
    config: &ReadinessConfig,
    cancel: &CancellationToken,
    mut probe: F,
) -> NetlabResult<u32>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = NetlabResult<bool>>,
{
    let started = Instant::now();
    let backoff = config.backoff_strategy();
    let mut attempt = 0u32;
    let mut last_error = String::from("probe never reported ready");

    loop {
        attempt += 1;
        let remaining = config.timeout.saturating_sub(started.elapsed());

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NetlabError::cancelled(format!("readiness of {}", node))),
            r = tokio::time::timeout(remaining, probe()) => r,
        };

        match outcome {
            Ok(Ok(true)) => {
                debug!(node, attempt, "readiness probe succeeded");
                return Ok(attempt);
            }
            Ok(Ok(false)) => {
                last_error = String::from("probe reported not ready");
            }
            Ok(Err(e)) => {
                debug!(node, attempt, error = %e, "readiness probe failed");
                last_error = e.to_string();
            }
            Err(_) => {
                last_error = String::from("probe did not answer in time");
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= config.timeout {
            return Err(NetlabError::ReadinessTimeout {
                node: node.to_string(),
                timeout: config.timeout,
                last_error,
            });
        }

        let delay = backoff.delay(attempt).min(config.timeout - elapsed);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NetlabError::cancelled(format!("readiness of {}", node))),
            _ = sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(timeout_ms: u64) -> ReadinessConfig {
        ReadinessConfig::fixed(Duration::from_millis(5), Duration::from_millis(timeout_ms))
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let strategy = BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
            multiplier: 2.0,
        };
        assert_eq!(strategy.delay(1), Duration::from_millis(100));
        assert_eq!(strategy.delay(2), Duration::from_millis(200));
        assert_eq!(strategy.delay(3), Duration::from_millis(350));
        assert_eq!(strategy.delay(10), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_ready_after_a_few_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let attempts = poll_until_ready("r1", &quick(2_000), &CancellationToken::new(), || {
            let counter = counter.clone();
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2) }
        })
        .await
        .unwrap();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_timeout_keeps_last_error() {
        let err = poll_until_ready("r1", &quick(40), &CancellationToken::new(), || async {
            Err(NetlabError::internal("mgmt_server not running"))
        })
        .await
        .unwrap_err();

        match err {
            NetlabError::ReadinessTimeout { node, last_error, .. } => {
                assert_eq!(node, "r1");
                assert!(last_error.contains("mgmt_server"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = poll_until_ready("r1", &quick(60_000), &cancel, || async { Ok(false) })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
