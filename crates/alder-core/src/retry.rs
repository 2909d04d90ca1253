//! Bounded exponential backoff with jitter and prompt cancellation.
//!
//! Every long-lived subscription and every individual etcd/PostgreSQL op
//! in the daemon runs under one of these policies. The delay computation
//! is a pure function so growth and capping are testable without clocks;
//! jitter is additive, drawn fresh per attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Parameters for one retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts including the first (not "retries after").
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each attempt after.
    pub base_delay: Duration,
    /// Upper bound on the computed delay, before jitter.
    pub max_delay: Duration,
    /// Additive jitter as a percentage of the computed delay.
    pub jitter_percent: u64,
}

impl RetryConfig {
    /// Defaults for PostgreSQL operations.
    pub fn postgres() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter_percent: 10,
        }
    }

    /// Defaults for etcd operations. Roomier than the database policy:
    /// etcd recovery windows are longer in practice.
    pub fn etcd() -> Self {
        Self {
            max_attempts: 15,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(60),
            jitter_percent: 15,
        }
    }
}

/// Outcome of a retried operation that never succeeded.
#[derive(Debug, Error)]
pub enum RetryError {
    /// The daemon is shutting down; not a failure.
    #[error("operation '{name}' cancelled")]
    Cancelled {
        /// Operation label, for logs.
        name: String,
    },

    /// All attempts failed; carries the final attempt's error.
    #[error("operation '{name}' failed after {attempts} attempts: {source}")]
    Exhausted {
        /// Operation label, for logs.
        name: String,
        /// Number of attempts made.
        attempts: u32,
        /// The last attempt's error.
        #[source]
        source: anyhow::Error,
    },
}

impl RetryError {
    /// Whether this outcome is shutdown rather than failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Exponential delay before attempt `attempt` (0-based), capped.
///
/// Attempt 0 runs immediately; attempt 1 waits `base`, attempt 2 waits
/// `base * 2`, and so on up to `max`.
pub fn delay_for_attempt(config: &RetryConfig, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exponent = attempt.saturating_sub(1).min(31);
    let delay = config.base_delay.saturating_mul(1u32 << exponent);
    delay.min(config.max_delay)
}

/// Additive jitter bound for a computed delay.
pub fn jitter_bound(config: &RetryConfig, delay: Duration) -> Duration {
    delay.mul_f64(config.jitter_percent as f64 / 100.0)
}

/// Run `op` until it succeeds, attempts are exhausted, or `cancel` fires.
///
/// Each failed attempt is logged and followed by an exponential, jittered,
/// capped delay. The sleep races the cancellation token: cancellation wins
/// immediately and returns [`RetryError::Cancelled`], never the last
/// retryable error.
pub async fn retry_with_backoff<T, E, F, Fut>(
    cancel: &CancellationToken,
    config: &RetryConfig,
    name: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<anyhow::Error> + Display,
{
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 0..config.max_attempts {
        let delay = delay_for_attempt(config, attempt);
        if !delay.is_zero() {
            let sleep_for = delay + random_jitter(config, delay);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { name: name.to_string() });
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { name: name.to_string() });
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(
                    operation = name,
                    attempt = attempt + 1,
                    max_attempts = config.max_attempts,
                    error = %err,
                    "operation failed, retrying"
                );
                last_err = Some(err.into());
            }
        }
    }

    Err(RetryError::Exhausted {
        name: name.to_string(),
        attempts: config.max_attempts,
        source: last_err.unwrap_or_else(|| anyhow::anyhow!("no attempts were made")),
    })
}

fn random_jitter(config: &RetryConfig, delay: Duration) -> Duration {
    let bound = jitter_bound(config, delay);
    if bound.is_zero() {
        return Duration::ZERO;
    }
    let micros = rand::rng().random_range(0..=bound.as_micros() as u64);
    Duration::from_micros(micros)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use super::*;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter_percent: 0,
        }
    }

    #[test]
    fn postgres_defaults() {
        let config = RetryConfig::postgres();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.jitter_percent, 10);
    }

    #[test]
    fn etcd_defaults_are_roomier() {
        let pg = RetryConfig::postgres();
        let etcd = RetryConfig::etcd();
        assert!(etcd.max_attempts > pg.max_attempts);
        assert!(etcd.max_delay > pg.max_delay);
        assert!(etcd.jitter_percent > pg.jitter_percent);
    }

    #[test]
    fn delay_doubles_then_caps() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter_percent: 0,
        };
        assert_eq!(delay_for_attempt(&config, 0), Duration::ZERO);
        assert_eq!(delay_for_attempt(&config, 1), Duration::from_millis(100));
        assert_eq!(delay_for_attempt(&config, 2), Duration::from_millis(200));
        assert_eq!(delay_for_attempt(&config, 3), Duration::from_millis(400));
        assert_eq!(delay_for_attempt(&config, 4), Duration::from_millis(500));
        assert_eq!(delay_for_attempt(&config, 9), Duration::from_millis(500));
    }

    #[test]
    fn jitter_bound_is_a_fraction_of_delay() {
        let config = RetryConfig {
            jitter_percent: 10,
            ..RetryConfig::postgres()
        };
        assert_eq!(jitter_bound(&config, Duration::from_secs(1)), Duration::from_millis(100));

        let config = RetryConfig {
            jitter_percent: 0,
            ..config
        };
        assert_eq!(jitter_bound(&config, Duration::from_secs(1)), Duration::ZERO);
    }

    #[tokio::test]
    async fn first_success_makes_one_attempt() {
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = retry_with_backoff(&cancel, &fast_config(3), "noop", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = retry_with_backoff(&cancel, &fast_config(5), "flaky", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow::anyhow!("transient"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempt_count() {
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retry_with_backoff(&cancel, &fast_config(3), "doomed", || async {
            Err::<(), _>(anyhow::anyhow!("still broken"))
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, name, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(name, "doomed");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_wins_over_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            jitter_percent: 0,
        };

        let start = std::time::Instant::now();
        let result: Result<(), _> = retry_with_backoff(&cancel, &config, "cancelled", || async {
            Err::<(), _>(anyhow::anyhow!("nope"))
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled { .. })));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
