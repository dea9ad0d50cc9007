//! Backoff helper for transient external failures.
//!
//! Cluster and DNS calls can fail on timeouts, rate limits, and connection
//! resets. Call sites wrap those operations in [`with_backoff`], which
//! retries a bounded number of times with exponential, jittered delays.
//! Validation failures and conflicts are resolved before the closure
//! returns an error, so only genuinely transient failures are retried.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Retry policy for a single external operation.
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Total attempts before giving up (at least 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Ceiling for the growing delay
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    /// A policy with the given number of total attempts
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// Delays double between attempts, capped at `max_delay`, with 0.5x-1.5x
/// jitter so concurrent reconciles do not retry in lockstep. The last
/// error is returned when attempts run out.
pub async fn with_backoff<F, Fut, T, E>(
    policy: &Backoff,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = policy.initial_delay;

    for attempt in 1..=policy.max_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt == policy.max_attempts => {
                warn!(
                    operation = %operation_name,
                    attempts = attempt,
                    error = %e,
                    "giving up after repeated failures"
                );
                return Err(e);
            }
            Err(e) => {
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let sleep_for = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = sleep_for.as_millis(),
                    "transient failure, retrying"
                );
                tokio::time::sleep(sleep_for).await;
                delay = (delay * 2).min(policy.max_delay);
            }
        }
    }

    unreachable!("loop returns on the final attempt")
}
