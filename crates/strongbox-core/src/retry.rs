//! Bounded retry with exponential backoff and per-attempt timeouts.
//!
//! Every call to an external collaborator (key service, validation hook,
//! audit sink, shared cache) goes through [`retry_with_timeout`], so no caller
//! ever blocks longer than `attempts * (timeout + max_delay)`.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Retry budget for an external call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for a single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier applied per attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Randomize each delay by 50-150%.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential =
            self.base_delay_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let capped = exponential.min(self.max_delay_ms as f64);

        let millis = if self.jitter {
            capped * (0.5 + rand::random::<f64>())
        } else {
            capped
        };

        Duration::from_millis(millis as u64)
    }
}

/// Errors that know whether another attempt could succeed.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

/// Errors that can represent an elapsed time budget.
pub trait TimeoutError {
    fn timed_out(operation: &str, after: Duration) -> Self;
}

/// Run `f` until it succeeds, returns a non-retryable error, or the budget
/// is exhausted.
pub async fn retry<F, Fut, T, E>(policy: &RetryPolicy, operation: &str, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                attempt += 1;

                if !err.is_retryable() {
                    return Err(err);
                }

                if attempt >= policy.max_attempts.max(1) {
                    warn!(
                        operation,
                        error = %err,
                        attempt,
                        max_attempts = policy.max_attempts,
                        "retry budget exhausted"
                    );
                    return Err(err);
                }

                let delay = policy.delay_for(attempt - 1);
                warn!(
                    operation,
                    error = %err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Like [`retry`], but each attempt is bounded by `timeout`. An elapsed
/// attempt counts as a retryable failure.
pub async fn retry_with_timeout<F, Fut, T, E>(
    policy: &RetryPolicy,
    timeout: Duration,
    operation: &str,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + TimeoutError + std::fmt::Display,
{
    retry(policy, operation, || {
        let fut = f();
        async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(operation, timeout)),
            }
        }
    })
    .await
}

impl RetryableError for crate::Error {
    fn is_retryable(&self) -> bool {
        self.is_retriable()
    }
}

impl TimeoutError for crate::Error {
    fn timed_out(operation: &str, after: Duration) -> Self {
        crate::Error::Timeout(format!("{operation} after {}ms", after.as_millis()))
    }
}
