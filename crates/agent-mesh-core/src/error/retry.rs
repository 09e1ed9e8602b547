//! Retry policy with exponential backoff.
//!
//! Retries are bounded both by an attempt count and by an absolute
//! deadline: a backoff that would sleep past the deadline aborts the retry
//! loop and surfaces [`MeshError::DeadlineExceeded`].

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::MeshError;

/// Exponential backoff configuration for retryable operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff to sleep before retry number `retry` (1-based).
    ///
    /// Retry 1 sleeps `initial_delay`, retry 2 sleeps
    /// `initial_delay * multiplier`, and so on.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor)
    }

    /// Whether another retry is allowed after `retries_used` retries, and
    /// whether its backoff still fits before `deadline`.
    pub fn permits_retry(&self, retries_used: u32, deadline: Instant) -> bool {
        if retries_used + 1 >= self.max_attempts {
            return false;
        }
        let backoff = self.backoff_for(retries_used + 1);
        Instant::now() + backoff < deadline
    }
}

/// Run `operation` under `policy`, retrying transient failures with
/// exponential backoff until success, a non-retryable error, attempt
/// exhaustion, or the absolute `deadline`.
pub async fn retry_with_policy<F, Fut, T>(
    policy: &RetryPolicy,
    deadline: Instant,
    operation_name: &str,
    mut operation: F,
) -> Result<T, MeshError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, MeshError>>,
{
    let mut retries_used = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && policy.permits_retry(retries_used, deadline) => {
                retries_used += 1;
                let backoff = policy.backoff_for(retries_used);
                tracing::debug!(
                    operation = operation_name,
                    retry = retries_used,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(err) if err.is_retryable() => {
                // Out of attempts or the backoff would cross the deadline.
                if Instant::now() >= deadline {
                    return Err(MeshError::DeadlineExceeded {
                        operation: operation_name.to_string(),
                    });
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        }
    }
}
