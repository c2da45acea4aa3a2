//! Retry engine: bounded attempts with exponential backoff and jitter.
//!
//! The engine re-invokes an operation while its error is classified as
//! transient (see [`ApiError::is_retryable`]). On exhaustion the last error
//! is returned unchanged so callers see the real failure, not a wrapper.

use crate::error::{ApiError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Backoff parameters.
///
/// Delay before retry *n* (1-indexed) is
/// `min(initial_delay * multiplier^(n-1), max_delay)`, then jittered by a
/// factor uniformly drawn from `[0.5, 1.0]` to avoid synchronized retry
/// storms across concurrent callers.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Total attempts, including the first. Default 3.
    pub max_attempts: u32,
    /// Delay before the first retry. Default 1s.
    pub initial_delay: Duration,
    /// Exponential growth factor. Default 2.
    pub multiplier: u32,
    /// Delay ceiling. Default 30s.
    pub max_delay: Duration,
    /// Whether to jitter computed delays. Default true.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2,
            max_delay: Duration::from_millis(30_000),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// The delay before retry `n` (1-indexed), jitter applied.
    pub fn delay_for_retry(&self, n: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(n.saturating_sub(1));
        let base = self.initial_delay.saturating_mul(factor);
        let delay = base.min(self.max_delay);

        if self.jitter {
            let jitter_factor = rand::thread_rng().gen_range(0.5..=1.0);
            delay.mul_f64(jitter_factor)
        } else {
            delay
        }
    }
}

/// Executes operations with retries per a [`BackoffPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryEngine {
    policy: BackoffPolicy,
}

impl RetryEngine {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Runs `operation` up to `max_attempts` times.
    ///
    /// A Retry-After hint on the error (capped at `max_delay`) takes
    /// precedence over the computed backoff. Each retry is logged before its
    /// delay. Non-retryable errors propagate immediately.
    pub async fn execute<T, F, Fut>(&self, context: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !e.is_retryable() || attempt >= self.policy.max_attempts {
                        return Err(e);
                    }

                    let delay = match e.retry_after {
                        Some(hint) => hint.min(self.policy.max_delay),
                        None => self.policy.delay_for_retry(attempt),
                    };

                    tracing::warn!(
                        context,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
