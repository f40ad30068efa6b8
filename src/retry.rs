//! Retry execution with exponential backoff and ordered fallbacks.
//!
//! The executor is a pure function of (operation, policy): it re-attempts
//! only errors whose kind is retryable (Network, Timeout, RateLimit) and
//! sleeps an exponentially growing, jittered delay between attempts. After
//! exhaustion, configured fallback strategies run in order; each may
//! produce a substitute result or pass the error along.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};

/// Backoff and attempt policy for retryable operations.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first (default: 3).
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub base_delay_ms: u64,
    /// Multiplier applied per retry attempt.
    pub multiplier: f64,
    /// Ceiling for any single delay.
    pub max_delay_ms: u64,
    /// Jitter fraction applied on top of the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.10,
        }
    }
}

impl RetryPolicy {
    /// Compute the delay before retry number `attempt` (0-indexed).
    ///
    /// The jitter term is derived from `seed` so the same (policy, seed,
    /// attempt) triple always yields the same delay.
    pub fn delay_for_attempt(&self, attempt: u32, seed: u64) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt as i32);
        let base = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);

        // Cheap multiplicative hash gives a stable fraction in [0, 1).
        let mixed = seed
            .wrapping_add(attempt as u64)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let fraction = (mixed >> 40) as f64 / (1u64 << 24) as f64;
        let jittered = base * (1.0 + self.jitter * fraction);

        Duration::from_millis(jittered.min(self.max_delay_ms as f64 * (1.0 + self.jitter)) as u64)
    }
}

/// Execute `op` with retries per `policy`, honoring cancellation.
///
/// A rate-limit error carrying `retry_after_ms` overrides the computed
/// backoff for that attempt.
pub async fn execute_with_retry<T, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);

    let mut last_err = None;
    for attempt in 0..policy.max_attempts.max(1) {
        cancel.check()?;

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = match &err {
                    Error::RateLimit {
                        retry_after_ms: Some(ms),
                        ..
                    } => Duration::from_millis(*ms),
                    _ => policy.delay_for_attempt(attempt, seed),
                };
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after backoff"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = sleep(delay) => {}
                }
                last_err = Some(err);
            }
            Err(err) => {
                debug!(operation, attempt, error = %err, "terminal error");
                return Err(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::Internal(format!("{}: no attempts made", operation))))
}

/// A fallback that may substitute a result after retries are exhausted.
#[async_trait]
pub trait FallbackStrategy<T>: Send + Sync {
    /// Strategy name, used in warnings.
    fn name(&self) -> &str;

    /// Attempt to recover from `error`. `None` passes to the next strategy.
    async fn attempt(&self, error: &Error) -> Option<Result<T>>;
}

/// Run the configured fallbacks in order against a terminal error.
///
/// The first strategy that returns a value wins; a strategy returning an
/// error re-raises immediately; strategies returning `None` are skipped.
pub async fn run_fallbacks<T>(
    error: Error,
    fallbacks: &[Box<dyn FallbackStrategy<T>>],
) -> Result<T> {
    for fallback in fallbacks {
        match fallback.attempt(&error).await {
            Some(Ok(value)) => {
                warn!(strategy = fallback.name(), original = %error, "fallback produced substitute result");
                return Ok(value);
            }
            Some(Err(err)) => return Err(err),
            None => continue,
        }
    }
    Err(error)
}
