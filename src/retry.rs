//! Backoff-based retry execution.
//!
//! The executor re-invokes a failed async operation according to a
//! [`RetryPolicy`], sleeping between attempts without blocking a worker
//! thread. Dropping the returned future cancels any pending retry, so a
//! caller that abandons interest never triggers a stray attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::failure::{FailureType, TestFailure};

/// Fraction of the base delay used for symmetric jitter (+/- 12.5%).
const JITTER_FACTOR: f64 = 0.125;

/// Retry policy supplied by the orchestration layer, consumed read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first invocation
    pub max_attempts: u32,
    /// Delay before the first retry (ms)
    pub initial_delay_ms: u64,
    /// Multiplier applied per attempt for exponential backoff
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay (ms)
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Base delay before the retry that follows attempt `attempt` (1-indexed),
    /// before jitter: `min(max_delay, initial_delay * multiplier^(attempt-1))`.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exp = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        exp.min(self.max_delay_ms as f64) as u64
    }
}

/// Decides whether a failure is worth another attempt.
#[derive(Debug, Clone, Default)]
pub enum RetryPredicate {
    /// Retry connection/timeout-class failures (the default).
    #[default]
    Transient,
    /// Retry only the listed failure types.
    On(Vec<FailureType>),
    /// Retry everything except the listed failure types.
    Except(Vec<FailureType>),
}

impl RetryPredicate {
    pub fn retry_on(types: impl IntoIterator<Item = FailureType>) -> Self {
        Self::On(types.into_iter().collect())
    }

    pub fn retry_except(types: impl IntoIterator<Item = FailureType>) -> Self {
        Self::Except(types.into_iter().collect())
    }

    pub fn matches(&self, failure: &TestFailure) -> bool {
        match self {
            Self::Transient => failure.failure_type.is_transient(),
            Self::On(types) => types.contains(&failure.failure_type),
            Self::Except(types) => !types.contains(&failure.failure_type),
        }
    }
}

/// Retry statistics
#[derive(Debug, Default)]
struct RetryStats {
    total_attempts: AtomicU64,
    successful_retries: AtomicU64,
    exhausted_operations: AtomicU64,
    total_delay_ms: AtomicU64,
}

/// Executes operations with retry and jittered exponential backoff.
#[derive(Debug, Default)]
pub struct RetryExecutor {
    stats: RetryStats,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` up to `policy.max_attempts` times.
    ///
    /// Returns on the first success. On exhaustion, or when the predicate
    /// rejects a failure, only the most recent attempt's error is surfaced;
    /// earlier attempt errors are logged, not chained.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        operation: F,
        policy: &RetryPolicy,
        operation_name: &str,
        predicate: &RetryPredicate,
    ) -> Result<T, TestFailure>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, TestFailure>>,
    {
        let max_attempts = policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            self.stats.total_attempts.fetch_add(1, Ordering::Relaxed);

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        self.stats.successful_retries.fetch_add(1, Ordering::Relaxed);
                        debug!(operation = operation_name, attempt, "Retry succeeded");
                    }
                    return Ok(result);
                }
                Err(failure) => {
                    if attempt >= max_attempts || !predicate.matches(&failure) {
                        self.stats
                            .exhausted_operations
                            .fetch_add(1, Ordering::Relaxed);
                        warn!(
                            operation = operation_name,
                            attempt,
                            failure = %failure,
                            "Giving up"
                        );
                        return Err(failure);
                    }

                    let delay = jittered_delay(policy.base_delay_ms(attempt));
                    self.stats
                        .total_delay_ms
                        .fetch_add(delay.as_millis() as u64, Ordering::Relaxed);
                    debug!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        failure = %failure,
                        "Attempt failed, scheduling retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        unreachable!("retry loop always returns from its final attempt")
    }

    pub fn stats(&self) -> RetrySummary {
        RetrySummary {
            total_attempts: self.stats.total_attempts.load(Ordering::Relaxed),
            successful_retries: self.stats.successful_retries.load(Ordering::Relaxed),
            exhausted_operations: self.stats.exhausted_operations.load(Ordering::Relaxed),
            total_delay_ms: self.stats.total_delay_ms.load(Ordering::Relaxed),
        }
    }
}

/// Apply symmetric +/- 12.5% jitter so synchronized callers do not retry in
/// lockstep.
fn jittered_delay(base_ms: u64) -> Duration {
    let factor = 1.0 + (2.0 * JITTER_FACTOR * rand::random::<f64>() - JITTER_FACTOR);
    Duration::from_millis((base_ms as f64 * factor) as u64)
}

/// Retry summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySummary {
    pub total_attempts: u64,
    pub successful_retries: u64,
    pub exhausted_operations: u64,
    pub total_delay_ms: u64,
}
