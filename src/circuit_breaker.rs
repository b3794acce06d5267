//! Per-service circuit breaker.
//!
//! One breaker guards one service. The state machine is lock-free: the state
//! word, both counters, and the transition timestamps are all atomics, so
//! concurrent test steps hammering the same service can never corrupt counts,
//! and the Open -> HalfOpen transition is a compare-and-swap with exactly one
//! winner per recovery window.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::CircuitBreakerError;

const CLOSED: u32 = 0;
const OPEN: u32 = 1;
const HALF_OPEN: u32 = 2;

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Failing, requests rejected without invoking the operation
    Open,
    /// Trial window, testing whether the service recovered
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Trial successes in half-open before closing the circuit
    pub success_threshold: u32,
    /// Advisory per-operation timeout. The breaker never enforces this;
    /// callers that want a deadline apply it to the operation they supply.
    pub timeout: Duration,
    /// Time the circuit stays open before a trial is allowed
    pub recovery_timeout: Duration,
    /// When false the breaker is a pass-through with no state tracking
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(30),
            enabled: true,
        }
    }
}

/// Circuit breaker protecting a single service against cascading failures.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU32,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    /// Base instant for the atomic timestamp offsets below.
    started_at: Instant,
    /// Microseconds since `started_at` of the last recorded failure. 0 = none.
    last_failure_micros: AtomicU64,
    /// Microseconds since `started_at` of the last state transition.
    last_state_change_micros: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU32::new(CLOSED),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            started_at: Instant::now(),
            last_failure_micros: AtomicU64::new(0),
            last_state_change_micros: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get current circuit state
    pub fn current_state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Execute an operation under breaker protection.
    ///
    /// An open circuit rejects the call with [`CircuitBreakerError::CircuitOpen`]
    /// without invoking the operation. Once the recovery timeout has elapsed
    /// the first caller to win the CAS moves the breaker to half-open; losers
    /// re-observe the new state instead of acting on a stale decision.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.config.enabled {
            return operation().await.map_err(CircuitBreakerError::OperationFailed);
        }

        loop {
            match self.current_state() {
                CircuitState::Closed | CircuitState::HalfOpen => break,
                CircuitState::Open => {
                    if self.elapsed_since_state_change() < self.config.recovery_timeout {
                        warn!(breaker = %self.name, "Circuit open, rejecting request");
                        return Err(CircuitBreakerError::CircuitOpen {
                            service: self.name.clone(),
                        });
                    }
                    // One winner starts the trial window; everyone re-reads.
                    self.transition(OPEN, HALF_OPEN);
                }
            }
        }

        match operation().await {
            Ok(result) => {
                self.on_success();
                Ok(result)
            }
            Err(e) => {
                self.on_failure();
                Err(CircuitBreakerError::OperationFailed(e))
            }
        }
    }

    fn on_success(&self) {
        match self.current_state() {
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(breaker = %self.name, successes, "Trial success");
                if successes >= self.config.success_threshold {
                    self.transition(HALF_OPEN, CLOSED);
                }
            }
            _ => {
                self.failure_count.store(0, Ordering::Release);
            }
        }
    }

    fn on_failure(&self) {
        self.last_failure_micros
            .store(self.elapsed_micros(), Ordering::Release);

        match self.current_state() {
            CircuitState::HalfOpen => {
                // Any failure during the trial reopens immediately.
                self.transition(HALF_OPEN, OPEN);
            }
            _ => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(breaker = %self.name, failures, "Operation failed");
                if failures >= self.config.failure_threshold {
                    self.transition(CLOSED, OPEN);
                }
            }
        }
    }

    /// CAS transition between states. Returns whether this caller won.
    /// The winner resets both counters and stamps the transition time.
    fn transition(&self, from: u32, to: u32) -> bool {
        if self
            .state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.last_state_change_micros
            .store(self.elapsed_micros(), Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);

        info!(
            breaker = %self.name,
            from = ?decode(from),
            to = ?decode(to),
            "Circuit breaker state changed"
        );
        true
    }

    fn elapsed_micros(&self) -> u64 {
        self.started_at.elapsed().as_micros() as u64
    }

    fn elapsed_since_state_change(&self) -> Duration {
        let changed = self.last_state_change_micros.load(Ordering::Acquire);
        Duration::from_micros(self.elapsed_micros().saturating_sub(changed))
    }

    /// Time since the last recorded failure, if any.
    pub fn since_last_failure(&self) -> Option<Duration> {
        let at = self.last_failure_micros.load(Ordering::Acquire);
        if at == 0 {
            return None;
        }
        Some(Duration::from_micros(self.elapsed_micros().saturating_sub(at)))
    }

    /// Read-only snapshot for observability consumers.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: self.current_state(),
            failure_count: self.failure_count.load(Ordering::Acquire),
            success_count: self.success_count.load(Ordering::Acquire),
        }
    }
}

fn decode(state: u32) -> CircuitState {
    match state {
        OPEN => CircuitState::Open,
        HALF_OPEN => CircuitState::HalfOpen,
        _ => CircuitState::Closed,
    }
}

/// Point-in-time view of a breaker's state and counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_secs(5),
            recovery_timeout: Duration::from_millis(50),
            enabled: true,
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<i32, CircuitBreakerError<String>> {
        cb.execute(|| async { Err::<i32, String>("fail".into()) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<i32, CircuitBreakerError<String>> {
        cb.execute(|| async { Ok::<i32, String>(1) }).await
    }

    #[test]
    fn test_initial_state_is_closed() {
        let cb = CircuitBreaker::new("svc", CircuitBreakerConfig::default());
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
        assert!(cb.since_last_failure().is_none());
    }

    #[test]
    fn test_default_config_values() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 3);
        assert_eq!(config.recovery_timeout, Duration::from_secs(30));
        assert!(config.enabled);
    }

    #[tokio::test]
    async fn test_failures_below_threshold_stay_closed() {
        let cb = CircuitBreaker::new("svc", fast_config());
        for _ in 0..2 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 2);
    }

    #[tokio::test]
    async fn test_opens_exactly_at_failure_threshold() {
        let cb = CircuitBreaker::new("svc", fast_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.current_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new("svc", fast_config());
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;
        assert_eq!(cb.snapshot().failure_count, 0);

        // Two more failures are again below the threshold of three.
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking_operation() {
        let cb = CircuitBreaker::new("svc", fast_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }

        let invoked = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = invoked.clone();
        let result: Result<i32, CircuitBreakerError<String>> = cb
            .execute(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        assert!(matches!(
            result,
            Err(CircuitBreakerError::CircuitOpen { .. })
        ));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_half_open_after_recovery_timeout() {
        let cb = CircuitBreaker::new("svc", fast_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let result = succeed(&cb).await;
        assert!(result.is_ok());
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_closes_after_success_threshold_and_resets_counters() {
        let cb = CircuitBreaker::new("svc", fast_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        for _ in 0..2 {
            assert!(succeed(&cb).await.is_ok());
        }

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
    }

    #[tokio::test]
    async fn test_trial_failure_reopens_immediately() {
        let cb = CircuitBreaker::new("svc", fast_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);

        let _ = fail(&cb).await;
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert_eq!(cb.snapshot().success_count, 0);
    }

    #[tokio::test]
    async fn test_zero_recovery_timeout_allows_immediate_trial() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::ZERO,
            ..fast_config()
        };
        let cb = CircuitBreaker::new("svc", config);
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }

        assert!(succeed(&cb).await.is_ok());
        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_disabled_breaker_bypasses_state_tracking() {
        let config = CircuitBreakerConfig {
            enabled: false,
            failure_threshold: 1,
            ..fast_config()
        };
        let cb = CircuitBreaker::new("svc", config);

        for _ in 0..5 {
            let result = fail(&cb).await;
            assert!(matches!(
                result,
                Err(CircuitBreakerError::OperationFailed(_))
            ));
        }
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_trial_transition_single_winner() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 100, // stay in half-open during the race
            recovery_timeout: Duration::from_millis(10),
            ..fast_config()
        };
        let cb = Arc::new(CircuitBreaker::new("svc", config));
        let _ = fail(&cb).await;
        assert_eq!(cb.current_state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cb = cb.clone();
            handles.push(tokio::spawn(async move {
                cb.execute(|| async { Ok::<i32, String>(1) }).await
            }));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }

        // All callers either ran a trial in half-open or re-observed state;
        // counters must agree with the number of successful invocations.
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);
        assert_eq!(cb.snapshot().success_count, successes);
    }
}
