//! Error handling façade.
//!
//! `ErrorHandlingService` is the single entry point orchestration callers
//! use: it composes the per-service circuit breakers, the retry executor and
//! the degradation manager into one "execute this risky operation safely"
//! contract, and pairs the rollback manager with failure-severity mapping
//! for post-failure cleanup.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
use crate::degradation::{DegradationLevel, DegradationParams, GracefulDegradationManager};
use crate::errors::CircuitBreakerError;
use crate::failure::TestFailure;
use crate::retry::{RetryExecutor, RetryPolicy, RetryPredicate};
use crate::rollback::{RollbackManager, RollbackResult};

/// Outcome of handling one test failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub test_id: String,
    pub original_failure: TestFailure,
    /// Whether a rollback was attempted for this failure.
    pub recovery_attempted: bool,
    /// Whether the attempted rollback succeeded in full.
    pub recovery_successful: bool,
    pub rollback_result: Option<RollbackResult>,
    pub degradation_applied: bool,
    pub timestamp: DateTime<Utc>,
    pub recovery_message: Option<String>,
}

impl RecoveryResult {
    pub fn builder(
        test_id: impl Into<String>,
        original_failure: TestFailure,
    ) -> RecoveryResultBuilder {
        RecoveryResultBuilder {
            test_id: test_id.into(),
            original_failure,
            recovery_attempted: false,
            recovery_successful: false,
            rollback_result: None,
            degradation_applied: false,
            recovery_message: None,
        }
    }
}

/// Builder for [`RecoveryResult`].
pub struct RecoveryResultBuilder {
    test_id: String,
    original_failure: TestFailure,
    recovery_attempted: bool,
    recovery_successful: bool,
    rollback_result: Option<RollbackResult>,
    degradation_applied: bool,
    recovery_message: Option<String>,
}

impl RecoveryResultBuilder {
    /// Attach a rollback outcome; marks recovery as attempted and carries
    /// the rollback's overall success.
    pub fn with_rollback_result(mut self, result: RollbackResult) -> Self {
        self.recovery_attempted = true;
        self.recovery_successful = result.successful;
        self.rollback_result = Some(result);
        self
    }

    pub fn with_degradation_applied(mut self, applied: bool) -> Self {
        self.degradation_applied = applied;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.recovery_message = Some(message.into());
        self
    }

    pub fn build(self) -> RecoveryResult {
        RecoveryResult {
            test_id: self.test_id,
            original_failure: self.original_failure,
            recovery_attempted: self.recovery_attempted,
            recovery_successful: self.recovery_successful,
            rollback_result: self.rollback_result,
            degradation_applied: self.degradation_applied,
            timestamp: Utc::now(),
            recovery_message: self.recovery_message,
        }
    }
}

/// Snapshot counts across the recovery core, for observability consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStatistics {
    pub total_circuit_breakers: usize,
    pub open_circuit_breakers: usize,
    pub degraded_services: usize,
    pub tests_with_rollback_actions: usize,
}

impl RecoveryStatistics {
    /// Share of tracked breakers that are not open, as a percentage. A core
    /// with no breakers yet is considered fully healthy.
    pub fn health_percentage(&self) -> f64 {
        if self.total_circuit_breakers == 0 {
            return 100.0;
        }
        let healthy = self.total_circuit_breakers - self.open_circuit_breakers;
        healthy as f64 / self.total_circuit_breakers as f64 * 100.0
    }
}

/// Composes circuit breaking, retries, degradation and rollback into a
/// single service.
pub struct ErrorHandlingService {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    retry_executor: RetryExecutor,
    degradation: GracefulDegradationManager,
    rollback: RollbackManager,
}

impl ErrorHandlingService {
    pub fn new() -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            retry_executor: RetryExecutor::new(),
            degradation: GracefulDegradationManager::new(),
            rollback: RollbackManager::new(),
        }
    }

    /// The degradation manager, for strategy registration and level control.
    pub fn degradation_manager(&self) -> &GracefulDegradationManager {
        &self.degradation
    }

    /// The rollback manager, for action registration.
    pub fn rollback_manager(&self) -> &RollbackManager {
        &self.rollback
    }

    pub fn retry_executor(&self) -> &RetryExecutor {
        &self.retry_executor
    }

    /// Execute an operation for a service with the full protection stack:
    /// retry inside the service's circuit breaker, with degradation as the
    /// last resort.
    ///
    /// The operation is any re-invocable async unit producing a JSON payload
    /// (service responses in the test harness are JSON). On ultimate failure
    /// the degradation manager gets a chance; when it has nothing to offer
    /// the original failure propagates unchanged.
    pub async fn execute_with_error_handling<F, Fut>(
        &self,
        operation_name: &str,
        service_id: &str,
        operation: F,
        retry_policy: &RetryPolicy,
        breaker_config: &CircuitBreakerConfig,
    ) -> Result<Value, TestFailure>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<Value, TestFailure>> + Send,
    {
        let breaker = self.breaker_for(service_id, breaker_config);
        let predicate = RetryPredicate::default();

        let outcome = breaker
            .execute(|| {
                self.retry_executor
                    .execute_with_retry(&operation, retry_policy, operation_name, &predicate)
            })
            .await;

        let failure = match outcome {
            Ok(value) => return Ok(value),
            Err(CircuitBreakerError::OperationFailed(failure)) => failure,
            Err(open @ CircuitBreakerError::CircuitOpen { .. }) => {
                // Distinct fail-fast class so callers can branch on it
                // without parsing the message.
                TestFailure::new(crate::failure::FailureType::CircuitBreakerOpen, open.to_string())
                    .with_service(service_id)
            }
        };

        debug!(
            operation = operation_name,
            service = service_id,
            failure = %failure,
            "Protection stack exhausted, trying degradation"
        );
        self.degradation
            .execute_with_degradation(
                operation_name,
                service_id,
                &failure,
                &DegradationParams::new(),
            )
            .await
    }

    /// Handle a failed test: run its rollback (when requested and actions
    /// are registered) and degrade the failing service according to the
    /// failure's severity.
    pub async fn handle_test_failure(
        &self,
        test_id: &str,
        failure: &TestFailure,
        perform_rollback: bool,
    ) -> RecoveryResult {
        info!(
            test = test_id,
            failure = %failure,
            perform_rollback,
            "Handling test failure"
        );

        let mut builder = RecoveryResult::builder(test_id, failure.clone());

        if perform_rollback && self.rollback.has_rollback_actions(test_id) {
            let rollback_result = self.rollback.execute_rollback(test_id).await;
            builder = builder.with_rollback_result(rollback_result);
        }

        let level = failure.failure_type.severity();
        match &failure.service_id {
            Some(service) => {
                self.degradation.set_service_degradation_level(service, level);
                builder = builder.with_message(format!(
                    "degradation level {:?} applied to service '{}'",
                    level, service
                ));
            }
            None => {
                warn!(test = test_id, "Failure carries no service id, nothing to degrade");
            }
        }

        builder.with_degradation_applied(true).build()
    }

    /// Look up the breaker for a service, creating it lazily with the given
    /// configuration on first use.
    fn breaker_for(&self, service_id: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(service_id) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .entry(service_id.to_string())
            .or_insert_with(|| {
                info!(service = service_id, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(service_id, config.clone()))
            })
            .clone()
    }

    pub fn get_circuit_breaker(&self, service_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(service_id).cloned()
    }

    pub fn get_all_circuit_breakers(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.read().values().cloned().collect()
    }

    /// Replace the service's breaker with a fresh instance of the same
    /// configuration. Guarantees clean counters and a closed state; no-op
    /// when the service has no breaker yet.
    pub fn reset_circuit_breaker(&self, service_id: &str) -> bool {
        let mut breakers = self.breakers.write();
        match breakers.get(service_id) {
            Some(existing) => {
                let config = existing.config().clone();
                breakers.insert(
                    service_id.to_string(),
                    Arc::new(CircuitBreaker::new(service_id, config)),
                );
                info!(service = service_id, "Circuit breaker reset");
                true
            }
            None => false,
        }
    }

    pub fn is_service_degraded(&self, service_id: &str) -> bool {
        self.degradation.is_service_degraded(service_id)
    }

    pub fn get_service_degradation_level(&self, service_id: &str) -> DegradationLevel {
        self.degradation.get_service_degradation_level(service_id)
    }

    pub fn set_service_degradation_level(&self, service_id: &str, level: DegradationLevel) {
        self.degradation.set_service_degradation_level(service_id, level);
    }

    pub fn reset_service_degradation(&self, service_id: &str) {
        self.degradation.reset_service_degradation(service_id);
    }

    /// Read-only snapshots of every tracked breaker.
    pub fn circuit_breaker_snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        self.breakers
            .read()
            .values()
            .map(|breaker| breaker.snapshot())
            .collect()
    }

    pub fn get_recovery_statistics(&self) -> RecoveryStatistics {
        let breakers = self.breakers.read();
        let open = breakers
            .values()
            .filter(|b| b.current_state() == CircuitState::Open)
            .count();
        RecoveryStatistics {
            total_circuit_breakers: breakers.len(),
            open_circuit_breakers: open,
            degraded_services: self.degradation.degraded_service_count(),
            tests_with_rollback_actions: self.rollback.tests_with_actions(),
        }
    }
}

impl Default for ErrorHandlingService {
    fn default() -> Self {
        Self::new()
    }
}
