//! End-to-end scenarios through the `ErrorHandlingService` façade.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio_test::assert_ok;

use steadfast::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use steadfast::config::SteadfastConfig;
use steadfast::degradation::DegradationLevel;
use steadfast::failure::{FailureType, TestFailure};
use steadfast::recovery::ErrorHandlingService;
use steadfast::retry::RetryPolicy;
use steadfast::rollback::RollbackAction;
use steadfast::strategies::{CachedResponseStrategy, SkipNonCriticalStrategy};

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        initial_delay_ms: 1,
        backoff_multiplier: 2.0,
        max_delay_ms: 5,
    }
}

fn fast_breaker() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 3,
        success_threshold: 2,
        timeout: Duration::from_secs(5),
        recovery_timeout: Duration::from_millis(50),
        enabled: true,
    }
}

struct LoggedAction {
    id: String,
    priority: i32,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RollbackAction for LoggedAction {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn description(&self) -> String {
        format!("undo {}", self.id)
    }

    fn service_id(&self) -> String {
        "orders".to_string()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn execute(&self) -> Result<(), TestFailure> {
        self.log.lock().push(self.id.clone());
        Ok(())
    }
}

fn action(id: &str, priority: i32, log: &Arc<Mutex<Vec<String>>>) -> Arc<LoggedAction> {
    Arc::new(LoggedAction {
        id: id.to_string(),
        priority,
        log: log.clone(),
    })
}

#[tokio::test]
async fn breaker_trips_recovers_and_closes_through_facade() {
    let service = ErrorHandlingService::new();

    // Three straight failures trip the breaker.
    for _ in 0..3 {
        let result = service
            .execute_with_error_handling(
                "get_order",
                "orders",
                || async { Err(TestFailure::new(FailureType::Data, "corrupt")) },
                &fast_policy(),
                &fast_breaker(),
            )
            .await;
        assert!(result.is_err());
    }
    let breaker = service.get_circuit_breaker("orders").unwrap();
    assert_eq!(breaker.current_state(), CircuitState::Open);

    // While open the operation is not invoked; the fail-fast signal keeps
    // its own failure class, distinct from an operation's own error.
    let invoked = Arc::new(AtomicU32::new(0));
    let counter = invoked.clone();
    let err = service
        .execute_with_error_handling(
            "get_order",
            "orders",
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            },
            &fast_policy(),
            &fast_breaker(),
        )
        .await
        .unwrap_err();
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(err.failure_type, FailureType::CircuitBreakerOpen);
    assert_eq!(err.service_id.as_deref(), Some("orders"));
    assert!(err.message.contains("'orders' is open"));

    // After the recovery timeout, trial successes close the circuit again.
    tokio::time::sleep(Duration::from_millis(60)).await;
    for _ in 0..2 {
        let result = service
            .execute_with_error_handling(
                "get_order",
                "orders",
                || async { Ok(json!({"order": 1})) },
                &fast_policy(),
                &fast_breaker(),
            )
            .await;
        assert_ok!(result);
    }
    let snapshot = breaker.snapshot();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.failure_count, 0);
    assert_eq!(snapshot.success_count, 0);
}

#[tokio::test]
async fn failed_test_degrades_service_by_failure_severity() {
    let service = ErrorHandlingService::new();
    let failure =
        TestFailure::new(FailureType::Service, "500 from payment").with_service("payment");

    let result = service.handle_test_failure("checkout-test", &failure, true).await;

    // No rollback actions were registered, so no recovery was attempted,
    // but the service still gets degraded.
    assert!(!result.recovery_attempted);
    assert!(result.degradation_applied);
    assert_eq!(
        service.get_service_degradation_level("payment"),
        DegradationLevel::Moderate
    );
    assert!(service.is_service_degraded("payment"));

    // Critical-class failures degrade harder.
    let auth_failure =
        TestFailure::new(FailureType::Authentication, "token rejected").with_service("auth");
    let _ = service.handle_test_failure("login-test", &auth_failure, false).await;
    assert_eq!(
        service.get_service_degradation_level("auth"),
        DegradationLevel::Critical
    );
}

#[tokio::test]
async fn rollback_runs_in_priority_order_and_only_once() {
    let service = ErrorHandlingService::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    service
        .rollback_manager()
        .register_rollback_action("t1", action("a", 1, &log));
    service
        .rollback_manager()
        .register_rollback_action("t1", action("b", 5, &log));
    service
        .rollback_manager()
        .register_rollback_action("t1", action("c", 3, &log));

    let failure = TestFailure::new(FailureType::Service, "boom").with_service("orders");
    let result = service.handle_test_failure("t1", &failure, true).await;

    assert!(result.recovery_attempted);
    assert!(result.recovery_successful);
    let rollback = result.rollback_result.unwrap();
    assert_eq!(rollback.successful_count(), 3);
    assert_eq!(*log.lock(), vec!["b", "c", "a"]);

    // Handling the same failed test again does not re-run the actions.
    let again = service.handle_test_failure("t1", &failure, true).await;
    assert!(again.recovery_successful);
    assert_eq!(again.rollback_result.unwrap().action_results.len(), 0);
    assert_eq!(log.lock().len(), 3);
}

#[tokio::test]
async fn degradation_strategies_rescue_exhausted_operations() {
    let service = ErrorHandlingService::new();

    let cached = CachedResponseStrategy::new(["get_catalog"]);
    cached.cache_response("get_catalog", "catalog", json!({"items": [1, 2, 3]}));
    service.degradation_manager().register_strategy(Arc::new(cached));
    service
        .degradation_manager()
        .register_strategy(Arc::new(SkipNonCriticalStrategy::new(["send_metrics"])));

    // A dead catalog service falls back to the cached payload at Minimal.
    let result = service
        .execute_with_error_handling(
            "get_catalog",
            "catalog",
            || async { Err(TestFailure::new(FailureType::Timeout, "deadline")) },
            &fast_policy(),
            &fast_breaker(),
        )
        .await
        .unwrap();
    assert_eq!(result["items"].as_array().unwrap().len(), 3);
    assert_eq!(
        service.get_service_degradation_level("catalog"),
        DegradationLevel::Minimal
    );

    // A metrics push is skipped at Moderate rather than failing the scenario.
    service.set_service_degradation_level("metrics", DegradationLevel::Moderate);
    let skipped = service
        .execute_with_error_handling(
            "send_metrics",
            "metrics",
            || async { Err(TestFailure::new(FailureType::Network, "refused")) },
            &fast_policy(),
            &fast_breaker(),
        )
        .await
        .unwrap();
    assert_eq!(skipped["skipped"], true);

    // An operation no strategy covers surfaces the original failure.
    let err = service
        .execute_with_error_handling(
            "charge_card",
            "payment",
            || async { Err(TestFailure::new(FailureType::BusinessLogic, "declined")) },
            &fast_policy(),
            &fast_breaker(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.failure_type, FailureType::BusinessLogic);
}

#[tokio::test]
async fn config_defaults_drive_the_protection_stack() {
    let config = SteadfastConfig::default();
    let service = ErrorHandlingService::new();

    let result = service
        .execute_with_error_handling(
            "ping",
            "orders",
            || async { Ok(json!({"pong": true})) },
            &config.retry_policy(),
            &config.circuit_breaker_config(),
        )
        .await;
    assert_ok!(result);

    let breaker = service.get_circuit_breaker("orders").unwrap();
    assert_eq!(breaker.config().failure_threshold, 5);
    assert_eq!(breaker.config().recovery_timeout, Duration::from_secs(30));

    let stats = service.get_recovery_statistics();
    assert_eq!(stats.total_circuit_breakers, 1);
    assert_eq!(stats.open_circuit_breakers, 0);
    assert_eq!(stats.health_percentage(), 100.0);
}
