//! Reference degradation strategies.
//!
//! Two implementations ship with the core: a cache/default-response strategy
//! at `Minimal`, and a skip-non-critical strategy at `Moderate`. Anything
//! more specific belongs to the orchestration layer, which implements
//! [`DegradationStrategy`] directly.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::degradation::{DegradationLevel, DegradationParams, DegradationStrategy};
use crate::failure::TestFailure;

/// Serves a previously cached response, or a configured default, instead of
/// the live call. Runs at `Minimal` severity.
///
/// Cache keys are `operation` scoped by service (`operation@service`) with a
/// service-agnostic `operation` fallback.
pub struct CachedResponseStrategy {
    operations: Vec<String>,
    cache: RwLock<HashMap<String, Value>>,
    default_response: Option<Value>,
}

impl CachedResponseStrategy {
    pub fn new(operations: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            operations: operations.into_iter().map(Into::into).collect(),
            cache: RwLock::new(HashMap::new()),
            default_response: None,
        }
    }

    /// Configure a response returned when nothing is cached for an operation.
    pub fn with_default_response(mut self, response: Value) -> Self {
        self.default_response = Some(response);
        self
    }

    /// Store a response for later degraded use. Typically called by the
    /// orchestration layer after each successful live call.
    pub fn cache_response(&self, operation: &str, service_id: &str, response: Value) {
        let mut cache = self.cache.write();
        cache.insert(scoped_key(operation, service_id), response.clone());
        cache.insert(operation.to_string(), response);
    }

    fn lookup(&self, operation: &str, service_id: &str) -> Option<Value> {
        let cache = self.cache.read();
        cache
            .get(&scoped_key(operation, service_id))
            .or_else(|| cache.get(operation))
            .cloned()
    }
}

fn scoped_key(operation: &str, service_id: &str) -> String {
    format!("{}@{}", operation, service_id)
}

#[async_trait]
impl DegradationStrategy for CachedResponseStrategy {
    fn level(&self) -> DegradationLevel {
        DegradationLevel::Minimal
    }

    fn description(&self) -> String {
        "cached/default response".to_string()
    }

    fn supported_operations(&self) -> Vec<String> {
        self.operations.clone()
    }

    fn can_handle(&self, _failure: &TestFailure, _service_id: &str) -> bool {
        // A stale payload stands in for any failure class.
        true
    }

    async fn execute_degraded(
        &self,
        operation: &str,
        service_id: &str,
        failure: &TestFailure,
        _params: &DegradationParams,
    ) -> Result<Value, TestFailure> {
        if let Some(cached) = self.lookup(operation, service_id) {
            debug!(operation, service = service_id, "Serving cached response");
            return Ok(cached);
        }
        if let Some(default) = &self.default_response {
            debug!(operation, service = service_id, "Serving default response");
            return Ok(default.clone());
        }
        // Nothing to serve; never fabricate a success.
        Err(failure.clone())
    }
}

/// Skips operations that are not critical to the scenario, recording the skip
/// in the returned payload. Runs at `Moderate` severity.
pub struct SkipNonCriticalStrategy {
    non_critical: Vec<String>,
}

impl SkipNonCriticalStrategy {
    pub fn new(non_critical: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            non_critical: non_critical.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl DegradationStrategy for SkipNonCriticalStrategy {
    fn level(&self) -> DegradationLevel {
        DegradationLevel::Moderate
    }

    fn description(&self) -> String {
        "skip non-critical operation".to_string()
    }

    fn supported_operations(&self) -> Vec<String> {
        self.non_critical.clone()
    }

    fn can_handle(&self, _failure: &TestFailure, _service_id: &str) -> bool {
        true
    }

    async fn execute_degraded(
        &self,
        operation: &str,
        service_id: &str,
        failure: &TestFailure,
        _params: &DegradationParams,
    ) -> Result<Value, TestFailure> {
        info!(operation, service = service_id, "Skipping non-critical operation");
        Ok(json!({
            "skipped": true,
            "operation": operation,
            "service": service_id,
            "reason": failure.message,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::FailureType;

    fn failure() -> TestFailure {
        TestFailure::new(FailureType::Timeout, "deadline exceeded").with_service("catalog")
    }

    #[tokio::test]
    async fn test_cached_response_prefers_service_scoped_entry() {
        let strategy = CachedResponseStrategy::new(["get_catalog"]);
        strategy.cache_response("get_catalog", "catalog", json!({"items": 3}));
        strategy.cache_response("get_catalog", "other", json!({"items": 9}));

        let result = strategy
            .execute_degraded(
                "get_catalog",
                "other",
                &failure(),
                &DegradationParams::new(),
            )
            .await
            .unwrap();
        assert_eq!(result["items"], 9);
    }

    #[tokio::test]
    async fn test_cached_response_falls_back_to_default() {
        let strategy = CachedResponseStrategy::new(["get_catalog"])
            .with_default_response(json!({"items": 0, "stale": true}));

        let result = strategy
            .execute_degraded(
                "get_catalog",
                "catalog",
                &failure(),
                &DegradationParams::new(),
            )
            .await
            .unwrap();
        assert_eq!(result["stale"], true);
    }

    #[tokio::test]
    async fn test_cached_response_without_data_propagates_failure() {
        let strategy = CachedResponseStrategy::new(["get_catalog"]);
        let err = strategy
            .execute_degraded(
                "get_catalog",
                "catalog",
                &failure(),
                &DegradationParams::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.failure_type, FailureType::Timeout);
    }

    #[tokio::test]
    async fn test_skip_strategy_reports_skip() {
        let strategy = SkipNonCriticalStrategy::new(["send_metrics", "warm_cache"]);
        assert_eq!(strategy.level(), DegradationLevel::Moderate);
        assert_eq!(strategy.supported_operations().len(), 2);

        let result = strategy
            .execute_degraded(
                "send_metrics",
                "metrics",
                &failure(),
                &DegradationParams::new(),
            )
            .await
            .unwrap();
        assert_eq!(result["skipped"], true);
        assert_eq!(result["operation"], "send_metrics");
    }
}
