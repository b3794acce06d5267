//! Rollback coordination.
//!
//! Callers register compensating actions against a test id while the
//! scenario runs; on failure the manager executes them in descending
//! priority order, strictly sequentially, and accounts for every action:
//! a failing action never blocks the rest, and re-invoking a rollback skips
//! actions that already ran.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::failure::TestFailure;

/// A single compensating action, implemented by the caller per operation
/// that needs undoing.
#[async_trait]
pub trait RollbackAction: Send + Sync {
    /// Stable identifier, used for execution deduplication.
    fn id(&self) -> String;

    /// Human-readable description for logs and reports.
    fn description(&self) -> String;

    /// Service this action compensates on.
    fn service_id(&self) -> String;

    /// Higher priority executes first.
    fn priority(&self) -> i32;

    /// Whether the action can run right now. Actions that answer `false`
    /// are recorded as failed and stay eligible for a later attempt.
    fn can_execute(&self) -> bool {
        true
    }

    /// Perform the compensating work.
    async fn execute(&self) -> Result<(), TestFailure>;
}

/// Outcome of one rollback action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackActionResult {
    pub action_id: String,
    pub description: String,
    pub successful: bool,
    pub error_message: Option<String>,
}

impl RollbackActionResult {
    fn success(action: &dyn RollbackAction) -> Self {
        Self {
            action_id: action.id(),
            description: action.description(),
            successful: true,
            error_message: None,
        }
    }

    fn failure(action: &dyn RollbackAction, message: impl Into<String>) -> Self {
        Self {
            action_id: action.id(),
            description: action.description(),
            successful: false,
            error_message: Some(message.into()),
        }
    }
}

/// Aggregate outcome of a rollback pass for one test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    pub test_id: String,
    /// True when every recorded action result succeeded (vacuously true
    /// when nothing needed to run).
    pub successful: bool,
    pub action_results: Vec<RollbackActionResult>,
    pub timestamp: DateTime<Utc>,
}

impl RollbackResult {
    fn from_results(test_id: impl Into<String>, action_results: Vec<RollbackActionResult>) -> Self {
        Self {
            test_id: test_id.into(),
            successful: action_results.iter().all(|r| r.successful),
            action_results,
            timestamp: Utc::now(),
        }
    }

    pub fn successful_count(&self) -> usize {
        self.action_results.iter().filter(|r| r.successful).count()
    }

    pub fn failed_count(&self) -> usize {
        self.action_results.iter().filter(|r| !r.successful).count()
    }
}

/// Registers and executes rollback actions per test run.
pub struct RollbackManager {
    /// Registered actions per test id, insertion order.
    actions: RwLock<HashMap<String, Vec<Arc<dyn RollbackAction>>>>,
    /// Action ids already executed per test id.
    executed: RwLock<HashMap<String, HashSet<String>>>,
    /// Per-test execution locks. The whole rollback pass for one test id
    /// runs under its lock, so concurrent invocations serialize and the
    /// executed-set check cannot race an in-flight action.
    passes: RwLock<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RollbackManager {
    pub fn new() -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
            executed: RwLock::new(HashMap::new()),
            passes: RwLock::new(HashMap::new()),
        }
    }

    /// Register a compensating action for a test. Order is not meaningful
    /// until execution, which sorts by priority.
    pub fn register_rollback_action(&self, test_id: &str, action: Arc<dyn RollbackAction>) {
        debug!(
            test = test_id,
            action = %action.id(),
            priority = action.priority(),
            "Registering rollback action"
        );
        self.actions
            .write()
            .entry(test_id.to_string())
            .or_default()
            .push(action);
    }

    pub fn has_rollback_actions(&self, test_id: &str) -> bool {
        self.actions
            .read()
            .get(test_id)
            .map(|actions| !actions.is_empty())
            .unwrap_or(false)
    }

    /// Number of tests with pending rollback actions, for statistics.
    pub fn tests_with_actions(&self) -> usize {
        self.actions
            .read()
            .values()
            .filter(|actions| !actions.is_empty())
            .count()
    }

    /// Execute all registered actions for a test, highest priority first.
    /// Concurrent calls for the same test id serialize; the loser observes
    /// the winner's executed-set and runs only what remains.
    pub async fn execute_rollback(&self, test_id: &str) -> RollbackResult {
        let pass = self.pass_lock(test_id);
        let _guard = pass.lock().await;
        let actions = self.snapshot_actions(test_id, None);
        self.run_actions(test_id, actions).await
    }

    /// Execute only the actions that compensate on the given services.
    pub async fn execute_rollback_for_services(
        &self,
        test_id: &str,
        service_ids: &[String],
    ) -> RollbackResult {
        let pass = self.pass_lock(test_id);
        let _guard = pass.lock().await;
        let actions = self.snapshot_actions(test_id, Some(service_ids));
        self.run_actions(test_id, actions).await
    }

    /// Drop the action queue and executed-set for a test. Required before a
    /// test id can be cleanly reused.
    pub fn clear_rollback_actions(&self, test_id: &str) {
        self.actions.write().remove(test_id);
        self.executed.write().remove(test_id);
        self.passes.write().remove(test_id);
    }

    fn pass_lock(&self, test_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.passes
            .write()
            .entry(test_id.to_string())
            .or_default()
            .clone()
    }

    fn snapshot_actions(
        &self,
        test_id: &str,
        service_filter: Option<&[String]>,
    ) -> Vec<Arc<dyn RollbackAction>> {
        let actions = self.actions.read();
        let Some(registered) = actions.get(test_id) else {
            return Vec::new();
        };
        let mut snapshot: Vec<_> = registered
            .iter()
            .filter(|action| {
                service_filter
                    .map(|services| services.contains(&action.service_id()))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        // Stable sort: descending priority, registration order on ties.
        snapshot.sort_by_key(|action| std::cmp::Reverse(action.priority()));
        snapshot
    }

    /// Sequential execution, called with the test's pass lock held. The
    /// parking_lot locks are only held to consult or update the executed-set,
    /// never across an action's await.
    async fn run_actions(
        &self,
        test_id: &str,
        actions: Vec<Arc<dyn RollbackAction>>,
    ) -> RollbackResult {
        if actions.is_empty() {
            debug!(test = test_id, "No rollback actions to execute");
            return RollbackResult::from_results(test_id, Vec::new());
        }

        info!(test = test_id, count = actions.len(), "Executing rollback");
        let mut results = Vec::new();

        for action in actions {
            let id = action.id();

            let already_executed = self
                .executed
                .read()
                .get(test_id)
                .map(|set| set.contains(&id))
                .unwrap_or(false);
            if already_executed {
                debug!(test = test_id, action = %id, "Skipping already-executed action");
                continue;
            }

            if !action.can_execute() {
                warn!(test = test_id, action = %id, "Rollback action cannot execute");
                results.push(RollbackActionResult::failure(
                    action.as_ref(),
                    "cannot execute",
                ));
                continue;
            }

            let outcome = action.execute().await;
            self.executed
                .write()
                .entry(test_id.to_string())
                .or_default()
                .insert(id.clone());

            match outcome {
                Ok(()) => {
                    debug!(test = test_id, action = %id, "Rollback action succeeded");
                    results.push(RollbackActionResult::success(action.as_ref()));
                }
                Err(failure) => {
                    error!(test = test_id, action = %id, error = %failure, "Rollback action failed");
                    results.push(RollbackActionResult::failure(
                        action.as_ref(),
                        failure.to_string(),
                    ));
                }
            }
        }

        let result = RollbackResult::from_results(test_id, results);
        info!(
            test = test_id,
            successful = result.successful,
            succeeded = result.successful_count(),
            failed = result.failed_count(),
            "Rollback finished"
        );
        result
    }
}

impl Default for RollbackManager {
    fn default() -> Self {
        Self::new()
    }
}
