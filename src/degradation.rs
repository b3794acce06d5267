//! Graceful degradation.
//!
//! When retries and circuit breaking are exhausted, the degradation manager
//! substitutes a reduced-functionality response instead of failing the whole
//! scenario: cached payloads, skipped non-critical steps, whatever a
//! registered [`DegradationStrategy`] can offer for the failed operation.
//!
//! Severity is tracked per service plus one global level; the effective level
//! for a service is the more severe of the two. Matching a strategy escalates
//! the service monotonically. Levels never decay on their own; only the
//! explicit set/reset operators lower them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::failure::TestFailure;

/// Named parameters forwarded untouched to the matched strategy.
///
/// The expected keys are part of the calling convention of each operation;
/// the manager itself never inspects the contents.
pub type DegradationParams = HashMap<String, Value>;

/// How degraded a service (or the whole run) currently is.
///
/// Ordering goes through [`DegradationLevel::rank`] rather than declaration
/// order, so reordering variants cannot silently change severity comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DegradationLevel {
    None,
    Minimal,
    Moderate,
    Severe,
    Critical,
}

impl DegradationLevel {
    /// Explicit severity rank; higher is more severe.
    pub fn rank(&self) -> u8 {
        match self {
            DegradationLevel::None => 0,
            DegradationLevel::Minimal => 1,
            DegradationLevel::Moderate => 2,
            DegradationLevel::Severe => 3,
            DegradationLevel::Critical => 4,
        }
    }

    fn from_rank(rank: u8) -> Self {
        match rank {
            1 => DegradationLevel::Minimal,
            2 => DegradationLevel::Moderate,
            3 => DegradationLevel::Severe,
            4 => DegradationLevel::Critical,
            _ => DegradationLevel::None,
        }
    }

    /// All levels, least to most severe.
    pub fn ascending() -> [DegradationLevel; 5] {
        [
            DegradationLevel::None,
            DegradationLevel::Minimal,
            DegradationLevel::Moderate,
            DegradationLevel::Severe,
            DegradationLevel::Critical,
        ]
    }
}

impl Ord for DegradationLevel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for DegradationLevel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A pluggable fallback behavior for a set of named operations.
#[async_trait]
pub trait DegradationStrategy: Send + Sync {
    /// Severity this strategy operates at.
    fn level(&self) -> DegradationLevel;

    /// Human-readable description for logs and reports.
    fn description(&self) -> String;

    /// Operation names this strategy can stand in for.
    fn supported_operations(&self) -> Vec<String>;

    /// Whether this strategy applies to the given failure on the given service.
    fn can_handle(&self, failure: &TestFailure, service_id: &str) -> bool;

    /// Produce the degraded result for a failed operation.
    async fn execute_degraded(
        &self,
        operation: &str,
        service_id: &str,
        failure: &TestFailure,
        params: &DegradationParams,
    ) -> Result<Value, TestFailure>;
}

/// Tracks degradation severity and selects fallback strategies.
pub struct GracefulDegradationManager {
    /// Registered strategies per level, in registration order.
    strategies: RwLock<HashMap<DegradationLevel, Vec<Arc<dyn DegradationStrategy>>>>,
    /// Per-service degradation levels.
    service_levels: RwLock<HashMap<String, DegradationLevel>>,
    /// Run-wide degradation level, stored as a rank.
    global_level: AtomicU8,
}

impl GracefulDegradationManager {
    pub fn new() -> Self {
        Self {
            strategies: RwLock::new(HashMap::new()),
            service_levels: RwLock::new(HashMap::new()),
            global_level: AtomicU8::new(DegradationLevel::None.rank()),
        }
    }

    /// Register a strategy under its own level. Registration order is
    /// preserved and decides ties within a level.
    pub fn register_strategy(&self, strategy: Arc<dyn DegradationStrategy>) {
        let level = strategy.level();
        info!(
            level = ?level,
            description = %strategy.description(),
            "Registering degradation strategy"
        );
        self.strategies.write().entry(level).or_default().push(strategy);
    }

    /// Effective level for a service: max of its own level and the global one.
    pub fn effective_level(&self, service_id: &str) -> DegradationLevel {
        let service = self.get_service_degradation_level(service_id);
        let global = self.global_degradation_level();
        service.max(global)
    }

    /// Find and apply a fallback for a failed operation.
    ///
    /// Levels are scanned from the service's effective level up through
    /// `Critical`; within a level, strategies are tried in registration
    /// order. The first strategy that supports the operation and can handle
    /// the failure wins. A match escalates the service to the strategy's
    /// level (only upward), then delegates. With no match anywhere the
    /// original failure comes back unchanged.
    pub async fn execute_with_degradation(
        &self,
        operation: &str,
        service_id: &str,
        failure: &TestFailure,
        params: &DegradationParams,
    ) -> Result<Value, TestFailure> {
        let current = self.effective_level(service_id);

        let selected = self.select_strategy(operation, service_id, failure, current);

        match selected {
            Some(strategy) => {
                self.escalate_service_level(service_id, strategy.level());
                info!(
                    operation,
                    service = service_id,
                    level = ?strategy.level(),
                    strategy = %strategy.description(),
                    "Executing degraded operation"
                );
                strategy
                    .execute_degraded(operation, service_id, failure, params)
                    .await
            }
            None => {
                warn!(
                    operation,
                    service = service_id,
                    level = ?current,
                    "No degradation strategy available, propagating failure"
                );
                Err(failure.clone())
            }
        }
    }

    fn select_strategy(
        &self,
        operation: &str,
        service_id: &str,
        failure: &TestFailure,
        from_level: DegradationLevel,
    ) -> Option<Arc<dyn DegradationStrategy>> {
        let strategies = self.strategies.read();
        for level in DegradationLevel::ascending() {
            if level < from_level {
                continue;
            }
            let Some(candidates) = strategies.get(&level) else {
                continue;
            };
            for strategy in candidates {
                if strategy
                    .supported_operations()
                    .iter()
                    .any(|op| op == operation)
                    && strategy.can_handle(failure, service_id)
                {
                    return Some(strategy.clone());
                }
            }
        }
        None
    }

    /// Raise a service's level to `level` if that is more severe than its
    /// current value. Never lowers.
    fn escalate_service_level(&self, service_id: &str, level: DegradationLevel) {
        let mut levels = self.service_levels.write();
        let entry = levels
            .entry(service_id.to_string())
            .or_insert(DegradationLevel::None);
        if level > *entry {
            debug!(service = service_id, from = ?*entry, to = ?level, "Escalating degradation");
            *entry = level;
        }
    }

    /// Direct overwrite of a service's level, bypassing monotonic escalation.
    pub fn set_service_degradation_level(&self, service_id: &str, level: DegradationLevel) {
        info!(service = service_id, level = ?level, "Setting service degradation level");
        self.service_levels
            .write()
            .insert(service_id.to_string(), level);
    }

    pub fn get_service_degradation_level(&self, service_id: &str) -> DegradationLevel {
        self.service_levels
            .read()
            .get(service_id)
            .copied()
            .unwrap_or(DegradationLevel::None)
    }

    /// Drop a service back to `None` by removing its entry.
    pub fn reset_service_degradation(&self, service_id: &str) {
        self.service_levels.write().remove(service_id);
    }

    /// Direct overwrite of the run-wide level.
    pub fn set_global_degradation_level(&self, level: DegradationLevel) {
        info!(level = ?level, "Setting global degradation level");
        self.global_level.store(level.rank(), Ordering::Release);
    }

    pub fn global_degradation_level(&self) -> DegradationLevel {
        DegradationLevel::from_rank(self.global_level.load(Ordering::Acquire))
    }

    pub fn reset_global_degradation(&self) {
        self.set_global_degradation_level(DegradationLevel::None);
    }

    /// Whether the service is running at any reduced level.
    pub fn is_service_degraded(&self, service_id: &str) -> bool {
        self.effective_level(service_id) > DegradationLevel::None
    }

    /// Services currently tracked above `None`, for statistics.
    pub fn degraded_service_count(&self) -> usize {
        self.service_levels
            .read()
            .values()
            .filter(|level| **level > DegradationLevel::None)
            .count()
    }
}

impl Default for GracefulDegradationManager {
    fn default() -> Self {
        Self::new()
    }
}
