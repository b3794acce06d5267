//! Steadfast - Recovery core for distributed service testing
//!
//! The resilience layer of an automated test harness for service-oriented
//! applications: when injected faults and real outages knock services over
//! mid-scenario, this crate keeps the run coherent.
//!
//! - **Circuit breaking**: per-service breakers stop hammering dead services
//! - **Retry**: jittered exponential backoff for transient failures
//! - **Degradation**: pluggable fallbacks instead of hard scenario aborts
//! - **Rollback**: priority-ordered cleanup of side effects after failed tests
//!
//! # Quick Start
//!
//! ```ignore
//! use steadfast::config::SteadfastConfig;
//! use steadfast::recovery::ErrorHandlingService;
//!
//! let config = SteadfastConfig::load(None)?;
//! let service = ErrorHandlingService::new();
//! let result = service
//!     .execute_with_error_handling(
//!         "get_order",
//!         "orders",
//!         || async { call_orders_service().await },
//!         &config.retry_policy(),
//!         &config.circuit_breaker_config(),
//!     )
//!     .await?;
//! ```

// ─── Core recovery mechanisms ──────────────────────────────────────
pub mod circuit_breaker;
pub mod degradation;
pub mod retry;
pub mod rollback;
pub mod strategies;

// ─── Orchestration façade ──────────────────────────────────────────
pub mod recovery;

// ─── Foundation ────────────────────────────────────────────────────
pub mod config;
pub mod errors;
pub mod failure;
pub mod telemetry;
