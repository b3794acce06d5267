//! Failure taxonomy for the distributed test harness.
//!
//! `TestFailure` is the record the test-execution and analysis layers hand to
//! the recovery core: which class of failure occurred, on which service, and
//! what the underlying error said. The recovery core never produces these on
//! its own behalf except when translating a breaker fail-fast signal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::degradation::DegradationLevel;

/// Classes of failure observed while driving scenarios across services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureType {
    /// Network connectivity issues (connection refused, DNS, resets)
    Network,
    /// Request or operation timeout
    Timeout,
    /// A service returned an application-level error
    Service,
    /// Infrastructure failure (host, container, broker)
    Infrastructure,
    /// Data corruption or unexpected payload shape
    Data,
    /// Business-logic invariant violated
    BusinessLogic,
    /// Authentication or authorization failure
    Authentication,
    /// Misconfiguration detected at runtime
    Configuration,
    /// A circuit breaker rejected the call without invoking the service
    CircuitBreakerOpen,
    /// Anything not classified above
    Unknown,
}

impl FailureType {
    /// Whether this class is transient enough to retry by default.
    ///
    /// Connection/timeout-class failures are worth retrying; logic, data and
    /// auth failures will fail the same way on every attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureType::Network | FailureType::Timeout | FailureType::Infrastructure
        )
    }

    /// Degradation level applied to the failing service when a test fails.
    ///
    /// Fixed policy table: connectivity problems degrade lightly, data and
    /// logic failures degrade hard, auth/config failures are critical.
    pub fn severity(&self) -> DegradationLevel {
        match self {
            FailureType::Network | FailureType::Timeout => DegradationLevel::Minimal,
            FailureType::Service
            | FailureType::Infrastructure
            | FailureType::CircuitBreakerOpen => DegradationLevel::Moderate,
            FailureType::Data | FailureType::BusinessLogic => DegradationLevel::Severe,
            FailureType::Authentication | FailureType::Configuration => {
                DegradationLevel::Critical
            }
            FailureType::Unknown => DegradationLevel::Minimal,
        }
    }
}

/// A failure observed during test execution, with context.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{failure_type:?} failure: {message}")]
pub struct TestFailure {
    /// Class of failure
    pub failure_type: FailureType,
    /// Service the failure was observed on, when attributable
    pub service_id: Option<String>,
    /// Underlying error message
    pub message: String,
    /// When the failure was observed
    pub timestamp: DateTime<Utc>,
}

impl TestFailure {
    pub fn new(failure_type: FailureType, message: impl Into<String>) -> Self {
        Self {
            failure_type,
            service_id: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_service(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }
}
