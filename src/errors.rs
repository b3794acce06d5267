use thiserror::Error;

/// The central error type for the Steadfast recovery core.
///
/// Operational failures travel as [`crate::failure::TestFailure`] values;
/// this hierarchy covers the crate's own configuration and bookkeeping
/// errors.
#[derive(Error, Debug)]
pub enum SteadfastError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SteadfastError>;

/// Error returned by a circuit breaker wrapped call.
///
/// `CircuitOpen` is a fail-fast signal: the wrapped operation was never
/// invoked. `OperationFailed` carries the operation's own error unchanged.
#[derive(Debug, Clone)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open; the named breaker rejected the call.
    CircuitOpen { service: String },
    /// The wrapped operation ran and failed.
    OperationFailed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CircuitOpen { service } => {
                write!(f, "Circuit breaker '{}' is open", service)
            }
            Self::OperationFailed(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for CircuitBreakerError<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker_error_display() {
        let open_err: CircuitBreakerError<String> = CircuitBreakerError::CircuitOpen {
            service: "payment".to_string(),
        };
        assert_eq!(format!("{}", open_err), "Circuit breaker 'payment' is open");

        let op_err: CircuitBreakerError<String> =
            CircuitBreakerError::OperationFailed("db timeout".into());
        assert_eq!(format!("{}", op_err), "Operation failed: db timeout");
    }

    #[test]
    fn test_steadfast_error_display() {
        let err = SteadfastError::Config("missing retry policy".to_string());
        assert_eq!(
            format!("{}", err),
            "Configuration error: missing retry policy"
        );
    }
}
