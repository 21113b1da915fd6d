//! Error types for the Gatekeeper admission layer.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;

/// Error returned by [`Throttler::throttle`](crate::throttle::Throttler::throttle).
///
/// `E` is the error type of the wrapped operation. Operation failures come back
/// untouched in [`ThrottleError::Inner`].
#[derive(Error, Debug)]
pub enum ThrottleError<E> {
    /// The caller waited longer than its deadline for spacing or a free slot.
    #[error("Throttle timeout: '{key}' not admitted within {waited:?}")]
    Timeout { key: String, waited: Duration },

    /// The key was deregistered while the caller was queued.
    #[error("Throttle closed: '{key}' was removed while waiting")]
    Closed { key: String },

    /// The wrapped operation failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> ThrottleError<E> {
    /// Returns true if this error is a throttle timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ThrottleError::Timeout { .. })
    }

    /// Returns the operation's own error, if that is what failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            ThrottleError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = GatekeeperError::Config("unknown strategy 'x'".to_string());
        assert_eq!(err.to_string(), "Configuration error: unknown strategy 'x'");
    }

    #[test]
    fn test_throttle_error_helpers() {
        let timeout: ThrottleError<String> = ThrottleError::Timeout {
            key: "upstream".to_string(),
            waited: Duration::from_millis(50),
        };
        assert!(timeout.is_timeout());
        assert!(timeout.into_inner().is_none());

        let inner: ThrottleError<String> = ThrottleError::Inner("boom".to_string());
        assert!(!inner.is_timeout());
        assert_eq!(inner.to_string(), "boom");
        assert_eq!(inner.into_inner(), Some("boom".to_string()));
    }
}
