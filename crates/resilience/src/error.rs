//! Error types shared by every resilience layer
//!
//! Each layer converts failures of the call it wraps into the error channel of
//! a `Result` before returning control upward; nothing here panics past a
//! layer boundary. [`ResilienceError`] is the closed set of reasons a guarded
//! call can fail, parameterised over the caller's own error type `E` which is
//! carried unchanged in [`ResilienceError::Operation`].

use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

/// Boxed error type used where the concrete failure type is erased
pub type BoxedError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type for guarded operations
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Result type for configuration validation
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration is rejected at construction time, never at call time
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds a value outside its documented range
    #[error("Invalid configuration for '{field}': {message}")]
    Invalid { field: &'static str, message: String },

    /// A configuration document could not be parsed
    #[error("Failed to parse configuration: {message}")]
    Parse { message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid { field, message: message.into() }
    }
}

/// Errors that can occur in resilience operations
///
/// The wrapped operation's own error is preserved in
/// [`ResilienceError::Operation`]; every other variant is produced by a
/// resilience layer and means the operation either never ran or was cut
/// short.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// Circuit breaker is open, rejecting calls
    #[error("Circuit breaker is open, retry in {remaining:?}")]
    CircuitOpen { remaining: Duration },

    /// Waiting for a bulkhead slot exceeded the queue timeout
    #[error("Timed out after {waited:?} waiting for a bulkhead slot")]
    BulkheadTimeout { waited: Duration },

    /// Bulkhead wait queue is at its configured bound
    #[error("Bulkhead full: {capacity} concurrent operations and {queued} queued")]
    BulkheadFull { capacity: usize, queued: usize },

    /// The wrapped operation exceeded its deadline
    #[error("Operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The wrapped operation panicked
    #[error("Operation panicked: {message}")]
    Panicked { message: String },

    /// The underlying operation failed
    #[error("Operation failed")]
    Operation(#[source] E),
}

impl<E> ResilienceError<E> {
    /// True if the circuit breaker rejected the call
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// True if the bulkhead refused or timed out the call
    pub fn is_bulkhead_rejection(&self) -> bool {
        matches!(self, Self::BulkheadTimeout { .. } | Self::BulkheadFull { .. })
    }

    /// True if the wrapped call exceeded its deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Borrow the operation's own error, if that is what failed
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation(error) => Some(error),
            _ => None,
        }
    }

    /// Take the operation's own error, if that is what failed
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation(error) => Some(error),
            _ => None,
        }
    }

    /// Transform the operation error, leaving layer errors untouched
    pub fn map_operation<F, O>(self, f: O) -> ResilienceError<F>
    where
        O: FnOnce(E) -> F,
    {
        match self {
            Self::CircuitOpen { remaining } => ResilienceError::CircuitOpen { remaining },
            Self::BulkheadTimeout { waited } => ResilienceError::BulkheadTimeout { waited },
            Self::BulkheadFull { capacity, queued } => {
                ResilienceError::BulkheadFull { capacity, queued }
            }
            Self::Timeout { timeout } => ResilienceError::Timeout { timeout },
            Self::Panicked { message } => ResilienceError::Panicked { message },
            Self::Operation(error) => ResilienceError::Operation(f(error)),
        }
    }
}

/// Failure captured by [`SafeExecutor`](crate::safe::SafeExecutor) before it
/// is mapped to the caller's error type
#[derive(Debug, Error)]
pub enum SafeError {
    /// The operation returned an error
    #[error("{0}")]
    Failed(BoxedError),

    /// A single attempt exceeded the per-attempt timeout
    #[error("Attempt timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The operation panicked
    #[error("Operation panicked: {message}")]
    Panicked { message: String },
}

impl SafeError {
    /// Downcast the captured operation error to a concrete type
    pub fn downcast_ref<T: StdError + 'static>(&self) -> Option<&T> {
        match self {
            Self::Failed(error) => error.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Short stable label used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Timeout { .. } => "timeout",
            Self::Panicked { .. } => "panicked",
        }
    }
}

/// Render a caught panic payload as text
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("max_attempts", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for 'max_attempts': must be greater than 0"
        );
    }

    #[test]
    fn test_resilience_error_predicates() {
        let open: ResilienceError<std::io::Error> =
            ResilienceError::CircuitOpen { remaining: Duration::from_secs(1) };
        assert!(open.is_circuit_open());
        assert!(!open.is_timeout());

        let full: ResilienceError<std::io::Error> =
            ResilienceError::BulkheadFull { capacity: 2, queued: 4 };
        assert!(full.is_bulkhead_rejection());

        let timeout: ResilienceError<std::io::Error> =
            ResilienceError::Timeout { timeout: Duration::from_millis(5) };
        assert!(timeout.is_timeout());
        assert!(timeout.operation_error().is_none());
    }

    #[test]
    fn test_operation_error_keeps_source() {
        let err = ResilienceError::Operation(std::io::Error::other("disk on fire"));
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("disk on fire"));
        assert_eq!(err.into_operation_error().map(|e| e.to_string()).as_deref(), Some("disk on fire"));
    }

    #[test]
    fn test_map_operation_only_touches_operation_errors() {
        let err: ResilienceError<u32> = ResilienceError::Operation(7);
        let mapped = err.map_operation(|code| format!("code {code}"));
        assert_eq!(mapped.operation_error().map(String::as_str), Some("code 7"));

        let open: ResilienceError<u32> =
            ResilienceError::CircuitOpen { remaining: Duration::from_secs(2) };
        let mapped = open.map_operation(|code| format!("code {code}"));
        assert!(mapped.is_circuit_open());
    }

    #[test]
    fn test_safe_error_downcast() {
        let err = SafeError::Failed(Box::new(std::io::Error::other("boom")));
        assert!(err.downcast_ref::<std::io::Error>().is_some());
        assert_eq!(err.kind(), "failed");

        let timeout = SafeError::Timeout { timeout: Duration::from_millis(10) };
        assert!(timeout.downcast_ref::<std::io::Error>().is_none());
        assert_eq!(timeout.kind(), "timeout");
    }

    #[test]
    fn test_panic_message_variants() {
        let static_payload: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(static_payload.as_ref()), "static");

        let owned_payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned_payload.as_ref()), "owned");

        let other_payload: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(other_payload.as_ref()), "non-string panic payload");
    }
}
