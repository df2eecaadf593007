//! Error taxonomy for VARMA delivery operations

use thiserror::Error;

/// Retry classification of a delivery error
///
/// Adapters map broker-specific failures onto this classification via
/// [`crate::BackendAdapter::classify`]. The retry executor consults it to
/// decide whether an attempt consumes a retry or propagates immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient failure - eligible for retry under the active policy
    Retryable,
    /// Permanent failure - bypasses retry, routes straight to the DLQ
    Terminal,
    /// Caller defect - surfaced synchronously, never retried or parked
    Caller,
}

/// Error type for delivery operations
///
/// This is the standard error type flowing through the publish path and
/// the [`crate::BackendAdapter`] boundary. Variants map one-to-one onto
/// the delivery semantics: validation failures are caller bugs, transient
/// failures are retried, terminal failures are dead-lettered, and state
/// errors signal lifecycle misuse.
///
/// # Example
///
/// ```
/// use varma_core::{DeliveryError, ErrorClass};
///
/// let err = DeliveryError::Transient("connection reset".to_string());
/// assert_eq!(err.class(), ErrorClass::Retryable);
///
/// let err = DeliveryError::Terminal("message too large".to_string());
/// assert_eq!(err.class(), ErrorClass::Terminal);
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Payload failed schema validation
    ///
    /// A caller error: surfaced synchronously from `publish()`, never
    /// retried and never DLQ-routed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Schema registration rejected by the compatibility checker
    #[error("incompatible schema: {0}")]
    Compatibility(String),

    /// Schema type string not recognized by this build
    ///
    /// The schema type set is open (`JSON`, `AVRO`, `PROTOBUF`, ...).
    /// Unknown values fail with this variant instead of crashing so new
    /// types can be introduced registry-side first.
    #[error("unsupported schema type: {0}")]
    UnsupportedSchemaType(String),

    /// Transient backend failure - network timeout, connection reset
    #[error("transient failure: {0}")]
    Transient(String),

    /// Permanent backend rejection - oversized payload, invalid topic
    #[error("terminal failure: {0}")]
    Terminal(String),

    /// Circuit breaker rejected the call without invoking the backend
    ///
    /// Fast-fail signal. Not counted as a new circuit failure.
    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    /// Lifecycle misuse - e.g. transactional send before `begin`
    #[error("invalid protocol state: {0}")]
    State(String),

    /// Caller-supplied publish deadline expired mid-flight
    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    /// Graceful shutdown failed
    #[error("shutdown error: {0}")]
    Shutdown(String),
}

impl DeliveryError {
    /// Default classification for retry decisions
    ///
    /// Adapters may override this mapping through
    /// [`crate::BackendAdapter::classify`] when a broker reports errors
    /// that need different treatment.
    pub fn class(&self) -> ErrorClass {
        match self {
            DeliveryError::Transient(_) | DeliveryError::Timeout(_) => ErrorClass::Retryable,
            DeliveryError::Terminal(_)
            | DeliveryError::CircuitOpen(_)
            | DeliveryError::Shutdown(_) => ErrorClass::Terminal,
            DeliveryError::Validation(_)
            | DeliveryError::Compatibility(_)
            | DeliveryError::UnsupportedSchemaType(_)
            | DeliveryError::State(_) => ErrorClass::Caller,
        }
    }

    /// Whether this error consumes a retry attempt
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        assert!(DeliveryError::Transient("reset".into()).is_retryable());
        assert!(DeliveryError::Timeout(500).is_retryable());
    }

    #[test]
    fn terminal_is_not_retryable() {
        assert!(!DeliveryError::Terminal("too large".into()).is_retryable());
        assert_eq!(
            DeliveryError::Terminal("too large".into()).class(),
            ErrorClass::Terminal
        );
    }

    #[test]
    fn circuit_open_is_not_retryable() {
        // An open circuit short-circuits; retrying inside the same call
        // would defeat the fast-fail.
        let err = DeliveryError::CircuitOpen("orders".into());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "circuit 'orders' is open");
    }

    #[test]
    fn caller_errors_classify_as_caller() {
        assert_eq!(
            DeliveryError::Validation("missing field".into()).class(),
            ErrorClass::Caller
        );
        assert_eq!(
            DeliveryError::State("send before begin".into()).class(),
            ErrorClass::Caller
        );
        assert_eq!(
            DeliveryError::UnsupportedSchemaType("THRIFT".into()).class(),
            ErrorClass::Caller
        );
    }
}
