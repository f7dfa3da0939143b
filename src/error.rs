//! Error types for the request gateway
//!
//! Two layers live here. [`CallError`] is what a venue adapter reports for a
//! single failed attempt; [`GatewayError`] is the outcome a caller of the
//! gateway observes once the pipeline has finished with a call.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Symbolic failure kind reported by a call executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, reset, DNS failure...
    Network,
    /// The attempt did not complete in time
    Timeout,
    /// 5xx-equivalent answer from the venue
    ServerError,
    /// Explicit "too many requests" signal
    RateLimited,
    /// Request rejected as malformed
    Validation,
    /// Venue answered correctly but refused on business grounds
    BusinessRule,
    /// Credentials rejected; needs external re-auth
    Unauthorized,
    /// Anything the adapter could not classify
    Unknown,
}

impl ErrorKind {
    /// Map an HTTP-like status code to an error kind
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorKind::RateLimited,
            408 | 504 => ErrorKind::Timeout,
            500..=599 => ErrorKind::ServerError,
            401 | 403 => ErrorKind::Unauthorized,
            409 => ErrorKind::BusinessRule,
            400..=499 => ErrorKind::Validation,
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ServerError => "server",
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::Validation => "validation",
            ErrorKind::BusinessRule => "business-rule",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Failure of a single execution attempt, as reported by the venue adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind} error: {message}")]
pub struct CallError {
    /// Symbolic failure kind used for classification
    pub kind: ErrorKind,
    /// HTTP-like status, when the venue produced one
    pub status: Option<u16>,
    /// Human readable detail
    pub message: String,
    /// Server supplied hint for when to try again
    pub retry_after: Option<Duration>,
}

impl CallError {
    /// Create a new call error
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Create a call error from an HTTP-like status code
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_status(status),
            status: Some(status),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn business_rule(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BusinessRule, message)
    }

    /// Attach a retry-after hint
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Coarse outcome kind, for callers that branch on what happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutcomeKind {
    Terminal,
    QueueFull,
    Timeout,
    ShortCircuited,
    Cancelled,
    InFlight,
    Internal,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutcomeKind::Terminal => "terminal",
            OutcomeKind::QueueFull => "queue-full",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::ShortCircuited => "short-circuited",
            OutcomeKind::Cancelled => "cancelled",
            OutcomeKind::InFlight => "in-flight",
            OutcomeKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Gateway error types
///
/// Every call submitted to the gateway resolves to exactly one success or one
/// of these variants.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Venue rejected the call for a reason retries cannot fix
    #[error("Terminal failure for {operation}: {source}")]
    Terminal {
        /// Operation class of the call
        operation: String,
        /// Underlying call error
        source: CallError,
    },

    /// Rate-limit queue for the operation class is at capacity
    #[error("Queue full for {operation} (capacity {capacity})")]
    QueueFull {
        /// Operation class of the call
        operation: String,
        /// Configured queue capacity
        capacity: usize,
    },

    /// Call waited in the rate-limit queue past its deadline
    #[error("Timed out in queue for {operation} after {waited:?}")]
    Timeout {
        /// Operation class of the call
        operation: String,
        /// Time spent queued
        waited: Duration,
    },

    /// Retry budget exhausted on retryable failures
    #[error("Retries exhausted for {operation} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Operation class of the call
        operation: String,
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: CallError,
    },

    /// Circuit breaker is open for the service
    #[error("Circuit open for service {service}")]
    ShortCircuited {
        /// Service identifier
        service: String,
    },

    /// Call was cancelled before it could complete
    #[error("Call cancelled for {operation}")]
    Cancelled {
        /// Operation class of the call
        operation: String,
    },

    /// An identical call is still being processed
    #[error("Duplicate call still in flight (key {key})")]
    InFlight {
        /// Idempotency key
        key: String,
    },

    /// Two distinct requests derived the same idempotency key
    #[error("Idempotency key collision on {key}")]
    KeyCollision {
        /// Idempotency key
        key: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl GatewayError {
    /// Outcome kind of this error
    pub fn kind(&self) -> OutcomeKind {
        match self {
            GatewayError::Terminal { .. } => OutcomeKind::Terminal,
            GatewayError::QueueFull { .. } => OutcomeKind::QueueFull,
            GatewayError::Timeout { .. } | GatewayError::RetriesExhausted { .. } => {
                OutcomeKind::Timeout
            }
            GatewayError::ShortCircuited { .. } => OutcomeKind::ShortCircuited,
            GatewayError::Cancelled { .. } => OutcomeKind::Cancelled,
            GatewayError::InFlight { .. } => OutcomeKind::InFlight,
            GatewayError::KeyCollision { .. }
            | GatewayError::ConfigError(_)
            | GatewayError::SerializationError(_)
            | GatewayError::IoError(_)
            | GatewayError::InternalError(_) => OutcomeKind::Internal,
        }
    }

    /// Check if the caller may reasonably resubmit later
    pub fn is_retryable_by_caller(&self) -> bool {
        matches!(
            self,
            GatewayError::QueueFull { .. }
                | GatewayError::Timeout { .. }
                | GatewayError::RetriesExhausted { .. }
                | GatewayError::ShortCircuited { .. }
                | GatewayError::InFlight { .. }
        )
    }

    /// Check if error is due to rate limiting
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, GatewayError::QueueFull { .. })
    }

    /// Check if error is due to an open circuit
    pub fn is_short_circuit(&self) -> bool {
        matches!(self, GatewayError::ShortCircuited { .. })
    }

    /// Underlying venue error, if the call reached the venue
    pub fn call_error(&self) -> Option<&CallError> {
        match self {
            GatewayError::Terminal { source, .. } => Some(source),
            GatewayError::RetriesExhausted { last_error, .. } => Some(last_error),
            _ => None,
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::ConfigError(err.to_string())
    }
}
