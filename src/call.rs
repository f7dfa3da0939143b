//! Call descriptors and related identifiers
//!
//! A [`CallDescriptor`] identifies one outbound operation. It is built by the
//! caller, handed to the gateway by value and never mutated afterwards.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a submitted call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Generate a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical category of outbound call, e.g. `orderExecution`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationClass(pub String);

impl OperationClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Circuit-breaker grouping key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(pub String);

impl ServiceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&OperationClass> for ServiceId {
    fn from(operation: &OperationClass) -> Self {
        Self(operation.0.clone())
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Venue account the call acts on behalf of
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call priority, 0 (lowest) to 10 (highest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(5);
    pub const MAX: Priority = Priority(10);

    /// Create a priority, clamping to the 0..=10 range
    pub fn new(value: u8) -> Self {
        Self(value.min(Self::MAX.0))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable description of one outbound operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallDescriptor {
    /// Unique call identifier
    pub id: CallId,

    /// Selects limiter, breaker and retry configuration
    pub operation_class: OperationClass,

    /// Breaker grouping; defaults to the operation class
    pub service_id: Option<ServiceId>,

    /// Account the call acts for (part of the idempotency key)
    pub account_id: AccountId,

    /// Admission priority
    pub priority: Priority,

    /// Opaque bytes identifying the payload
    pub payload_fingerprint: Vec<u8>,

    /// Submission timestamp
    pub submitted_at: DateTime<Utc>,

    /// Longest time the call may wait for rate-limit admission
    pub max_wait: Option<Duration>,
}

impl CallDescriptor {
    /// Create a new call descriptor with normal priority, submitted now
    pub fn new(
        operation_class: OperationClass,
        account_id: AccountId,
        payload_fingerprint: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: CallId::new(),
            operation_class,
            service_id: None,
            account_id,
            priority: Priority::default(),
            payload_fingerprint: payload_fingerprint.into(),
            submitted_at: Utc::now(),
            max_wait: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_service(mut self, service_id: ServiceId) -> Self {
        self.service_id = Some(service_id);
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn with_submitted_at(mut self, submitted_at: DateTime<Utc>) -> Self {
        self.submitted_at = submitted_at;
        self
    }

    /// Breaker grouping key for this call
    pub fn service(&self) -> ServiceId {
        self.service_id
            .clone()
            .unwrap_or_else(|| ServiceId::from(&self.operation_class))
    }
}

/// Successful result of an executed call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    /// HTTP-like status, when the venue produced one
    pub status: Option<u16>,

    /// Response payload as delivered by the adapter
    pub body: serde_json::Value,

    /// Time the response was received
    pub received_at: DateTime<Utc>,
}

impl CallResponse {
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            status: None,
            body,
            received_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}
