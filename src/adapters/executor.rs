//! Collaborator traits and stock fallbacks
//!
//! The gateway does not speak any venue protocol. A venue adapter implements
//! [`CallExecutor`], a token source implements [`CredentialSupplier`], and a
//! [`FallbackHandler`] decides what a caller gets while a circuit is open.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::call::{CallDescriptor, CallResponse, OperationClass};
use crate::error::{CallError, GatewayError, GatewayResult};

/// Call executor trait
///
/// Implemented by the venue-protocol adapter. Dropping the returned future
/// cancels the call; implementations must not keep side effects running after
/// being dropped.
#[async_trait]
pub trait CallExecutor: Send + Sync {
    /// Executor name, for logs
    fn name(&self) -> &str;

    /// Execute one attempt of a call
    ///
    /// # Arguments
    /// * `call` - The call to execute
    /// * `credential` - Credential read for this attempt, if a supplier is configured
    ///
    /// # Returns
    /// * `Ok(CallResponse)` - The venue answered successfully
    /// * `Err(CallError)` - The attempt failed; `kind` drives retry classification
    async fn execute(
        &self,
        call: &CallDescriptor,
        credential: Option<&Credential>,
    ) -> Result<CallResponse, CallError>;
}

/// Access token handed to the executor
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of the current credential
///
/// Read once per attempt; refresh is the supplier's business.
#[async_trait]
pub trait CredentialSupplier: Send + Sync {
    async fn credential(&self) -> Result<Credential, CallError>;
}

/// Supplier that always returns the same credential
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credential);

impl StaticCredentials {
    pub fn new(credential: Credential) -> Self {
        Self(credential)
    }
}

#[async_trait]
impl CredentialSupplier for StaticCredentials {
    async fn credential(&self) -> Result<Credential, CallError> {
        Ok(self.0.clone())
    }
}

/// Decides the result of a short-circuited call
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    /// Produce a result for a call the breaker refused
    async fn on_short_circuit(&self, call: &CallDescriptor) -> GatewayResult<CallResponse>;

    /// Observe a successful response (used by caching fallbacks)
    fn observe(&self, _call: &CallDescriptor, _response: &CallResponse) {}
}

fn short_circuited(call: &CallDescriptor) -> GatewayError {
    GatewayError::ShortCircuited {
        service: call.service().to_string(),
    }
}

/// Propagate the short circuit to the caller
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFast;

#[async_trait]
impl FallbackHandler for FailFast {
    async fn on_short_circuit(&self, call: &CallDescriptor) -> GatewayResult<CallResponse> {
        Err(short_circuited(call))
    }
}

/// Answer with a fixed response
#[derive(Debug, Clone)]
pub struct StaticFallback {
    response: CallResponse,
}

impl StaticFallback {
    pub fn new(response: CallResponse) -> Self {
        Self { response }
    }
}

#[async_trait]
impl FallbackHandler for StaticFallback {
    async fn on_short_circuit(&self, call: &CallDescriptor) -> GatewayResult<CallResponse> {
        debug!("Serving static fallback for {}", call.operation_class);
        Ok(self.response.clone())
    }
}

/// Answer with the last successful response seen for the operation class
#[derive(Debug, Default)]
pub struct LastKnownFallback {
    last: DashMap<OperationClass, CallResponse>,
}

impl LastKnownFallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_known(&self, operation: &OperationClass) -> Option<CallResponse> {
        self.last.get(operation).map(|r| r.clone())
    }
}

#[async_trait]
impl FallbackHandler for LastKnownFallback {
    async fn on_short_circuit(&self, call: &CallDescriptor) -> GatewayResult<CallResponse> {
        match self.last_known(&call.operation_class) {
            Some(response) => {
                debug!("Serving last known response for {}", call.operation_class);
                Ok(response)
            }
            None => Err(short_circuited(call)),
        }
    }

    fn observe(&self, call: &CallDescriptor, response: &CallResponse) {
        self.last
            .insert(call.operation_class.clone(), response.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::AccountId;

    fn call(op: &str) -> CallDescriptor {
        CallDescriptor::new(OperationClass::new(op), AccountId::new("acct"), "payload")
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("super-secret-token");
        let rendered = format!("{:?}", credential);
        assert!(!rendered.contains("super-secret-token"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_fail_fast_reports_service() {
        let call = call("orderExecution");
        let result = FailFast.on_short_circuit(&call).await;
        match result {
            Err(GatewayError::ShortCircuited { service }) => assert_eq!(service, "orderExecution"),
            other => panic!("expected short circuit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_last_known_fallback() {
        let fallback = LastKnownFallback::new();
        let quotes = call("marketData");

        assert!(fallback.on_short_circuit(&quotes).await.is_err());

        let response = CallResponse::new(serde_json::json!({"bid": 0.52}));
        fallback.observe(&quotes, &response);
        assert_eq!(fallback.on_short_circuit(&quotes).await.unwrap(), response);

        // Other operation classes keep their own history.
        assert!(fallback.on_short_circuit(&call("history")).await.is_err());
    }

    #[tokio::test]
    async fn test_static_credentials() {
        let supplier = StaticCredentials::new(Credential::new("token"));
        assert_eq!(supplier.credential().await.unwrap().token, "token");
    }
}
