//! # ag-gateway: Resilient Outbound Request Gateway
//!
//! This library decides, for every outbound call to a trading venue, whether
//! to send it now, queue it, fail it fast or retry it. It keeps calls inside
//! the venue's rate limits, isolates callers from a failing venue and never
//! executes a side-effecting call twice.
//!
//! ## Core Components
//!
//! - **Gateway**: Runs every call through breaker, limiter, idempotency cache and retries
//! - **RateLimiter**: Sliding-window quota with a priority queue per operation class
//! - **CircuitBreaker**: Per-service CLOSED/OPEN/HALF_OPEN state machine
//! - **RetryEngine**: Error classification and exponential backoff with jitter
//! - **IdempotencyCache**: Collapses duplicate submissions into one execution
//! - **CallExecutor**: Trait implemented by the venue-protocol adapter
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use ag_gateway::adapters::{CallExecutor, Credential};
//! use ag_gateway::{
//!     AccountId, CallDescriptor, CallError, CallResponse, Gateway, GatewayConfig,
//!     OperationClass, Priority,
//! };
//!
//! struct VenueClient;
//!
//! #[async_trait]
//! impl CallExecutor for VenueClient {
//!     fn name(&self) -> &str {
//!         "venue"
//!     }
//!
//!     async fn execute(
//!         &self,
//!         _call: &CallDescriptor,
//!         _credential: Option<&Credential>,
//!     ) -> Result<CallResponse, CallError> {
//!         Ok(CallResponse::new(serde_json::json!({ "order_id": "abc" })))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = GatewayConfig::from_env().unwrap_or_default();
//!     let gateway = Gateway::builder(config, Arc::new(VenueClient))
//!         .build()
//!         .await
//!         .expect("gateway");
//!
//!     let call = CallDescriptor::new(
//!         OperationClass::new("orderExecution"),
//!         AccountId::new("account-1"),
//!         b"buy 10 @ 0.52".to_vec(),
//!     )
//!     .with_priority(Priority::new(9));
//!
//!     match gateway.execute(call).await {
//!         Ok(response) => println!("Placed: {}", response.body),
//!         Err(e) => eprintln!("Call failed ({}): {}", e.kind(), e),
//!     }
//!
//!     gateway.shutdown().await.ok();
//! }
//! ```

// Public modules
pub mod call;
pub mod clock;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod retry;
pub mod snapshot;

// Re-export main types
pub use call::{
    AccountId, CallDescriptor, CallId, CallResponse, OperationClass, Priority, ServiceId,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CircuitBreakerConfig, GatewayConfig, IdempotencyConfig, OperationConfig, RateLimitConfig,
    RetryConfig, RuntimeConfig,
};
pub use error::{CallError, ErrorKind, GatewayError, GatewayResult, OutcomeKind};

// Internal modules
mod engine;

// Rate limiting
pub mod ratelimit {
    pub mod limiter;
    pub mod queue;
    pub mod window;

    pub use limiter::{Admission, QueueTicket, RateLimiter, WindowSnapshot};
    pub use queue::{PriorityRequestQueue, QueueResolution, QueuedEntry};
    pub use window::{SlidingWindowCounter, WindowBucket};
}

// Circuit breaking
pub mod circuit {
    pub mod breaker;
    pub mod state;

    pub use breaker::{BreakerDecision, CircuitBreaker, CircuitSnapshot};
    pub use state::{CircuitRecord, CircuitState};
}

// Collaborator adapters
pub mod adapters {
    pub mod executor;

    pub use executor::{
        CallExecutor, Credential, CredentialSupplier, FailFast, FallbackHandler,
        LastKnownFallback, StaticCredentials, StaticFallback,
    };
}

// Re-export engine
pub use engine::{Gateway, GatewayBuilder};
pub use idempotency::{IdempotencyCache, IdempotencyKey};
pub use retry::{RetryDecision, RetryEngine};

// Initialize tracing
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ag_gateway=info"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}
