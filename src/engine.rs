//! Gateway orchestrating outbound calls
//!
//! Every call runs the same pipeline: circuit breaker check, rate-limit
//! admission, idempotency lookup (first attempt only), execution, then
//! outcome bookkeeping and, on a retryable failure, backoff and another pass
//! through the breaker and limiter.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::adapters::executor::{
    CallExecutor, Credential, CredentialSupplier, FailFast, FallbackHandler,
};
use crate::call::{CallDescriptor, CallId, CallResponse, OperationClass, ServiceId};
use crate::circuit::breaker::{BreakerDecision, CircuitBreaker};
use crate::circuit::state::CircuitState;
use crate::clock::{Clock, SystemClock};
use crate::config::GatewayConfig;
use crate::error::{CallError, GatewayError, GatewayResult};
use crate::idempotency::{CacheLookup, IdempotencyCache, PendingGuard};
use crate::ratelimit::limiter::{Admission, RateLimiter};
use crate::retry::{ErrorClass, RetryDecision, RetryEngine};
use crate::snapshot::GatewaySnapshot;

/// Builder for [`Gateway`]
pub struct GatewayBuilder {
    config: GatewayConfig,
    executor: Arc<dyn CallExecutor>,
    credentials: Option<Arc<dyn CredentialSupplier>>,
    fallbacks: HashMap<OperationClass, Arc<dyn FallbackHandler>>,
    default_fallback: Arc<dyn FallbackHandler>,
    clock: Option<Arc<dyn Clock>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig, executor: Arc<dyn CallExecutor>) -> Self {
        Self {
            config,
            executor,
            credentials: None,
            fallbacks: HashMap::new(),
            default_fallback: Arc::new(FailFast),
            clock: None,
        }
    }

    /// Credential supplier read before every attempt
    pub fn credentials(mut self, supplier: Arc<dyn CredentialSupplier>) -> Self {
        self.credentials = Some(supplier);
        self
    }

    /// Fallback for short-circuited calls of one operation class
    pub fn fallback(
        mut self,
        operation: OperationClass,
        handler: Arc<dyn FallbackHandler>,
    ) -> Self {
        self.fallbacks.insert(operation, handler);
        self
    }

    /// Fallback for operation classes without their own
    pub fn default_fallback(mut self, handler: Arc<dyn FallbackHandler>) -> Self {
        self.default_fallback = handler;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the gateway and spawn its background tasks
    ///
    /// Must run inside a Tokio runtime. Restores the snapshot named by
    /// `runtime.snapshot_path` when present.
    pub async fn build(self) -> GatewayResult<Gateway> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            GatewayError::InternalError(format!("Gateway requires a Tokio runtime: {}", e))
        })?;

        let config = Arc::new(self.config.sanitize());
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let limiter = Arc::new(RateLimiter::new(Arc::clone(&config), Arc::clone(&clock)));
        let breaker = Arc::new(CircuitBreaker::new(Arc::clone(&config), Arc::clone(&clock)));
        let cache = Arc::new(IdempotencyCache::new(Arc::clone(&config), Arc::clone(&clock)));

        if let Some(path) = &config.runtime.snapshot_path {
            if let Some(snapshot) = GatewaySnapshot::load_or_cold(path).await {
                limiter.restore(snapshot.windows);
                breaker.restore(snapshot.circuits);
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![
            runtime.spawn(
                Arc::clone(&limiter)
                    .run_dequeue_loop(config.runtime.dequeue_tick(), shutdown_rx.clone()),
            ),
            runtime.spawn(
                Arc::clone(&cache)
                    .run_sweep_loop(config.runtime.sweep_interval(), shutdown_rx.clone()),
            ),
        ];
        if let Some(path) = config.runtime.snapshot_path.clone() {
            tasks.push(runtime.spawn(run_snapshot_loop(
                Arc::clone(&limiter),
                Arc::clone(&breaker),
                Arc::clone(&clock),
                path,
                config.runtime.snapshot_interval(),
                shutdown_rx,
            )));
        }

        info!(
            "Gateway started with executor {} ({} configured operation classes)",
            self.executor.name(),
            config.operations.len()
        );

        Ok(Gateway {
            retry: RetryEngine::new(Arc::clone(&config)),
            config,
            clock,
            limiter,
            breaker,
            cache,
            executor: self.executor,
            credentials: self.credentials,
            fallbacks: self.fallbacks,
            default_fallback: self.default_fallback,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }
}

/// Resilient outbound-request gateway
pub struct Gateway {
    config: Arc<GatewayConfig>,
    clock: Arc<dyn Clock>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryEngine,
    cache: Arc<IdempotencyCache>,
    executor: Arc<dyn CallExecutor>,
    credentials: Option<Arc<dyn CredentialSupplier>>,
    fallbacks: HashMap<OperationClass, Arc<dyn FallbackHandler>>,
    default_fallback: Arc<dyn FallbackHandler>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig, executor: Arc<dyn CallExecutor>) -> GatewayBuilder {
        GatewayBuilder::new(config, executor)
    }

    /// Execute a call through the full pipeline
    ///
    /// Resolves exactly once to the response or to one [`GatewayError`]
    /// outcome kind. Dropping the future cancels the call: a queued entry is
    /// purged and a pending idempotency entry is released.
    pub async fn execute(&self, call: CallDescriptor) -> GatewayResult<CallResponse> {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(GatewayError::Cancelled {
                operation: call.operation_class.to_string(),
            });
        }

        let call = Arc::new(call);
        let operation = call.operation_class.clone();
        let service = call.service();
        let op_config = self.config.operation(&operation);

        debug!(
            "Executing call {} ({}, priority {})",
            call.id, operation, call.priority
        );

        let mut guard: Option<PendingGuard> = None;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let permit = match self.breaker.should_proceed(&service) {
                BreakerDecision::Proceed { generation } => {
                    BreakerPermit::new(&self.breaker, &service, generation)
                }
                BreakerDecision::ShortCircuit => {
                    warn!("Call {} short-circuited, circuit for {} is open", call.id, service);
                    let result = self.fallback(&operation).on_short_circuit(&call).await;
                    // A fallback answer is not an execution; duplicates see the short circuit.
                    if let Some(guard) = guard.take() {
                        guard.resolve(&Err(GatewayError::ShortCircuited {
                            service: service.to_string(),
                        }));
                    }
                    return result;
                }
            };

            if let Err(e) = self.admit(&call).await {
                return finish(guard, Err(e));
            }

            if attempt == 1 && op_config.idempotency.enabled {
                match self.claim(&call, op_config.idempotency.duplicate_wait()).await {
                    Ok(Claim::Owner(owned)) => guard = Some(owned),
                    Ok(Claim::Resolved(result)) => return result,
                    Err(e) => return Err(e),
                }
            }

            let (contacted, outcome) = self.attempt(&call).await;

            let error = match outcome {
                Ok(response) => {
                    permit.record(true);
                    self.fallback(&operation).observe(&call, &response);
                    debug!("Call {} succeeded on attempt {}", call.id, attempt);
                    return finish(guard, Ok(response));
                }
                Err(error) => error,
            };

            let class = self.retry.classify(&operation, &error);
            if contacted {
                // Terminal errors mean the venue answered correctly.
                permit.record(class == ErrorClass::Terminal);
            } else {
                drop(permit);
            }

            match self.retry.next_action(&operation, attempt, &error) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        "Attempt {} of call {} failed ({}), retrying in {:?}",
                        attempt, call.id, error, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            info!("Gateway shutting down, abandoning retries of call {}", call.id);
                            return finish(
                                guard,
                                Err(GatewayError::Cancelled {
                                    operation: operation.to_string(),
                                }),
                            );
                        }
                    }
                }
                RetryDecision::GiveUp => {
                    let failure = match class {
                        ErrorClass::Terminal => {
                            debug!("Call {} failed terminally: {}", call.id, error);
                            GatewayError::Terminal {
                                operation: operation.to_string(),
                                source: error,
                            }
                        }
                        ErrorClass::Retryable => {
                            error!(
                                "Call {} gave up after {} attempts: {}",
                                call.id, attempt, error
                            );
                            GatewayError::RetriesExhausted {
                                operation: operation.to_string(),
                                attempts: attempt,
                                last_error: error,
                            }
                        }
                    };
                    return finish(guard, Err(failure));
                }
            }
        }
    }

    /// Rate-limit admission, waiting in the queue if needed
    async fn admit(&self, call: &Arc<CallDescriptor>) -> GatewayResult<()> {
        match self.limiter.admit(call)? {
            Admission::Allowed { .. } => Ok(()),
            Admission::Queued {
                position,
                wait_hint,
                ticket,
            } => {
                debug!(
                    "Call {} waiting at position {} (next slot in {:?})",
                    call.id, position, wait_hint
                );
                ticket.wait().await.map(|_| ())
            }
        }
    }

    /// Claim the idempotency key of a call, or obtain the outcome of its twin
    async fn claim(&self, call: &CallDescriptor, duplicate_wait: Duration) -> GatewayResult<Claim> {
        loop {
            match self.cache.get_or_create(call)? {
                CacheLookup::Created(guard) => return Ok(Claim::Owner(guard)),
                CacheLookup::Hit(response) => {
                    info!("Call {} served from idempotency cache", call.id);
                    return Ok(Claim::Resolved(Ok(response)));
                }
                CacheLookup::Pending(wait) => {
                    let key = wait.key();
                    match wait.wait(duplicate_wait).await {
                        Some(result) => return Ok(Claim::Resolved(result)),
                        None => debug!("Original of {} abandoned key {}, retrying lookup", call.id, key),
                    }
                }
            }
        }
    }

    /// One execution attempt; the flag tells whether the executor was reached
    async fn attempt(&self, call: &CallDescriptor) -> (bool, Result<CallResponse, CallError>) {
        let credential = match self.credential().await {
            Ok(credential) => credential,
            Err(e) => {
                warn!("Credential supplier failed for call {}: {}", call.id, e);
                return (false, Err(e));
            }
        };

        let limit = self.config.operation(&call.operation_class).retry.attempt_timeout();
        let execution = self.executor.execute(call, credential.as_ref());
        match tokio::time::timeout(limit, execution).await {
            Ok(result) => (true, result),
            Err(_) => (
                true,
                Err(CallError::timeout(format!("attempt exceeded {:?}", limit))),
            ),
        }
    }

    async fn credential(&self) -> Result<Option<Credential>, CallError> {
        match &self.credentials {
            Some(supplier) => supplier.credential().await.map(Some),
            None => Ok(None),
        }
    }

    fn fallback(&self, operation: &OperationClass) -> &Arc<dyn FallbackHandler> {
        self.fallbacks.get(operation).unwrap_or(&self.default_fallback)
    }

    /// Cancel a queued call; false if it is not waiting in the queue
    pub fn cancel(&self, operation: &OperationClass, call_id: &CallId) -> bool {
        self.limiter.cancel(operation, call_id)
    }

    pub fn circuit_state(&self, service: &ServiceId) -> CircuitState {
        self.breaker.state(service)
    }

    pub fn queue_depth(&self, operation: &OperationClass) -> usize {
        self.limiter.queue_depth(operation)
    }

    /// Admissions in the trailing rate-limit window
    pub fn window_count(&self, operation: &OperationClass) -> u32 {
        self.limiter.current_count(operation)
    }

    /// Idempotency entries currently held
    pub fn idempotency_entries(&self) -> usize {
        self.cache.len()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Capture limiter windows and breaker records
    pub fn snapshot(&self) -> GatewaySnapshot {
        take_snapshot(&self.limiter, &self.breaker, self.clock.as_ref())
    }

    /// Stop background tasks, cancel queued calls and write a final snapshot
    pub async fn shutdown(&self) -> GatewayResult<()> {
        if self.shutdown_tx.send_replace(true) {
            return Ok(());
        }
        info!("Shutting down gateway");

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                error!("Gateway task failed during shutdown: {}", e);
            }
        }

        if let Some(path) = &self.config.runtime.snapshot_path {
            self.snapshot().save(path).await?;
            info!("Final snapshot written to {}", path.display());
        }

        info!("Gateway stopped");
        Ok(())
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Breaker admission held by one attempt
///
/// Tied to the circuit generation it was granted under. Dropped without an
/// outcome (early return, cancelled future), it gives the half-open probe
/// slot back.
struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    service: &'a ServiceId,
    generation: u64,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, service: &'a ServiceId, generation: u64) -> Self {
        Self {
            breaker,
            service,
            generation,
            settled: false,
        }
    }

    fn record(mut self, success: bool) {
        self.settled = true;
        self.breaker.settle(self.service, self.generation, success);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.service, self.generation);
        }
    }
}

enum Claim {
    Owner(PendingGuard),
    Resolved(GatewayResult<CallResponse>),
}

fn finish(
    guard: Option<PendingGuard>,
    result: GatewayResult<CallResponse>,
) -> GatewayResult<CallResponse> {
    if let Some(guard) = guard {
        guard.resolve(&result);
    }
    result
}

fn take_snapshot(limiter: &RateLimiter, breaker: &CircuitBreaker, clock: &dyn Clock) -> GatewaySnapshot {
    GatewaySnapshot {
        taken_at: clock.now(),
        windows: limiter.snapshot(),
        circuits: breaker.snapshot(),
    }
}

async fn run_snapshot_loop(
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    path: PathBuf,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting snapshot loop to {} (interval: {:?})", path.display(), every);

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing has changed since restore.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = take_snapshot(&limiter, &breaker, clock.as_ref());
                if let Err(e) = snapshot.save(&path).await {
                    warn!("Failed to write snapshot to {}: {}", path.display(), e);
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    info!("Snapshot loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::AccountId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingExecutor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CallExecutor for CountingExecutor {
        fn name(&self) -> &str {
            "counting"
        }

        async fn execute(
            &self,
            _call: &CallDescriptor,
            _credential: Option<&Credential>,
        ) -> Result<CallResponse, CallError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(CallResponse::new(serde_json::json!({ "n": n })))
        }
    }

    fn call() -> CallDescriptor {
        CallDescriptor::new(
            OperationClass::new("orderExecution"),
            AccountId::new("acct"),
            "payload",
        )
    }

    #[test]
    fn test_build_requires_runtime() {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
        });
        let build = GatewayBuilder::new(GatewayConfig::default(), executor).build();
        let result = futures_util::FutureExt::now_or_never(build);
        assert!(matches!(result, Some(Err(GatewayError::InternalError(_)))));
    }

    #[tokio::test]
    async fn test_execute_and_shutdown() {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
        });
        let gateway = Gateway::builder(GatewayConfig::default(), executor.clone())
            .build()
            .await
            .unwrap();

        let response = gateway.execute(call()).await.unwrap();
        assert_eq!(response.body["n"], 1);
        assert_eq!(gateway.window_count(&OperationClass::new("orderExecution")), 1);
        assert_eq!(gateway.idempotency_entries(), 1);

        gateway.shutdown().await.unwrap();
        gateway.shutdown().await.unwrap();

        let result = gateway.execute(call()).await;
        assert!(matches!(result, Err(GatewayError::Cancelled { .. })));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }
}
