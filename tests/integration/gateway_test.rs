//! Integration tests for Gateway

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ag_gateway::{
    adapters::{CallExecutor, Credential, CredentialSupplier, LastKnownFallback},
    circuit::CircuitState,
    AccountId, CallDescriptor, CallError, CallResponse, CircuitBreakerConfig, Gateway,
    GatewayConfig, GatewayError, OperationClass, OperationConfig, OutcomeKind, Priority,
    RateLimitConfig, RetryConfig, ServiceId,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::time::Instant;

type Scripted = Result<CallResponse, CallError>;

/// Mock venue executor for testing
struct MockExecutor {
    script: Mutex<VecDeque<Scripted>>,
    otherwise: Scripted,
    delay: Duration,
    calls: AtomicU32,
    with_credential: AtomicU32,
}

impl MockExecutor {
    fn new(otherwise: Scripted) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            otherwise,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            with_credential: AtomicU32::new(0),
        }
    }

    fn ok() -> Self {
        Self::new(Ok(CallResponse::new(serde_json::json!({ "status": "ok" }))))
    }

    fn failing(error: CallError) -> Self {
        Self::new(Err(error))
    }

    fn then(self, script: Vec<Scripted>) -> Self {
        *self.script.lock().unwrap() = script.into();
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CallExecutor for MockExecutor {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(
        &self,
        _call: &CallDescriptor,
        credential: Option<&Credential>,
    ) -> Result<CallResponse, CallError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if credential.is_some() {
            self.with_credential.fetch_add(1, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        match next.unwrap_or_else(|| self.otherwise.clone()) {
            Ok(response) => Ok(CallResponse::new(serde_json::json!({
                "call": n,
                "body": response.body,
            }))),
            Err(e) => Err(e),
        }
    }
}

struct CountingCredentials {
    reads: AtomicU32,
}

#[async_trait]
impl CredentialSupplier for CountingCredentials {
    async fn credential(&self) -> Result<Credential, CallError> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credential::new(format!("token-{}", n)))
    }
}

fn op() -> OperationClass {
    OperationClass::new("orderExecution")
}

fn call(payload: &str) -> CallDescriptor {
    CallDescriptor::new(op(), AccountId::new("account-1"), payload)
}

fn config_with(operation: OperationConfig) -> GatewayConfig {
    GatewayConfig::default().with_operation("orderExecution", operation)
}

fn no_retries() -> RetryConfig {
    RetryConfig {
        max_retries: 0,
        ..RetryConfig::default()
    }
}

async fn start(config: GatewayConfig, executor: &Arc<MockExecutor>) -> Arc<Gateway> {
    let gateway = Gateway::builder(config, executor.clone())
        .build()
        .await
        .unwrap();
    Arc::new(gateway)
}

async fn wait_for_queue(gateway: &Gateway, depth: usize) {
    for _ in 0..50 {
        if gateway.queue_depth(&op()) == depth {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("queue never reached depth {}", depth);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_submission_executes_once() {
    let executor = Arc::new(MockExecutor::ok());
    let gateway = start(GatewayConfig::default(), &executor).await;
    let submitted_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap();

    let first = gateway
        .execute(call("buy 10 @ 0.52").with_submitted_at(submitted_at))
        .await
        .unwrap();
    let second = gateway
        .execute(call("buy 10 @ 0.52").with_submitted_at(submitted_at))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(executor.calls(), 1);

    // A different payload is a different intent.
    gateway
        .execute(call("buy 11 @ 0.52").with_submitted_at(submitted_at))
        .await
        .unwrap();
    assert_eq!(executor.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_duplicate_waits_for_original() {
    let executor = Arc::new(MockExecutor::ok().with_delay(Duration::from_millis(200)));
    let gateway = start(GatewayConfig::default(), &executor).await;
    let submitted_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap();

    let (a, b) = tokio::join!(
        gateway.execute(call("sell 5").with_submitted_at(submitted_at)),
        gateway.execute(call("sell 5").with_submitted_at(submitted_at)),
    );

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(executor.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_business_errors_do_not_open_circuit() {
    let executor = Arc::new(MockExecutor::failing(CallError::business_rule(
        "insufficient balance",
    )));
    let gateway = start(GatewayConfig::default(), &executor).await;

    for i in 0..20 {
        let result = gateway.execute(call(&format!("order-{}", i))).await;
        let error = result.unwrap_err();
        assert_eq!(error.kind(), OutcomeKind::Terminal);
    }

    assert_eq!(executor.calls(), 20);
    assert_eq!(
        gateway.circuit_state(&ServiceId::new("orderExecution")),
        CircuitState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn test_call_beyond_safety_buffer_is_queued() {
    let executor = Arc::new(MockExecutor::ok());
    let gateway = start(GatewayConfig::default(), &executor).await;

    for i in 0..45 {
        gateway.execute(call(&format!("order-{}", i))).await.unwrap();
    }
    assert_eq!(gateway.window_count(&op()), 45);

    let started = Instant::now();
    let queued = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.execute(call("order-46")).await })
    };
    wait_for_queue(&gateway, 1).await;
    assert_eq!(executor.calls(), 45);

    // Admitted only once the first admissions are a full 30s old.
    queued.await.unwrap().unwrap();
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(gateway.queue_depth(&op()), 0);
    assert_eq!(executor.calls(), 46);
}

#[tokio::test(start_paused = true)]
async fn test_high_priority_uses_burst_allowance() {
    let executor = Arc::new(MockExecutor::ok());
    let gateway = start(GatewayConfig::default(), &executor).await;

    for i in 0..45 {
        gateway.execute(call(&format!("order-{}", i))).await.unwrap();
    }

    let started = Instant::now();
    gateway
        .execute(call("urgent").with_priority(Priority::new(9)))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(gateway.window_count(&op()), 46);
}

#[tokio::test(start_paused = true)]
async fn test_queued_call_times_out() {
    let mut rate_limit = RateLimitConfig::new(1, Duration::from_secs(30));
    rate_limit.safety_buffer = 1.0;
    let executor = Arc::new(MockExecutor::ok());
    let gateway = start(
        config_with(OperationConfig {
            rate_limit,
            ..OperationConfig::default()
        }),
        &executor,
    )
    .await;

    gateway.execute(call("first")).await.unwrap();

    let started = Instant::now();
    let result = gateway
        .execute(call("second").with_max_wait(Duration::from_millis(5000)))
        .await;
    let waited = started.elapsed();

    match result {
        Err(GatewayError::Timeout { .. }) => {}
        other => panic!("expected queue timeout, got {:?}", other),
    }
    assert!(waited >= Duration::from_millis(5000));
    assert!(waited <= Duration::from_millis(5100));
    assert_eq!(executor.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_errors_are_retried() {
    let executor = Arc::new(MockExecutor::ok().then(vec![
        Err(CallError::from_status(503, "unavailable")),
        Err(CallError::network("connection reset")),
    ]));
    let gateway = start(GatewayConfig::default(), &executor).await;

    let started = Instant::now();
    let response = gateway.execute(call("retry me")).await.unwrap();

    assert_eq!(response.body["call"], 3);
    assert_eq!(executor.calls(), 3);
    // 1s and 2s backoff, each with up to 20% jitter.
    assert!(started.elapsed() >= Duration::from_millis(2400));
    assert_eq!(
        gateway.circuit_state(&ServiceId::new("orderExecution")),
        CircuitState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted() {
    let executor = Arc::new(MockExecutor::failing(CallError::from_status(502, "bad gateway")));
    let gateway = start(GatewayConfig::default(), &executor).await;

    let error = gateway.execute(call("doomed")).await.unwrap_err();
    match &error {
        GatewayError::RetriesExhausted {
            attempts,
            last_error,
            ..
        } => {
            assert_eq!(*attempts, 4);
            assert_eq!(last_error.status, Some(502));
        }
        other => panic!("expected retries exhausted, got {:?}", other),
    }
    assert_eq!(error.kind(), OutcomeKind::Timeout);
    assert_eq!(executor.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_cancels_slow_call() {
    let executor = Arc::new(MockExecutor::ok().with_delay(Duration::from_secs(60)));
    let gateway = start(
        config_with(OperationConfig {
            retry: RetryConfig {
                max_retries: 1,
                attempt_timeout_ms: 1000,
                ..RetryConfig::default()
            },
            ..OperationConfig::default()
        }),
        &executor,
    )
    .await;

    let started = Instant::now();
    let error = gateway.execute(call("slow")).await.unwrap_err();

    match error {
        GatewayError::RetriesExhausted { last_error, .. } => {
            assert_eq!(last_error.kind, ag_gateway::ErrorKind::Timeout);
        }
        other => panic!("expected retries exhausted, got {:?}", other),
    }
    assert_eq!(executor.calls(), 2);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_serves_fallback() {
    let failure = || Err(CallError::from_status(500, "internal"));
    let executor = Arc::new(MockExecutor::ok().then(vec![
        Ok(CallResponse::new(serde_json::json!({ "price": 0.52 }))),
        failure(),
        failure(),
        failure(),
        failure(),
        failure(),
    ]));
    let fallback = Arc::new(LastKnownFallback::new());
    let gateway = Gateway::builder(
        config_with(OperationConfig {
            retry: no_retries(),
            ..OperationConfig::default()
        }),
        executor.clone(),
    )
    .fallback(op(), fallback.clone())
    .build()
    .await
    .unwrap();
    let service = ServiceId::new("orderExecution");

    let fresh = gateway.execute(call("quote-0")).await.unwrap();
    for i in 1..=5 {
        let error = gateway.execute(call(&format!("quote-{}", i))).await.unwrap_err();
        assert_eq!(error.kind(), OutcomeKind::Timeout);
    }
    assert_eq!(gateway.circuit_state(&service), CircuitState::Open);

    // Served from the fallback without reaching the venue.
    let served = gateway.execute(call("quote-6")).await.unwrap();
    assert_eq!(served, fresh);
    assert_eq!(executor.calls(), 6);

    tokio::time::advance(Duration::from_secs(30)).await;
    for i in 7..10 {
        gateway.execute(call(&format!("quote-{}", i))).await.unwrap();
    }
    assert_eq!(gateway.circuit_state(&service), CircuitState::Closed);
    assert_eq!(executor.calls(), 9);
}

#[tokio::test(start_paused = true)]
async fn test_short_circuit_without_fallback_fails_fast() {
    let executor = Arc::new(MockExecutor::failing(CallError::from_status(500, "internal")));
    let gateway = start(
        config_with(OperationConfig {
            retry: no_retries(),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                ..CircuitBreakerConfig::default()
            },
            ..OperationConfig::default()
        }),
        &executor,
    )
    .await;

    for i in 0..2 {
        gateway.execute(call(&format!("c-{}", i))).await.unwrap_err();
    }
    let error = gateway.execute(call("c-2")).await.unwrap_err();
    assert!(error.is_short_circuit());
    assert_eq!(executor.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_queued_call() {
    let mut rate_limit = RateLimitConfig::new(1, Duration::from_secs(30));
    rate_limit.safety_buffer = 1.0;
    let executor = Arc::new(MockExecutor::ok());
    let gateway = start(
        config_with(OperationConfig {
            rate_limit,
            ..OperationConfig::default()
        }),
        &executor,
    )
    .await;
    gateway.execute(call("first")).await.unwrap();

    let waiting = call("second");
    let id = waiting.id;
    let handle = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.execute(waiting).await })
    };
    wait_for_queue(&gateway, 1).await;

    assert!(gateway.cancel(&op(), &id));
    let result = handle.await.unwrap();
    assert!(matches!(result, Err(GatewayError::Cancelled { .. })));
    assert_eq!(gateway.queue_depth(&op()), 0);
    assert_eq!(executor.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_queued_calls() {
    let mut rate_limit = RateLimitConfig::new(1, Duration::from_secs(30));
    rate_limit.safety_buffer = 1.0;
    let executor = Arc::new(MockExecutor::ok());
    let gateway = start(
        config_with(OperationConfig {
            rate_limit,
            ..OperationConfig::default()
        }),
        &executor,
    )
    .await;
    gateway.execute(call("first")).await.unwrap();

    let handle = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.execute(call("second")).await })
    };
    wait_for_queue(&gateway, 1).await;

    gateway.shutdown().await.unwrap();
    let result = handle.await.unwrap();
    assert_eq!(result.unwrap_err().kind(), OutcomeKind::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_backoff_cancels_call() {
    let mut rate_limit = RateLimitConfig::new(1, Duration::from_secs(30));
    rate_limit.safety_buffer = 1.0;
    let executor = Arc::new(
        MockExecutor::ok().then(vec![Err(CallError::network("connection reset"))]),
    );
    let gateway = start(
        config_with(OperationConfig {
            rate_limit,
            ..OperationConfig::default()
        }),
        &executor,
    )
    .await;

    let handle = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.execute(call("backing off")).await })
    };

    // First attempt fails at once; the retry waits out a ~1s backoff.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(executor.calls(), 1);
    gateway.shutdown().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(600), handle)
        .await
        .expect("call must resolve after shutdown")
        .unwrap();
    assert_eq!(result.unwrap_err().kind(), OutcomeKind::Cancelled);
    assert_eq!(executor.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_credentials_read_per_attempt() {
    let executor = Arc::new(
        MockExecutor::ok().then(vec![Err(CallError::from_status(503, "unavailable"))]),
    );
    let credentials = Arc::new(CountingCredentials {
        reads: AtomicU32::new(0),
    });
    let gateway = Gateway::builder(GatewayConfig::default(), executor.clone())
        .credentials(credentials.clone())
        .build()
        .await
        .unwrap();

    gateway.execute(call("authed")).await.unwrap();
    assert_eq!(credentials.reads.load(Ordering::SeqCst), 2);
    assert_eq!(executor.with_credential.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_with(OperationConfig {
        retry: no_retries(),
        ..OperationConfig::default()
    });
    config.runtime.snapshot_path = Some(dir.path().join("gateway.json"));

    let executor = Arc::new(MockExecutor::ok().then(vec![
        Ok(CallResponse::new(serde_json::Value::Null)),
        Ok(CallResponse::new(serde_json::Value::Null)),
        Ok(CallResponse::new(serde_json::Value::Null)),
        Err(CallError::from_status(500, "internal")),
    ]));
    let gateway = start(config.clone(), &executor).await;
    for i in 0..4 {
        let _ = gateway.execute(call(&format!("s-{}", i))).await;
    }
    gateway.shutdown().await.unwrap();

    let restarted = start(config, &executor).await;
    assert_eq!(restarted.window_count(&op()), 4);
    assert_eq!(
        restarted.circuit_state(&ServiceId::new("orderExecution")),
        CircuitState::Closed
    );
    restarted.shutdown().await.unwrap();
}
