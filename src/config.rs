//! Gateway configuration
//!
//! Tunables are grouped per operation class. Any operation class without its
//! own entry uses [`GatewayConfig::defaults`]. Every value has a safe default
//! and [`GatewayConfig::sanitize`] replaces out-of-bounds values with those
//! defaults, so a bad config file degrades to known behaviour instead of
//! failing at runtime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::call::{OperationClass, ServiceId};
use crate::error::{ErrorKind, GatewayError, GatewayResult};

/// Environment variable naming the config file used by [`GatewayConfig::from_env`]
pub const CONFIG_ENV_VAR: &str = "AG_GATEWAY_CONFIG";

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Tunables for operation classes without a dedicated entry
    #[serde(default)]
    pub defaults: OperationConfig,

    /// Per operation class overrides, keyed by operation class name.
    /// Sections omitted inside an entry take the built-in defaults.
    #[serde(default)]
    pub operations: HashMap<String, OperationConfig>,

    /// Background task settings
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Tunables for one operation class
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationConfig {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub idempotency: IdempotencyConfig,
}

/// Sliding-window rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Venue's published request limit per window
    #[serde(default = "default_requests")]
    pub requests: u32,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Extra requests usable by high-priority calls
    #[serde(default = "default_burst_allowance")]
    pub burst_allowance: u32,

    /// Fraction of `requests` used before queueing starts
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer: f64,

    /// Number of buckets the window is split into
    #[serde(default = "default_sub_window_count")]
    pub sub_window_count: u32,

    /// Minimum priority allowed to use the burst allowance
    #[serde(default = "default_burst_priority_threshold")]
    pub burst_priority_threshold: u8,

    /// Maximum queued calls per operation class
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl RateLimitConfig {
    /// Create a configuration with the given limit and window, other fields default
    pub fn new(requests: u32, window: Duration) -> Self {
        Self {
            requests,
            window_ms: window.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Get window as Duration
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Limit after applying the safety buffer, never below one call
    pub fn effective_limit(&self) -> u32 {
        ((f64::from(self.requests) * self.safety_buffer).floor() as u32).max(1)
    }

    /// Hard ceiling reachable through the burst allowance
    pub fn burst_ceiling(&self) -> u32 {
        self.requests.saturating_add(self.burst_allowance)
    }

    fn sanitize(mut self, scope: &str) -> Self {
        if self.requests == 0 {
            warn!("{}: rate_limit.requests must be positive, using default", scope);
            self.requests = default_requests();
        }
        if self.window_ms == 0 {
            warn!("{}: rate_limit.window_ms must be positive, using default", scope);
            self.window_ms = default_window_ms();
        }
        if !(self.safety_buffer > 0.0 && self.safety_buffer <= 1.0) {
            warn!(
                "{}: rate_limit.safety_buffer {} outside (0, 1], using default",
                scope, self.safety_buffer
            );
            self.safety_buffer = default_safety_buffer();
        }
        if self.sub_window_count == 0 || u64::from(self.sub_window_count) > self.window_ms {
            warn!(
                "{}: rate_limit.sub_window_count {} invalid for a {}ms window, using default",
                scope, self.sub_window_count, self.window_ms
            );
            let window_ms = u32::try_from(self.window_ms).unwrap_or(u32::MAX);
            self.sub_window_count = default_sub_window_count().min(window_ms).max(1);
        }
        if self.burst_priority_threshold > 10 {
            warn!(
                "{}: rate_limit.burst_priority_threshold {} above 10, using default",
                scope, self.burst_priority_threshold
            );
            self.burst_priority_threshold = default_burst_priority_threshold();
        }
        if self.queue_capacity == 0 {
            warn!("{}: rate_limit.queue_capacity must be positive, using default", scope);
            self.queue_capacity = default_queue_capacity();
        }
        if f64::from(self.requests) * self.safety_buffer < 1.0 {
            warn!(
                "{}: rate_limit safety_buffer {} leaves no room in {} requests, admitting 1 per window",
                scope, self.safety_buffer, self.requests
            );
        }
        self
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: default_requests(),
            window_ms: default_window_ms(),
            burst_allowance: default_burst_allowance(),
            safety_buffer: default_safety_buffer(),
            sub_window_count: default_sub_window_count(),
            burst_priority_threshold: default_burst_priority_threshold(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the circuit
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Initial open period in milliseconds
    #[serde(default = "default_breaker_timeout_ms")]
    pub timeout_ms: u64,

    /// Concurrent probe calls allowed while half-open
    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,

    /// Samples required before the error rate is considered
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: u32,

    /// Error rate (percent) that opens the circuit
    #[serde(default = "default_error_threshold_percentage")]
    pub error_threshold_percentage: f64,

    /// Rolling sample window in milliseconds
    #[serde(default = "default_rolling_window_ms")]
    pub rolling_window_ms: u64,

    /// Growth factor of the open period after a failed probe
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound of the open period in milliseconds
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
}

impl CircuitBreakerConfig {
    /// Get initial open period as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Get open period cap as Duration
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    /// Get rolling window as Duration
    pub fn rolling_window(&self) -> Duration {
        Duration::from_millis(self.rolling_window_ms)
    }

    fn sanitize(mut self, scope: &str) -> Self {
        if self.failure_threshold == 0 {
            warn!("{}: circuit_breaker.failure_threshold must be positive, using default", scope);
            self.failure_threshold = default_failure_threshold();
        }
        if self.success_threshold == 0 {
            warn!("{}: circuit_breaker.success_threshold must be positive, using default", scope);
            self.success_threshold = default_success_threshold();
        }
        if self.timeout_ms == 0 {
            warn!("{}: circuit_breaker.timeout_ms must be positive, using default", scope);
            self.timeout_ms = default_breaker_timeout_ms();
        }
        if self.half_open_max_requests == 0 {
            warn!(
                "{}: circuit_breaker.half_open_max_requests must be positive, using default",
                scope
            );
            self.half_open_max_requests = default_half_open_max_requests();
        }
        if self.volume_threshold == 0 {
            warn!("{}: circuit_breaker.volume_threshold must be positive, using default", scope);
            self.volume_threshold = default_volume_threshold();
        }
        if !(self.error_threshold_percentage > 0.0 && self.error_threshold_percentage <= 100.0) {
            warn!(
                "{}: circuit_breaker.error_threshold_percentage {} outside (0, 100], using default",
                scope, self.error_threshold_percentage
            );
            self.error_threshold_percentage = default_error_threshold_percentage();
        }
        if self.rolling_window_ms == 0 {
            warn!("{}: circuit_breaker.rolling_window_ms must be positive, using default", scope);
            self.rolling_window_ms = default_rolling_window_ms();
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            warn!(
                "{}: circuit_breaker.backoff_multiplier {} below 1, using default",
                scope, self.backoff_multiplier
            );
            self.backoff_multiplier = default_backoff_multiplier();
        }
        if self.max_timeout_ms < self.timeout_ms {
            warn!(
                "{}: circuit_breaker.max_timeout_ms {} below timeout_ms, raising to {}",
                scope, self.max_timeout_ms, self.timeout_ms
            );
            self.max_timeout_ms = self.timeout_ms;
        }
        self
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_breaker_timeout_ms(),
            half_open_max_requests: default_half_open_max_requests(),
            volume_threshold: default_volume_threshold(),
            error_threshold_percentage: default_error_threshold_percentage(),
            rolling_window_ms: default_rolling_window_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_timeout_ms: default_max_timeout_ms(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Delay cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Relative jitter applied to each delay, 0.0 to 1.0
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Error kinds worth retrying; everything else is terminal
    #[serde(default = "default_retryable_error_kinds")]
    pub retryable_error_kinds: Vec<ErrorKind>,

    /// Upper bound for a single execution attempt in milliseconds
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Check if an error kind is on the retry allow-list
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable_error_kinds.contains(&kind)
    }

    fn sanitize(mut self, scope: &str) -> Self {
        if self.base_delay_ms == 0 {
            warn!("{}: retry.base_delay_ms must be positive, using default", scope);
            self.base_delay_ms = default_base_delay_ms();
        }
        if self.max_delay_ms < self.base_delay_ms {
            warn!(
                "{}: retry.max_delay_ms {} below base delay, raising to {}",
                scope, self.max_delay_ms, self.base_delay_ms
            );
            self.max_delay_ms = self.base_delay_ms;
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            warn!(
                "{}: retry.jitter_factor {} outside [0, 1], using default",
                scope, self.jitter_factor
            );
            self.jitter_factor = default_jitter_factor();
        }
        if self.attempt_timeout_ms == 0 {
            warn!("{}: retry.attempt_timeout_ms must be positive, using default", scope);
            self.attempt_timeout_ms = default_attempt_timeout_ms();
        }
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
            retryable_error_kinds: default_retryable_error_kinds(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

/// Idempotency cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Collapse duplicate submissions into one execution
    #[serde(default = "default_idempotency_enabled")]
    pub enabled: bool,

    /// Lifetime of pending and successful entries in milliseconds
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// Time bucket folded into the key, in milliseconds
    #[serde(default = "default_resolution_window_ms")]
    pub resolution_window_ms: u64,

    /// Lifetime of failed entries in milliseconds
    #[serde(default = "default_failure_ttl_ms")]
    pub failure_ttl_ms: u64,

    /// How long a duplicate waits for an in-flight original, in milliseconds
    #[serde(default = "default_duplicate_wait_ms")]
    pub duplicate_wait_ms: u64,
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn resolution_window(&self) -> Duration {
        Duration::from_millis(self.resolution_window_ms)
    }

    pub fn failure_ttl(&self) -> Duration {
        Duration::from_millis(self.failure_ttl_ms)
    }

    pub fn duplicate_wait(&self) -> Duration {
        Duration::from_millis(self.duplicate_wait_ms)
    }

    fn sanitize(mut self, scope: &str) -> Self {
        if self.ttl_ms == 0 {
            warn!("{}: idempotency.ttl_ms must be positive, using default", scope);
            self.ttl_ms = default_ttl_ms();
        }
        if self.resolution_window_ms == 0 {
            warn!(
                "{}: idempotency.resolution_window_ms must be positive, using default",
                scope
            );
            self.resolution_window_ms = default_resolution_window_ms();
        }
        if self.failure_ttl_ms > self.ttl_ms {
            warn!(
                "{}: idempotency.failure_ttl_ms {} above ttl, lowering to {}",
                scope, self.failure_ttl_ms, self.ttl_ms
            );
            self.failure_ttl_ms = self.ttl_ms;
        }
        self
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: default_idempotency_enabled(),
            ttl_ms: default_ttl_ms(),
            resolution_window_ms: default_resolution_window_ms(),
            failure_ttl_ms: default_failure_ttl_ms(),
            duplicate_wait_ms: default_duplicate_wait_ms(),
        }
    }
}

/// Background task configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Dequeue loop tick in milliseconds
    #[serde(default = "default_dequeue_tick_ms")]
    pub dequeue_tick_ms: u64,

    /// Idempotency sweep interval in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// File used to persist limiter and breaker state, if any
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,

    /// Snapshot interval in milliseconds
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
}

impl RuntimeConfig {
    pub fn dequeue_tick(&self) -> Duration {
        Duration::from_millis(self.dequeue_tick_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    fn sanitize(mut self) -> Self {
        if self.dequeue_tick_ms == 0 {
            warn!("runtime.dequeue_tick_ms must be positive, using default");
            self.dequeue_tick_ms = default_dequeue_tick_ms();
        }
        if self.sweep_interval_ms == 0 {
            warn!("runtime.sweep_interval_ms must be positive, using default");
            self.sweep_interval_ms = default_sweep_interval_ms();
        }
        if self.snapshot_interval_ms == 0 {
            warn!("runtime.snapshot_interval_ms must be positive, using default");
            self.snapshot_interval_ms = default_snapshot_interval_ms();
        }
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dequeue_tick_ms: default_dequeue_tick_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            snapshot_path: None,
            snapshot_interval_ms: default_snapshot_interval_ms(),
        }
    }
}

impl OperationConfig {
    fn sanitize(self, scope: &str) -> Self {
        Self {
            rate_limit: self.rate_limit.sanitize(scope),
            circuit_breaker: self.circuit_breaker.sanitize(scope),
            retry: self.retry.sanitize(scope),
            idempotency: self.idempotency.sanitize(scope),
        }
    }
}

impl GatewayConfig {
    /// Add or replace the configuration of one operation class
    pub fn with_operation(mut self, operation: impl Into<String>, config: OperationConfig) -> Self {
        self.operations.insert(operation.into(), config);
        self
    }

    /// Configuration that applies to an operation class
    pub fn operation(&self, operation: &OperationClass) -> &OperationConfig {
        self.operations
            .get(operation.as_str())
            .unwrap_or(&self.defaults)
    }

    /// Breaker configuration for a service
    ///
    /// Services are looked up in the same table as operation classes, so a
    /// service that groups several classes can carry its own entry.
    pub fn service(&self, service: &ServiceId) -> &CircuitBreakerConfig {
        &self
            .operations
            .get(service.as_str())
            .unwrap_or(&self.defaults)
            .circuit_breaker
    }

    /// Replace out-of-bounds values with defaults
    pub fn sanitize(self) -> Self {
        Self {
            defaults: self.defaults.sanitize("defaults"),
            operations: self
                .operations
                .into_iter()
                .map(|(name, config)| {
                    let config = config.sanitize(&name);
                    (name, config)
                })
                .collect(),
            runtime: self.runtime.sanitize(),
        }
    }

    /// Parse and sanitize a YAML document
    pub fn from_yaml(yaml: &str) -> GatewayResult<Self> {
        let config: GatewayConfig = serde_yaml::from_str(yaml)?;
        Ok(config.sanitize())
    }

    /// Parse and sanitize a JSON document
    pub fn from_json(json: &str) -> GatewayResult<Self> {
        let config: GatewayConfig = serde_json::from_str(json)
            .map_err(|e| GatewayError::ConfigError(e.to_string()))?;
        Ok(config.sanitize())
    }

    /// Load from a file; `.json` files are parsed as JSON, anything else as YAML
    pub fn from_file(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        info!("Loading gateway configuration from {}", path.display());

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    /// Load from the file named by `AG_GATEWAY_CONFIG` (after reading `.env`),
    /// falling back to defaults when the variable is unset
    pub fn from_env() -> GatewayResult<Self> {
        dotenv::dotenv().ok();
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) => Self::from_file(path),
            Err(_) => {
                info!("{} not set, using default gateway configuration", CONFIG_ENV_VAR);
                Ok(Self::default())
            }
        }
    }
}

// Default value functions
fn default_requests() -> u32 {
    50
}

fn default_window_ms() -> u64 {
    30_000
}

fn default_burst_allowance() -> u32 {
    5
}

fn default_safety_buffer() -> f64 {
    0.9
}

fn default_sub_window_count() -> u32 {
    10
}

fn default_burst_priority_threshold() -> u8 {
    8
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_breaker_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_requests() -> u32 {
    3
}

fn default_volume_threshold() -> u32 {
    10
}

fn default_error_threshold_percentage() -> f64 {
    50.0
}

fn default_rolling_window_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_timeout_ms() -> u64 {
    300_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn default_retryable_error_kinds() -> Vec<ErrorKind> {
    vec![
        ErrorKind::Network,
        ErrorKind::Timeout,
        ErrorKind::ServerError,
        ErrorKind::RateLimited,
    ]
}

fn default_attempt_timeout_ms() -> u64 {
    30_000
}

fn default_idempotency_enabled() -> bool {
    true
}

fn default_ttl_ms() -> u64 {
    3_600_000
}

fn default_resolution_window_ms() -> u64 {
    60_000
}

fn default_failure_ttl_ms() -> u64 {
    30_000
}

fn default_duplicate_wait_ms() -> u64 {
    5_000
}

fn default_dequeue_tick_ms() -> u64 {
    100
}

fn default_sweep_interval_ms() -> u64 {
    300_000
}

fn default_snapshot_interval_ms() -> u64 {
    60_000
}
