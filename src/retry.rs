//! Retry classification and exponential backoff
//!
//! The delay after failed attempt `n` (1-based) is
//! `min(base * 2^(n-1), max)` with uniform jitter of `± delay * jitter_factor`,
//! clamped to `[0, max]`. A rate-limit error carrying a retry-after hint waits
//! at least that long.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::call::OperationClass;
use crate::config::{GatewayConfig, RetryConfig};
use crate::error::{CallError, ErrorKind};

/// Whether an error is worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

pub struct RetryEngine {
    config: Arc<GatewayConfig>,
}

impl RetryEngine {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        Self { config }
    }

    /// Classify an error against the operation's allow-list
    pub fn classify(&self, operation: &OperationClass, error: &CallError) -> ErrorClass {
        classify(&self.config.operation(operation).retry, error)
    }

    /// Decide on the next step after failed attempt `attempt` (1-based)
    pub fn next_action(
        &self,
        operation: &OperationClass,
        attempt: u32,
        error: &CallError,
    ) -> RetryDecision {
        self.next_action_with(operation, attempt, error, &mut rand::thread_rng())
    }

    /// [`next_action`](Self::next_action) with a caller-supplied RNG
    pub fn next_action_with<R: Rng>(
        &self,
        operation: &OperationClass,
        attempt: u32,
        error: &CallError,
        rng: &mut R,
    ) -> RetryDecision {
        let config = &self.config.operation(operation).retry;

        if attempt > config.max_retries || classify(config, error) == ErrorClass::Terminal {
            return RetryDecision::GiveUp;
        }

        let mut delay = backoff_delay(config, attempt, rng.gen_range(-1.0..=1.0));
        if error.kind == ErrorKind::RateLimited {
            if let Some(hint) = error.retry_after {
                delay = delay.max(hint).min(config.max_delay());
            }
        }
        RetryDecision::Retry(delay)
    }
}

pub fn classify(config: &RetryConfig, error: &CallError) -> ErrorClass {
    if config.is_retryable(error.kind) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Terminal
    }
}

/// Backoff delay for failed attempt `attempt`
///
/// `jitter` is a uniform sample in `[-1, 1]` scaled by the configured factor.
pub fn backoff_delay(config: &RetryConfig, attempt: u32, jitter: f64) -> Duration {
    let max_ms = config.max_delay_ms as f64;
    let exponent = attempt.saturating_sub(1).min(63) as i32;
    let raw = (config.base_delay_ms as f64 * 2f64.powi(exponent)).min(max_ms);

    let jittered = raw + raw * config.jitter_factor * jitter.clamp(-1.0, 1.0);
    Duration::from_millis(jittered.clamp(0.0, max_ms).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn engine() -> RetryEngine {
        RetryEngine::new(Arc::new(GatewayConfig::default()))
    }

    fn op() -> OperationClass {
        OperationClass::new("orderExecution")
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let config = RetryConfig::default();
        let delays: Vec<u64> = (1..=8)
            .map(|attempt| backoff_delay(&config, attempt, 0.0).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 32000, 60000, 60000]);
    }

    #[test]
    fn test_attempt_five_jitter_extremes() {
        let config = RetryConfig::default();
        assert_eq!(backoff_delay(&config, 5, -1.0), Duration::from_millis(12800));
        assert_eq!(backoff_delay(&config, 5, 1.0), Duration::from_millis(19200));
    }

    #[test]
    fn test_terminal_errors_give_up() {
        let engine = engine();
        let error = CallError::business_rule("insufficient balance");

        assert_eq!(engine.classify(&op(), &error), ErrorClass::Terminal);
        assert_eq!(engine.next_action(&op(), 1, &error), RetryDecision::GiveUp);
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let engine = engine();
        let error = CallError::from_status(503, "unavailable");

        for attempt in 1..=3 {
            assert!(matches!(
                engine.next_action(&op(), attempt, &error),
                RetryDecision::Retry(_)
            ));
        }
        assert_eq!(engine.next_action(&op(), 4, &error), RetryDecision::GiveUp);
    }

    #[test]
    fn test_retry_after_hint_raises_delay() {
        let engine = engine();
        let error = CallError::from_status(429, "slow down")
            .with_retry_after(Duration::from_secs(10));
        let mut rng = StdRng::seed_from_u64(7);

        match engine.next_action_with(&op(), 1, &error, &mut rng) {
            RetryDecision::Retry(delay) => assert_eq!(delay, Duration::from_secs(10)),
            other => panic!("expected retry, got {:?}", other),
        }

        let huge = CallError::from_status(429, "slow down")
            .with_retry_after(Duration::from_secs(600));
        match engine.next_action_with(&op(), 1, &huge, &mut rng) {
            RetryDecision::Retry(delay) => assert_eq!(delay, Duration::from_secs(60)),
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_classification_follows_allow_list() {
        let engine = engine();
        assert_eq!(
            engine.classify(&op(), &CallError::network("connection reset")),
            ErrorClass::Retryable
        );
        assert_eq!(
            engine.classify(&op(), &CallError::from_status(500, "boom")),
            ErrorClass::Retryable
        );
        assert_eq!(
            engine.classify(&op(), &CallError::from_status(422, "bad quantity")),
            ErrorClass::Terminal
        );
        assert_eq!(
            engine.classify(&op(), &CallError::from_status(401, "expired token")),
            ErrorClass::Terminal
        );
    }

    proptest! {
        #[test]
        fn prop_attempt_five_within_jitter_band(jitter in -1.0f64..=1.0) {
            let delay = backoff_delay(&RetryConfig::default(), 5, jitter).as_millis() as u64;
            prop_assert!((12_800..=19_200).contains(&delay));
        }

        #[test]
        fn prop_delay_never_exceeds_cap(attempt in 1u32..200, seed in any::<u64>()) {
            let config = RetryConfig {
                max_retries: 200,
                ..RetryConfig::default()
            };
            let mut rng = StdRng::seed_from_u64(seed);
            let delay = backoff_delay(&config, attempt, rng.gen_range(-1.0..=1.0));
            prop_assert!(delay <= Duration::from_millis(60_000));
        }
    }
}
