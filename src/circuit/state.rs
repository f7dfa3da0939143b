//! Circuit breaker state machine for a single service
//!
//! ```text
//!            failures >= threshold
//!            or error rate tripped
//!   CLOSED ─────────────────────────▶ OPEN
//!     ▲                               │  ▲
//!     │ successes >= threshold        │  │ any probe failure
//!     │                   timeout     ▼  │ (timeout *= multiplier)
//!     └──────────────────────────  HALF_OPEN
//! ```
//!
//! [`CircuitRecord`] holds no lock; the breaker registry serializes access.
//! Every transition bumps the record's generation. Outcomes and releases carry
//! the generation their call was admitted under and are ignored once the
//! circuit has moved on.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::elapsed;
use crate::config::CircuitBreakerConfig;

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// One outcome in the rolling window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSample {
    pub at: DateTime<Utc>,
    pub success: bool,
}

/// State change produced by an acquire or an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Breaker state of one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// Length of the current open period
    pub open_timeout_ms: u64,
    samples: VecDeque<OutcomeSample>,
    #[serde(default)]
    generation: u64,
    #[serde(skip)]
    probes_in_flight: u32,
}

impl CircuitRecord {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            open_timeout_ms: config.timeout_ms,
            samples: VecDeque::new(),
            generation: 0,
            probes_in_flight: 0,
        }
    }

    /// Incremented on every state transition
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn probes_in_flight(&self) -> u32 {
        self.probes_in_flight
    }

    /// Samples currently in the rolling window
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Failure percentage over the rolling window
    pub fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|s| !s.success).count();
        failures as f64 * 100.0 / self.samples.len() as f64
    }

    /// Ask permission for one call
    ///
    /// An open circuit whose timeout elapsed moves to half-open here. While
    /// half-open, at most `half_open_max_requests` probes are in flight; each
    /// granted probe must be settled by [`record`](Self::record) or
    /// [`release`](Self::release).
    pub fn try_acquire(
        &mut self,
        config: &CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) -> (bool, Option<Transition>) {
        let mut transition = None;

        if self.state == CircuitState::Open {
            let opened_at = self.opened_at.unwrap_or(now);
            if elapsed(opened_at, now) < self.open_timeout() {
                return (false, None);
            }
            transition = Some(self.enter(CircuitState::HalfOpen));
            self.consecutive_successes = 0;
            self.probes_in_flight = 0;
        }

        match self.state {
            CircuitState::Closed => (true, transition),
            CircuitState::HalfOpen => {
                if self.probes_in_flight < config.half_open_max_requests {
                    self.probes_in_flight += 1;
                    (true, transition)
                } else {
                    (false, transition)
                }
            }
            CircuitState::Open => (false, transition),
        }
    }

    /// Give back a probe slot without an outcome
    pub fn release(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
        }
    }

    /// [`release`](Self::release) for a call admitted under `generation`
    pub fn release_from(&mut self, generation: u64) {
        if generation == self.generation {
            self.release();
        }
    }

    /// [`record`](Self::record) for a call admitted under `generation`
    ///
    /// A call admitted before the last transition says nothing about the
    /// current state (a slow call from before an outage must not count as a
    /// probe), so its outcome is dropped.
    pub fn record_from(
        &mut self,
        config: &CircuitBreakerConfig,
        generation: u64,
        success: bool,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        if generation != self.generation {
            return None;
        }
        self.record(config, success, now)
    }

    /// Record the outcome of a call
    pub fn record(
        &mut self,
        config: &CircuitBreakerConfig,
        success: bool,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        self.samples.push_back(OutcomeSample { at: now, success });
        self.prune(config, now);

        if success {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        match self.state {
            CircuitState::Closed => {
                if !success && self.should_trip(config) {
                    self.open_timeout_ms = config.timeout_ms;
                    return Some(self.open(now));
                }
                None
            }
            CircuitState::HalfOpen => {
                self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
                if !success {
                    let grown = self.open_timeout_ms as f64 * config.backoff_multiplier;
                    self.open_timeout_ms = (grown as u64).min(config.max_timeout_ms);
                    return Some(self.open(now));
                }
                if self.consecutive_successes >= config.success_threshold {
                    return Some(self.close(config));
                }
                None
            }
            // Late outcomes of calls admitted before the circuit opened.
            CircuitState::Open => None,
        }
    }

    /// Drop samples older than the rolling window
    pub fn prune(&mut self, config: &CircuitBreakerConfig, now: DateTime<Utc>) {
        let window = config.rolling_window();
        while let Some(oldest) = self.samples.front() {
            if elapsed(oldest.at, now) >= window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn should_trip(&self, config: &CircuitBreakerConfig) -> bool {
        if self.consecutive_failures >= config.failure_threshold {
            return true;
        }
        self.samples.len() >= config.volume_threshold as usize
            && self.error_rate() >= config.error_threshold_percentage
    }

    fn open(&mut self, now: DateTime<Utc>) -> Transition {
        self.opened_at = Some(now);
        self.consecutive_successes = 0;
        self.probes_in_flight = 0;
        self.enter(CircuitState::Open)
    }

    fn close(&mut self, config: &CircuitBreakerConfig) -> Transition {
        self.opened_at = None;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.probes_in_flight = 0;
        self.open_timeout_ms = config.timeout_ms;
        // Failures from before the outage must not re-trip a recovered service.
        self.samples.clear();
        self.enter(CircuitState::Closed)
    }

    fn enter(&mut self, to: CircuitState) -> Transition {
        let from = self.state;
        self.state = to;
        self.generation = self.generation.wrapping_add(1);
        Transition { from, to }
    }
}
