//! Time source for the gateway
//!
//! All windows, deadlines and breaker timeouts are computed from a [`Clock`].
//! Comparisons go through [`elapsed`] so a clock that steps backwards yields a
//! zero duration instead of a negative one.

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Port for time abstraction
pub trait Clock: Send + Sync {
    /// Current time according to this clock
    fn now(&self) -> DateTime<Utc>;

    /// Clock name, for debugging
    fn name(&self) -> &str {
        "Clock"
    }
}

impl std::fmt::Debug for dyn Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Production clock
///
/// Wall time is sampled once at construction; afterwards the clock advances
/// with the monotonic Tokio clock, so it never jumps with NTP adjustments and
/// follows virtual time in paused-runtime tests.
#[derive(Debug, Clone)]
pub struct SystemClock {
    anchor: DateTime<Utc>,
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor: Utc::now(),
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        after(self.anchor, self.origin.elapsed())
    }

    fn name(&self) -> &str {
        "SystemClock"
    }
}

/// Manually driven clock for deterministic tests
#[derive(Debug)]
pub struct ManualClock {
    current: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: RwLock::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = after(*current, by);
    }

    /// Set the clock to an absolute time (may go backwards)
    pub fn set(&self, to: DateTime<Utc>) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    fn name(&self) -> &str {
        "ManualClock"
    }
}

/// Time elapsed from `earlier` to `later`, zero if `later` is not after it
pub fn elapsed(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}

/// `ts + by`, saturating at the maximum representable time
pub fn after(ts: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| ts.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Milliseconds since the Unix epoch, clamped at zero
pub fn epoch_millis(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_millis().max(0) as u64
}
