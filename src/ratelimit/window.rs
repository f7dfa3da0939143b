//! Bucketed sliding-window request counter
//!
//! The window is split into `sub_window_count` buckets aligned to the Unix
//! epoch. A bucket stays live until its end is a full window old, so every
//! admission it holds is counted for at least `window`. The sum of live counts
//! never undercounts the trailing window; it may overcount by up to one bucket
//! width. Updates are O(1) and queries O(buckets).

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{after, elapsed, epoch_millis};
use crate::config::RateLimitConfig;

/// One bucket of the window ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBucket {
    /// Start of the bucket
    pub bucket_start: DateTime<Utc>,
    /// Admissions recorded in the bucket
    pub count: u32,
}

/// Sliding-window counter for one operation class
#[derive(Debug, Clone)]
pub struct SlidingWindowCounter {
    window: Duration,
    bucket_width: Duration,
    buckets: VecDeque<WindowBucket>,
}

impl SlidingWindowCounter {
    /// Create a counter over `window` split into `sub_window_count` buckets
    pub fn new(window: Duration, sub_window_count: u32) -> Self {
        let count = u64::from(sub_window_count.max(1));
        let width_ms = (window.as_millis() as u64 / count).max(1);

        Self {
            window,
            bucket_width: Duration::from_millis(width_ms),
            buckets: VecDeque::with_capacity(count as usize + 1),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.window(), config.sub_window_count)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn bucket_width(&self) -> Duration {
        self.bucket_width
    }

    /// Admissions in the trailing window
    pub fn current_count(&mut self, now: DateTime<Utc>) -> u32 {
        self.evict_expired(now);
        self.buckets.iter().map(|b| b.count).sum()
    }

    /// Record one admission in the active bucket
    pub fn record(&mut self, now: DateTime<Utc>) {
        self.evict_expired(now);

        if let Some(active) = self.buckets.back_mut() {
            // A clock that stepped backwards keeps counting into the newest
            // bucket rather than creating one out of order.
            if now < after(active.bucket_start, self.bucket_width) {
                active.count = active.count.saturating_add(1);
                return;
            }
        }

        self.buckets.push_back(WindowBucket {
            bucket_start: self.align(now),
            count: 1,
        });
    }

    /// Time until the oldest live bucket leaves the window
    pub fn time_until_slot(&mut self, now: DateTime<Utc>) -> Duration {
        self.evict_expired(now);
        self.buckets
            .front()
            .map(|oldest| elapsed(now, self.expiry(oldest)))
            .unwrap_or(Duration::ZERO)
    }

    /// Live buckets, oldest first
    pub fn buckets(&self) -> Vec<WindowBucket> {
        self.buckets.iter().copied().collect()
    }

    /// Replace the buckets with persisted ones, dropping anything expired
    pub fn restore(&mut self, mut buckets: Vec<WindowBucket>, now: DateTime<Utc>) {
        buckets.sort_by_key(|b| b.bucket_start);
        self.buckets = buckets.into_iter().filter(|b| b.count > 0).collect();
        self.evict_expired(now);
    }

    /// Instant the last admission a bucket can hold is a full window old
    fn expiry(&self, bucket: &WindowBucket) -> DateTime<Utc> {
        after(bucket.bucket_start, self.window + self.bucket_width)
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) {
        while let Some(oldest) = self.buckets.front() {
            if now >= self.expiry(oldest) {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn align(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let width_ms = self.bucket_width.as_millis() as u64;
        let start_ms = epoch_millis(now) / width_ms * width_ms;
        Utc.timestamp_millis_opt(start_ms as i64)
            .single()
            .unwrap_or(now)
    }
}
