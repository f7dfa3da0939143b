//! Rate limiting implementation
//!
//! Admission per operation class is decided against a [`SlidingWindowCounter`].
//! Calls that do not fit wait in a [`PriorityRequestQueue`] which a background
//! loop drains on a fixed tick. State is sharded by operation class; each
//! class has its own lock and no lock is held across an await point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::call::{CallDescriptor, CallId, OperationClass};
use crate::clock::Clock;
use crate::config::{GatewayConfig, RateLimitConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::ratelimit::queue::{PriorityRequestQueue, QueueResolution};
use crate::ratelimit::window::{SlidingWindowCounter, WindowBucket};

/// Result of asking the limiter to admit a call
#[derive(Debug)]
pub enum Admission {
    /// Call may proceed now
    Allowed {
        /// Admitted through the burst allowance
        via_burst: bool,
    },
    /// Call is queued; await the ticket
    Queued {
        /// 1-based position in the queue at enqueue time
        position: usize,
        /// Time until the oldest window bucket expires
        wait_hint: Duration,
        /// Resolves when the call is admitted, times out or is cancelled
        ticket: QueueTicket,
    },
}

/// Handle on a queued call
#[derive(Debug)]
pub struct QueueTicket {
    operation: OperationClass,
    call_id: CallId,
    receiver: oneshot::Receiver<QueueResolution>,
}

impl QueueTicket {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Wait for the dequeue loop to resolve the entry
    ///
    /// # Returns
    /// * `Ok(via_burst)` - Call was admitted
    /// * `Err(GatewayError::Timeout)` - Deadline elapsed while queued
    /// * `Err(GatewayError::Cancelled)` - Entry was cancelled or the limiter shut down
    pub async fn wait(self) -> GatewayResult<bool> {
        match self.receiver.await {
            Ok(QueueResolution::Admitted { via_burst }) => Ok(via_burst),
            Ok(QueueResolution::TimedOut { waited }) => Err(GatewayError::Timeout {
                operation: self.operation.to_string(),
                waited,
            }),
            Ok(QueueResolution::Cancelled) | Err(_) => Err(GatewayError::Cancelled {
                operation: self.operation.to_string(),
            }),
        }
    }
}

/// Persisted window state of one operation class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub operation: OperationClass,
    pub buckets: Vec<WindowBucket>,
}

struct LimiterState {
    config: RateLimitConfig,
    counter: SlidingWindowCounter,
    queue: PriorityRequestQueue,
}

impl LimiterState {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            counter: SlidingWindowCounter::from_config(&config),
            queue: PriorityRequestQueue::new(config.queue_capacity),
            config,
        }
    }

    /// Resolve expired entries, then admit queued calls from the head while
    /// the window has room. Returns the number of entries resolved.
    fn dispatch(&mut self, operation: &OperationClass, now: DateTime<Utc>) -> usize {
        let mut resolved = 0;

        for entry in self.queue.drain_expired(now) {
            if entry.is_abandoned() {
                debug!("Dropping abandoned queue entry {} for {}", entry.call.id, operation);
                continue;
            }
            let waited = entry.waited(now);
            warn!(
                "Queued call {} for {} timed out after {:?}",
                entry.call.id, operation, waited
            );
            entry.resolve(QueueResolution::TimedOut { waited });
            resolved += 1;
        }

        while let Some(head) = self.queue.peek() {
            if head.is_abandoned() {
                if let Some(entry) = self.queue.pop() {
                    debug!("Dropping abandoned queue entry {} for {}", entry.call.id, operation);
                }
                continue;
            }
            let call = Arc::clone(&head.call);
            match admit_into_window(&self.config, &mut self.counter, &call, now) {
                Some(via_burst) => {
                    if let Some(entry) = self.queue.pop() {
                        debug!(
                            "Admitted queued call {} for {} after {:?}",
                            call.id,
                            operation,
                            entry.waited(now)
                        );
                        if entry.resolve(QueueResolution::Admitted { via_burst }) {
                            resolved += 1;
                        }
                    }
                }
                None => {
                    if let Some(head) = self.queue.peek_mut() {
                        head.retry_count += 1;
                    }
                    break;
                }
            }
        }

        resolved
    }
}

/// Admit into the window if the limits allow it, recording the admission
fn admit_into_window(
    config: &RateLimitConfig,
    counter: &mut SlidingWindowCounter,
    call: &CallDescriptor,
    now: DateTime<Utc>,
) -> Option<bool> {
    let current = counter.current_count(now);

    if current < config.effective_limit() {
        counter.record(now);
        return Some(false);
    }

    if current < config.burst_ceiling() && call.priority.value() >= config.burst_priority_threshold
    {
        counter.record(now);
        return Some(true);
    }

    None
}

/// Rate limiter for outbound calls, partitioned by operation class
pub struct RateLimiter {
    config: Arc<GatewayConfig>,
    clock: Arc<dyn Clock>,
    states: DashMap<OperationClass, Arc<Mutex<LimiterState>>>,
    closed: AtomicBool,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(config: Arc<GatewayConfig>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            states: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// True once [`cancel_all`](Self::cancel_all) has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn state(&self, operation: &OperationClass) -> Arc<Mutex<LimiterState>> {
        let entry = self.states.entry(operation.clone()).or_insert_with(|| {
            let config = self.config.operation(operation).rate_limit.clone();
            debug!(
                "Creating limiter for {}: {} requests per {:?}",
                operation,
                config.requests,
                config.window()
            );
            Arc::new(Mutex::new(LimiterState::new(config)))
        });
        Arc::clone(entry.value())
    }

    fn lock<'a>(
        state: &'a Mutex<LimiterState>,
        operation: &OperationClass,
    ) -> GatewayResult<MutexGuard<'a, LimiterState>> {
        state.lock().map_err(|e| {
            GatewayError::InternalError(format!("Limiter lock poisoned for {}: {}", operation, e))
        })
    }

    /// Admit, queue or reject a call
    ///
    /// # Returns
    /// * `Ok(Admission::Allowed)` - Call may proceed now
    /// * `Ok(Admission::Queued)` - Call must await the ticket
    /// * `Err(GatewayError::QueueFull)` - Queue for the operation class is at capacity
    /// * `Err(GatewayError::Cancelled)` - The limiter has shut down
    pub fn admit(&self, call: &Arc<CallDescriptor>) -> GatewayResult<Admission> {
        let operation = &call.operation_class;
        let now = self.clock.now();
        let state = self.state(operation);
        let mut state = Self::lock(&state, operation)?;

        // Checked under the lock: `cancel_all` sets the flag before draining,
        // so nothing can be queued behind its back.
        if self.is_closed() {
            debug!("Limiter closed, cancelling call {} for {}", call.id, operation);
            return Err(GatewayError::Cancelled {
                operation: operation.to_string(),
            });
        }

        // Waiters that already fit go first so a newcomer cannot jump the line.
        if !state.queue.is_empty() {
            state.dispatch(operation, now);
        }

        let may_bypass_queue = state
            .queue
            .peek()
            .map_or(true, |head| call.priority > head.call.priority);

        if may_bypass_queue {
            let state = &mut *state;
            if let Some(via_burst) = admit_into_window(&state.config, &mut state.counter, call, now)
            {
                if via_burst {
                    debug!("Admitted call {} for {} via burst allowance", call.id, operation);
                }
                return Ok(Admission::Allowed { via_burst });
            }
        }

        let wait_hint = state.counter.time_until_slot(now);
        match state.queue.push(Arc::clone(call), now) {
            Ok((position, receiver)) => {
                debug!(
                    "Queued call {} for {} at position {} (slot in {:?})",
                    call.id, operation, position, wait_hint
                );
                Ok(Admission::Queued {
                    position,
                    wait_hint,
                    ticket: QueueTicket {
                        operation: operation.clone(),
                        call_id: call.id,
                        receiver,
                    },
                })
            }
            Err(full) => {
                warn!(
                    "Rate limit queue full for {} (capacity {}), rejecting call {}",
                    operation, full.capacity, call.id
                );
                Err(GatewayError::QueueFull {
                    operation: operation.to_string(),
                    capacity: full.capacity,
                })
            }
        }
    }

    /// Cancel a queued call; false if it is not queued
    pub fn cancel(&self, operation: &OperationClass, call_id: &CallId) -> bool {
        let Some(state) = self.states.get(operation).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        match state.queue.remove(call_id) {
            Some(entry) => {
                info!("Cancelled queued call {} for {}", call_id, operation);
                entry.resolve(QueueResolution::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Run one dequeue pass over every operation class
    pub fn dispatch_all(&self) -> usize {
        let now = self.clock.now();
        let states: Vec<(OperationClass, Arc<Mutex<LimiterState>>)> = self
            .states
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut resolved = 0;
        for (operation, state) in states {
            match Self::lock(&state, &operation) {
                Ok(mut state) => resolved += state.dispatch(&operation, now),
                Err(e) => error!("Skipping dequeue for {}: {}", operation, e),
            }
        }
        resolved
    }

    /// Close the limiter and resolve every queued call as cancelled
    pub fn cancel_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let states: Vec<Arc<Mutex<LimiterState>>> =
            self.states.iter().map(|e| Arc::clone(e.value())).collect();

        let mut cancelled = 0;
        for state in states {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            for entry in state.queue.drain_all() {
                entry.resolve(QueueResolution::Cancelled);
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Admissions in the trailing window for an operation class
    pub fn current_count(&self, operation: &OperationClass) -> u32 {
        let now = self.clock.now();
        self.states
            .get(operation)
            .map(|s| Arc::clone(s.value()))
            .map_or(0, |state| {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                state.counter.current_count(now)
            })
    }

    /// Calls waiting in the queue of an operation class
    pub fn queue_depth(&self, operation: &OperationClass) -> usize {
        self.states
            .get(operation)
            .map(|s| Arc::clone(s.value()))
            .map_or(0, |state| {
                state.lock().unwrap_or_else(|e| e.into_inner()).queue.len()
            })
    }

    /// Window buckets of every operation class
    pub fn snapshot(&self) -> Vec<WindowSnapshot> {
        let states: Vec<(OperationClass, Arc<Mutex<LimiterState>>)> = self
            .states
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        states
            .into_iter()
            .map(|(operation, state)| {
                let state = state.lock().unwrap_or_else(|e| e.into_inner());
                WindowSnapshot {
                    operation,
                    buckets: state.counter.buckets(),
                }
            })
            .collect()
    }

    /// Load persisted window buckets, dropping expired ones
    pub fn restore(&self, snapshots: Vec<WindowSnapshot>) {
        let now = self.clock.now();
        for snapshot in snapshots {
            let state = self.state(&snapshot.operation);
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.counter.restore(snapshot.buckets, now);
            debug!(
                "Restored window for {}: {} live admissions",
                snapshot.operation,
                state.counter.current_count(now)
            );
        }
    }

    /// Drain queues on a fixed tick until shutdown is signalled
    pub async fn run_dequeue_loop(
        self: Arc<Self>,
        tick: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting dequeue loop (tick: {:?})", tick);

        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.dispatch_all();
                }
                _ = shutdown.changed() => break,
            }
        }

        let cancelled = self.cancel_all();
        info!("Dequeue loop stopped, {} queued calls cancelled", cancelled);
    }
}
