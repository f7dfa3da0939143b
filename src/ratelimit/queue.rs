//! Bounded priority queue of calls waiting for rate-limit admission
//!
//! Ordering is (priority desc, enqueue sequence asc). The sequence number is
//! assigned on first enqueue and kept across re-insertion, so calls of equal
//! priority leave in strict FIFO order. Entries are indexed by [`CallId`],
//! which makes cancellation an O(log n) heap removal.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use priority_queue::PriorityQueue;
use tokio::sync::oneshot;

use crate::call::{CallDescriptor, CallId, Priority};
use crate::clock::{after, elapsed};

/// How a queued entry left the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueResolution {
    /// Admitted by the limiter
    Admitted {
        /// Admitted through the burst allowance
        via_burst: bool,
    },
    /// Deadline elapsed before admission
    TimedOut {
        /// Time spent queued
        waited: Duration,
    },
    /// Removed by the caller or at shutdown
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueRank(Priority, Reverse<u64>);

/// A call waiting in the queue
#[derive(Debug)]
pub struct QueuedEntry {
    /// The waiting call
    pub call: Arc<CallDescriptor>,
    /// Time of first enqueue
    pub enqueued_at: DateTime<Utc>,
    /// Time after which the entry resolves as timed out
    pub deadline: Option<DateTime<Utc>>,
    /// Times the entry reached the head without being admittable
    pub retry_count: u32,
    seq: u64,
    responder: oneshot::Sender<QueueResolution>,
}

impl QueuedEntry {
    fn rank(&self) -> QueueRank {
        QueueRank(self.call.priority, Reverse(self.seq))
    }

    /// Check if the deadline has elapsed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map_or(false, |deadline| now >= deadline)
    }

    /// Check if the waiter has gone away
    pub fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }

    /// Time spent in the queue so far
    pub fn waited(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.enqueued_at, now)
    }

    /// Hand the resolution to the waiter; false if nobody is listening
    pub fn resolve(self, resolution: QueueResolution) -> bool {
        self.responder.send(resolution).is_ok()
    }
}

/// Error returned when the queue is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull {
    pub capacity: usize,
}

/// Bounded priority queue for one operation class
#[derive(Debug)]
pub struct PriorityRequestQueue {
    heap: PriorityQueue<CallId, QueueRank>,
    entries: HashMap<CallId, QueuedEntry>,
    capacity: usize,
    next_seq: u64,
}

impl PriorityRequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: PriorityQueue::new(),
            entries: HashMap::new(),
            capacity,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.entries.contains_key(id)
    }

    /// Enqueue a call
    ///
    /// Returns the 1-based queue position and the receiver the resolution
    /// will be delivered on.
    pub fn push(
        &mut self,
        call: Arc<CallDescriptor>,
        now: DateTime<Utc>,
    ) -> Result<(usize, oneshot::Receiver<QueueResolution>), QueueFull> {
        // Re-submitting a call that is still queued supersedes the old entry.
        if let Some(stale) = self.remove(&call.id) {
            stale.resolve(QueueResolution::Cancelled);
        }
        if self.is_full() {
            return Err(QueueFull {
                capacity: self.capacity,
            });
        }

        let (responder, receiver) = oneshot::channel();
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = QueuedEntry {
            deadline: call.max_wait.map(|wait| after(now, wait)),
            call,
            enqueued_at: now,
            retry_count: 0,
            seq,
            responder,
        };
        let rank = entry.rank();
        let position = self.heap.iter().filter(|(_, r)| **r > rank).count() + 1;

        self.heap.push(entry.call.id, rank);
        self.entries.insert(entry.call.id, entry);

        Ok((position, receiver))
    }

    /// Highest-priority, earliest-enqueued entry
    pub fn peek(&self) -> Option<&QueuedEntry> {
        self.heap.peek().and_then(|(id, _)| self.entries.get(id))
    }

    /// Mutable access to the head entry
    pub fn peek_mut(&mut self) -> Option<&mut QueuedEntry> {
        let id = *self.heap.peek()?.0;
        self.entries.get_mut(&id)
    }

    /// Remove and return the head entry
    pub fn pop(&mut self) -> Option<QueuedEntry> {
        let (id, _) = self.heap.pop()?;
        self.entries.remove(&id)
    }

    /// Put a previously popped entry back at its original rank
    pub fn reinsert(&mut self, entry: QueuedEntry) {
        self.heap.push(entry.call.id, entry.rank());
        self.entries.insert(entry.call.id, entry);
    }

    /// Remove an entry by call ID
    pub fn remove(&mut self, id: &CallId) -> Option<QueuedEntry> {
        self.heap.remove(id)?;
        self.entries.remove(id)
    }

    /// Remove entries whose deadline elapsed or whose waiter went away
    pub fn drain_expired(&mut self, now: DateTime<Utc>) -> Vec<QueuedEntry> {
        let stale: Vec<CallId> = self
            .entries
            .values()
            .filter(|e| e.is_expired(now) || e.is_abandoned())
            .map(|e| e.call.id)
            .collect();

        stale.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Remove every entry
    pub fn drain_all(&mut self) -> Vec<QueuedEntry> {
        self.heap.clear();
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}
