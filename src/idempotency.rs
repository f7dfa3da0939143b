//! Idempotency cache
//!
//! Collapses repeated submissions of the same intent into one execution. The
//! key is a SHA-256 over the operation class, account, payload fingerprint and
//! a coarse time bucket, so retries within one bucket share a key while a
//! request one bucket later is a new intent.
//!
//! Only a successful outcome is authoritative. A failed outcome is delivered
//! to duplicates that were waiting on it, but the next lookup executes again.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::call::{AccountId, CallDescriptor, CallId, CallResponse, OperationClass};
use crate::clock::{after, elapsed, Clock};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};

const KEY_DOMAIN: &[u8] = b"ag-gateway/idempotency/v1";

/// Deterministic fingerprint of one call intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey([u8; 32]);

impl IdempotencyKey {
    /// Derive the key of a call for the given resolution window
    pub fn derive(call: &CallDescriptor, resolution_window: Duration) -> Self {
        let window_ms = (resolution_window.as_millis() as i64).max(1);
        let bucket = call.submitted_at.timestamp_millis().div_euclid(window_ms);

        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN);
        // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
        for field in [
            call.operation_class.as_str().as_bytes(),
            call.account_id.as_str().as_bytes(),
            call.payload_fingerprint.as_slice(),
        ] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field);
        }
        hasher.update(bucket.to_be_bytes());

        Self(to_array(hasher.finalize().as_slice()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// State of a cache entry
#[derive(Debug, Clone)]
pub enum IdempotencyOutcome {
    Pending,
    Success(CallResponse),
    Failure(GatewayError),
}

impl IdempotencyOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, IdempotencyOutcome::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestAttributes {
    operation: OperationClass,
    account: AccountId,
    payload_digest: [u8; 32],
}

impl RequestAttributes {
    fn of(call: &CallDescriptor) -> Self {
        Self {
            operation: call.operation_class.clone(),
            account: call.account_id.clone(),
            payload_digest: to_array(Sha256::digest(&call.payload_fingerprint).as_slice()),
        }
    }
}

fn to_array(digest: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(digest);
    out
}

type Resolution = Option<GatewayResult<CallResponse>>;

#[derive(Debug)]
struct CacheEntry {
    attributes: RequestAttributes,
    outcome: IdempotencyOutcome,
    owner: CallId,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    ttl: Duration,
    failure_ttl: Duration,
    notify: watch::Sender<Resolution>,
}

/// Result of [`IdempotencyCache::get_or_create`]
#[derive(Debug)]
pub enum CacheLookup {
    /// A previous execution succeeded
    Hit(CallResponse),
    /// An identical call is executing
    Pending(PendingWait),
    /// The caller owns a new pending entry and must execute
    Created(PendingGuard),
}

/// Handle for waiting on an in-flight duplicate
#[derive(Debug)]
pub struct PendingWait {
    key: IdempotencyKey,
    receiver: watch::Receiver<Resolution>,
}

impl PendingWait {
    pub fn key(&self) -> IdempotencyKey {
        self.key
    }

    /// Wait up to `limit` for the original call to resolve
    ///
    /// # Returns
    /// * `Some(outcome)` - Outcome of the original, or `InFlight` when `limit` elapsed
    /// * `None` - The original was abandoned; look the key up again
    pub async fn wait(mut self, limit: Duration) -> Option<GatewayResult<CallResponse>> {
        let waited = tokio::time::timeout(limit, self.receiver.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(resolution)) => resolution.clone(),
            Ok(Err(_)) => None,
            Err(_) => Some(Err(GatewayError::InFlight {
                key: self.key.to_hex(),
            })),
        }
    }
}

/// Ownership of a pending entry
///
/// Dropping the guard without resolving removes the entry and releases any
/// waiting duplicates, so an abandoned execution never leaves a stuck key.
#[derive(Debug)]
pub struct PendingGuard {
    key: IdempotencyKey,
    owner: CallId,
    cache: Arc<IdempotencyCache>,
    settled: bool,
}

impl PendingGuard {
    pub fn key(&self) -> IdempotencyKey {
        self.key
    }

    /// Record the outcome of the execution
    pub fn resolve(mut self, outcome: &GatewayResult<CallResponse>) {
        self.settled = true;
        self.cache.resolve(&self.key, self.owner, outcome);
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.cache.abandon(&self.key, self.owner);
        }
    }
}

/// Time-bounded map from idempotency key to outcome
#[derive(Debug)]
pub struct IdempotencyCache {
    config: Arc<GatewayConfig>,
    clock: Arc<dyn Clock>,
    entries: DashMap<IdempotencyKey, CacheEntry>,
}

impl IdempotencyCache {
    pub fn new(config: Arc<GatewayConfig>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Derive the key of a call using its operation's resolution window
    pub fn key_for(&self, call: &CallDescriptor) -> IdempotencyKey {
        let config = &self.config.operation(&call.operation_class).idempotency;
        IdempotencyKey::derive(call, config.resolution_window())
    }

    /// Current outcome stored for a key
    pub fn outcome(&self, key: &IdempotencyKey) -> Option<IdempotencyOutcome> {
        self.entries.get(key).map(|e| e.outcome.clone())
    }

    /// Look up a call, creating a pending entry when none applies
    ///
    /// # Returns
    /// * `Err(GatewayError::KeyCollision)` - The key is held by a different request
    pub fn get_or_create(
        self: &Arc<Self>,
        call: &CallDescriptor,
    ) -> GatewayResult<CacheLookup> {
        let key = self.key_for(call);
        let attributes = RequestAttributes::of(call);
        let now = self.clock.now();

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get();
                let live = entry.expires_at > now;

                if live && entry.attributes != attributes {
                    error!(
                        "Idempotency key collision on {}: held by {}/{}, requested by {}/{}",
                        key,
                        entry.attributes.operation,
                        entry.attributes.account,
                        attributes.operation,
                        attributes.account
                    );
                    return Err(GatewayError::KeyCollision { key: key.to_hex() });
                }

                if live {
                    match &entry.outcome {
                        IdempotencyOutcome::Success(response) => {
                            debug!("Idempotency hit for {} on {}", call.id, key);
                            return Ok(CacheLookup::Hit(response.clone()));
                        }
                        IdempotencyOutcome::Pending => {
                            debug!("Call {} is a duplicate of in-flight {}", call.id, entry.owner);
                            return Ok(CacheLookup::Pending(PendingWait {
                                key,
                                receiver: entry.notify.subscribe(),
                            }));
                        }
                        IdempotencyOutcome::Failure(_) => {}
                    }
                } else if entry.outcome.is_pending() {
                    warn!("Replacing expired pending entry {} held by {}", key, entry.owner);
                }

                occupied.insert(self.pending_entry(call, attributes, now));
                Ok(CacheLookup::Created(self.guard(key, call.id)))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.pending_entry(call, attributes, now));
                Ok(CacheLookup::Created(self.guard(key, call.id)))
            }
        }
    }

    /// Store the final outcome of the execution owned by `owner`
    pub fn resolve(
        &self,
        key: &IdempotencyKey,
        owner: CallId,
        outcome: &GatewayResult<CallResponse>,
    ) {
        let now = self.clock.now();
        let Some(mut entry) = self.entries.get_mut(key) else {
            debug!("Idempotency entry {} evicted before resolution", key);
            return;
        };
        if entry.owner != owner {
            debug!("Idempotency entry {} taken over, dropping stale resolution", key);
            return;
        }

        match outcome {
            Ok(response) => {
                entry.outcome = IdempotencyOutcome::Success(response.clone());
                entry.expires_at = after(now, entry.ttl);
            }
            Err(e) => {
                entry.outcome = IdempotencyOutcome::Failure(e.clone());
                entry.expires_at = after(now, entry.failure_ttl);
            }
        }
        entry.notify.send_replace(Some(outcome.clone()));
    }

    fn abandon(&self, key: &IdempotencyKey, owner: CallId) {
        let removed = self
            .entries
            .remove_if(key, |_, e| e.owner == owner && e.outcome.is_pending());
        if removed.is_some() {
            info!("Released abandoned idempotency entry {}", key);
        }
    }

    /// Remove expired entries; returns the number removed
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!("Evicted {} expired idempotency entries", evicted);
        }
        evicted
    }

    /// Evict expired entries on a fixed interval until shutdown is signalled
    pub async fn run_sweep_loop(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting idempotency sweep (interval: {:?})", every);

        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evict_expired();
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Idempotency sweep stopped");
    }

    fn pending_entry(
        &self,
        call: &CallDescriptor,
        attributes: RequestAttributes,
        now: DateTime<Utc>,
    ) -> CacheEntry {
        let config = &self.config.operation(&call.operation_class).idempotency;
        let (notify, _) = watch::channel(None);
        CacheEntry {
            attributes,
            outcome: IdempotencyOutcome::Pending,
            owner: call.id,
            created_at: now,
            expires_at: after(now, config.ttl()),
            ttl: config.ttl(),
            failure_ttl: config.failure_ttl(),
            notify,
        }
    }

    fn guard(self: &Arc<Self>, key: IdempotencyKey, owner: CallId) -> PendingGuard {
        PendingGuard {
            key,
            owner,
            cache: Arc::clone(self),
            settled: false,
        }
    }

    /// Age of an entry, for diagnostics
    pub fn entry_age(&self, key: &IdempotencyKey) -> Option<Duration> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .map(|e| elapsed(e.created_at, now))
    }
}
