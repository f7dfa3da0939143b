//! Per-service circuit breaker registry
//!
//! One [`CircuitRecord`] per service, created lazily and kept for the life of
//! the process. Each record sits behind its own mutex inside a `DashMap`, so
//! transitions are atomic per service and unrelated services never contend.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::call::ServiceId;
use crate::circuit::state::{CircuitRecord, CircuitState, Transition};
use crate::clock::Clock;
use crate::config::GatewayConfig;

/// Result of asking the breaker whether a call may go out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Call may go out; settle it against `generation`
    Proceed { generation: u64 },
    ShortCircuit,
}

impl BreakerDecision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, BreakerDecision::Proceed { .. })
    }
}

/// Persisted breaker state of one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub service: ServiceId,
    pub record: CircuitRecord,
}

pub struct CircuitBreaker {
    config: Arc<GatewayConfig>,
    clock: Arc<dyn Clock>,
    records: DashMap<ServiceId, Arc<Mutex<CircuitRecord>>>,
}

impl CircuitBreaker {
    pub fn new(config: Arc<GatewayConfig>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            records: DashMap::new(),
        }
    }

    fn record(&self, service: &ServiceId) -> Arc<Mutex<CircuitRecord>> {
        let entry = self.records.entry(service.clone()).or_insert_with(|| {
            debug!("Creating circuit breaker for {}", service);
            Arc::new(Mutex::new(CircuitRecord::new(self.config.service(service))))
        });
        Arc::clone(entry.value())
    }

    /// Decide whether a call to `service` may proceed
    pub fn should_proceed(&self, service: &ServiceId) -> BreakerDecision {
        let config = self.config.service(service);
        let now = self.clock.now();
        let record = self.record(service);
        let mut record = record.lock().unwrap_or_else(|e| e.into_inner());

        let (allowed, transition) = record.try_acquire(config, now);
        if let Some(transition) = transition {
            log_transition(service, transition, &record);
        }

        if allowed {
            BreakerDecision::Proceed {
                generation: record.generation(),
            }
        } else {
            debug!("Short-circuiting call to {} ({})", service, record.state);
            BreakerDecision::ShortCircuit
        }
    }

    /// Record the outcome of a call that was allowed to proceed
    ///
    /// `success` is from the breaker's point of view: a business-rule
    /// rejection is a success because the service answered correctly.
    pub fn record_outcome(&self, service: &ServiceId, success: bool) {
        let config = self.config.service(service);
        let now = self.clock.now();
        let record = self.record(service);
        let mut record = record.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(transition) = record.record(config, success, now) {
            log_transition(service, transition, &record);
        }
    }

    /// Record the outcome of a call admitted under `generation`
    ///
    /// Outcomes of calls admitted before the circuit last changed state are
    /// ignored.
    pub fn settle(&self, service: &ServiceId, generation: u64, success: bool) {
        let config = self.config.service(service);
        let now = self.clock.now();
        let record = self.record(service);
        let mut record = record.lock().unwrap_or_else(|e| e.into_inner());

        let current = record.generation();
        match record.record_from(config, generation, success, now) {
            Some(transition) => log_transition(service, transition, &record),
            None if generation != current => debug!(
                "Ignoring outcome for {} from generation {} (now {})",
                service, generation, current
            ),
            None => {}
        }
    }

    /// Give back a half-open probe slot for a call that never executed
    pub fn release(&self, service: &ServiceId, generation: u64) {
        if let Some(record) = self.records.get(service).map(|r| Arc::clone(r.value())) {
            record
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .release_from(generation);
        }
    }

    /// Current state of a service; unknown services are closed
    pub fn state(&self, service: &ServiceId) -> CircuitState {
        self.records
            .get(service)
            .map(|r| Arc::clone(r.value()))
            .map_or(CircuitState::Closed, |record| {
                record.lock().unwrap_or_else(|e| e.into_inner()).state
            })
    }

    /// Breaker records of every known service
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let records: Vec<(ServiceId, Arc<Mutex<CircuitRecord>>)> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        records
            .into_iter()
            .map(|(service, record)| CircuitSnapshot {
                record: record.lock().unwrap_or_else(|e| e.into_inner()).clone(),
                service,
            })
            .collect()
    }

    /// Load persisted records, pruning samples outside the rolling window
    pub fn restore(&self, snapshots: Vec<CircuitSnapshot>) {
        let now = self.clock.now();
        for CircuitSnapshot { service, mut record } in snapshots {
            let config = self.config.service(&service);
            record.prune(config, now);
            info!("Restored circuit for {} in state {}", service, record.state);
            self.records.insert(service, Arc::new(Mutex::new(record)));
        }
    }
}

fn log_transition(service: &ServiceId, transition: Transition, record: &CircuitRecord) {
    match transition.to {
        CircuitState::Open => warn!(
            "Circuit for {} opened ({} -> OPEN, {} consecutive failures, {:.1}% errors, open for {:?})",
            service,
            transition.from,
            record.consecutive_failures,
            record.error_rate(),
            record.open_timeout()
        ),
        CircuitState::HalfOpen => info!("Circuit for {} half-open, probing", service),
        CircuitState::Closed => info!("Circuit for {} closed", service),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{CircuitBreakerConfig, OperationConfig};
    use chrono::Utc;
    use std::time::Duration;

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let breaker = CircuitBreaker::new(Arc::new(GatewayConfig::default()), clock.clone());
        (breaker, clock)
    }

    #[test]
    fn test_full_cycle() {
        let (breaker, clock) = breaker();
        let service = ServiceId::new("orderExecution");

        for _ in 0..5 {
            assert!(breaker.should_proceed(&service).is_proceed());
            breaker.record_outcome(&service, false);
        }
        assert_eq!(breaker.state(&service), CircuitState::Open);
        assert_eq!(breaker.should_proceed(&service), BreakerDecision::ShortCircuit);

        clock.advance(Duration::from_secs(30));
        assert!(breaker.should_proceed(&service).is_proceed());
        assert_eq!(breaker.state(&service), CircuitState::HalfOpen);

        breaker.record_outcome(&service, true);
        for _ in 0..2 {
            assert!(breaker.should_proceed(&service).is_proceed());
            breaker.record_outcome(&service, true);
        }
        assert_eq!(breaker.state(&service), CircuitState::Closed);
    }

    #[test]
    fn test_services_are_isolated() {
        let (breaker, _clock) = breaker();
        let failing = ServiceId::new("orderExecution");
        let healthy = ServiceId::new("historyRetrieval");

        for _ in 0..5 {
            breaker.record_outcome(&failing, false);
        }
        assert_eq!(breaker.should_proceed(&failing), BreakerDecision::ShortCircuit);
        assert!(breaker.should_proceed(&healthy).is_proceed());
    }

    #[test]
    fn test_service_specific_config() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = GatewayConfig::default().with_operation(
            "marketData",
            OperationConfig {
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 2,
                    ..CircuitBreakerConfig::default()
                },
                ..OperationConfig::default()
            },
        );
        let breaker = CircuitBreaker::new(Arc::new(config), clock);
        let service = ServiceId::new("marketData");

        breaker.record_outcome(&service, false);
        breaker.record_outcome(&service, false);
        assert_eq!(breaker.state(&service), CircuitState::Open);
    }

    #[test]
    fn test_snapshot_restore_keeps_open_state() {
        let (breaker, clock) = breaker();
        let service = ServiceId::new("orderExecution");
        for _ in 0..5 {
            breaker.record_outcome(&service, false);
        }

        let restored = CircuitBreaker::new(Arc::new(GatewayConfig::default()), clock.clone());
        restored.restore(breaker.snapshot());
        assert_eq!(restored.state(&service), CircuitState::Open);
        assert_eq!(restored.should_proceed(&service), BreakerDecision::ShortCircuit);

        clock.advance(Duration::from_secs(30));
        assert!(restored.should_proceed(&service).is_proceed());
    }

    #[test]
    fn test_late_outcome_does_not_widen_probe_budget() {
        let (breaker, clock) = breaker();
        let service = ServiceId::new("orderExecution");

        let BreakerDecision::Proceed { generation: slow } = breaker.should_proceed(&service) else {
            panic!("closed circuit must let the call through");
        };
        for _ in 0..5 {
            breaker.record_outcome(&service, false);
        }

        clock.advance(Duration::from_secs(30));
        for _ in 0..3 {
            assert!(breaker.should_proceed(&service).is_proceed());
        }
        assert_eq!(breaker.state(&service), CircuitState::HalfOpen);

        breaker.settle(&service, slow, true);
        breaker.release(&service, slow);
        assert_eq!(breaker.should_proceed(&service), BreakerDecision::ShortCircuit);

        breaker.settle(&service, slow, false);
        assert_eq!(breaker.state(&service), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_concurrent_outcomes_are_linearizable() {
        let (breaker, _clock) = breaker();
        let breaker = Arc::new(breaker);
        let service = ServiceId::new("orderExecution");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let breaker = Arc::clone(&breaker);
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    breaker.record_outcome(&service, true);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot[0].record.consecutive_successes, 200);
        assert_eq!(breaker.state(&service), CircuitState::Closed);
    }
}
