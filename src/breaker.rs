//! Per-endpoint circuit breaker
//!
//! Guards the upstream feed with a CLOSED / OPEN / HALF_OPEN state machine
//! per endpoint. Consecutive failures trip the circuit; after the open
//! timeout a bounded number of trial requests probe recovery.

use crate::config::BreakerSettings;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Circuit state for one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { in_flight_trials: u32 },
}

#[derive(Debug)]
struct EndpointBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
}

impl EndpointBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
        }
    }
}

/// Serializable view of one endpoint's breaker for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub endpoint: String,
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    /// Seconds the circuit has been open, when open
    pub open_for_secs: Option<u64>,
}

/// Per-endpoint circuit breakers behind one map
pub struct CircuitBreaker {
    settings: BreakerSettings,
    endpoints: DashMap<String, EndpointBreaker>,
    transitions: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            endpoints: DashMap::new(),
            transitions: AtomicU64::new(0),
        }
    }

    /// Whether a request for `endpoint` may dispatch upstream.
    ///
    /// OPEN circuits flip to HALF_OPEN once the open timeout has elapsed;
    /// HALF_OPEN admits up to `half_open_max_trials` concurrent probes.
    pub fn admit(&self, endpoint: &str) -> bool {
        let mut breaker = self
            .endpoints
            .entry(endpoint.to_string())
            .or_insert_with(EndpointBreaker::new);

        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.settings.open_timeout() {
                    breaker.state = CircuitState::HalfOpen {
                        in_flight_trials: 1,
                    };
                    breaker.half_open_successes = 0;
                    self.transitions.fetch_add(1, Ordering::Relaxed);
                    info!(endpoint, "circuit half-open, probing upstream");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen { in_flight_trials } => {
                if in_flight_trials < self.settings.half_open_max_trials {
                    breaker.state = CircuitState::HalfOpen {
                        in_flight_trials: in_flight_trials + 1,
                    };
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful upstream call
    pub fn record_success(&self, endpoint: &str) {
        let mut breaker = self
            .endpoints
            .entry(endpoint.to_string())
            .or_insert_with(EndpointBreaker::new);

        match breaker.state {
            CircuitState::Closed => {
                breaker.consecutive_failures = 0;
            }
            CircuitState::HalfOpen { in_flight_trials } => {
                breaker.half_open_successes += 1;
                breaker.state = CircuitState::HalfOpen {
                    in_flight_trials: in_flight_trials.saturating_sub(1),
                };
                if breaker.half_open_successes >= self.settings.reset_threshold {
                    breaker.state = CircuitState::Closed;
                    breaker.consecutive_failures = 0;
                    breaker.half_open_successes = 0;
                    self.transitions.fetch_add(1, Ordering::Relaxed);
                    info!(endpoint, "circuit closed, upstream recovered");
                }
            }
            CircuitState::Open { .. } => {
                // A straggler from before the trip; the open timeout governs
            }
        }
    }

    /// Record a failed upstream call
    pub fn record_failure(&self, endpoint: &str) {
        let mut breaker = self
            .endpoints
            .entry(endpoint.to_string())
            .or_insert_with(EndpointBreaker::new);

        match breaker.state {
            CircuitState::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.settings.failure_threshold {
                    breaker.state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                    self.transitions.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        endpoint,
                        failures = breaker.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen { .. } => {
                breaker.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                breaker.half_open_successes = 0;
                self.transitions.fetch_add(1, Ordering::Relaxed);
                warn!(endpoint, "trial request failed, circuit re-opened");
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Total state transitions across all endpoints
    pub fn transition_count(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// Current state snapshots for the admin surface
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.endpoints
            .iter()
            .map(|entry| {
                let breaker = entry.value();
                let (state, open_for_secs) = match breaker.state {
                    CircuitState::Closed => ("closed", None),
                    CircuitState::Open { opened_at } => {
                        ("open", Some(opened_at.elapsed().as_secs()))
                    }
                    CircuitState::HalfOpen { .. } => ("half_open", None),
                };
                BreakerSnapshot {
                    endpoint: entry.key().clone(),
                    state,
                    consecutive_failures: breaker.consecutive_failures,
                    half_open_successes: breaker.half_open_successes,
                    open_for_secs,
                }
            })
            .collect()
    }
}
