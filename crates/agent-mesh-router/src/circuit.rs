//! Per-instance circuit breaker.
//!
//! A plain state machine, not a synchronized object: instances live inside
//! the load balancer's lock, which keeps the strict one-lock-at-a-time
//! policy of the router's hot path.
//!
//! Closed: failures count up; at the threshold the circuit opens.
//! Open: calls are rejected until the timeout elapses, then one probe
//! call is admitted (half-open). Half-open: the configured number of
//! consecutive successes closes the circuit; any failure reopens it.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use agent_mesh_core::config::CircuitBreakerConfig;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Calls fail fast.
    Open,
    /// Probing whether the instance recovered.
    HalfOpen,
}

/// Per-instance breaker state machine.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    /// In half-open, only one probe call may be outstanding.
    probe_outstanding: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            probe_outstanding: false,
        }
    }

    /// Current state, advancing open -> half-open once the timeout elapsed.
    pub fn state(&mut self) -> CircuitState {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= self.config.timeout {
                    self.state = CircuitState::HalfOpen;
                    self.success_count = 0;
                    self.probe_outstanding = false;
                }
            }
        }
        self.state
    }

    /// Whether a call may be attempted right now. In half-open exactly one
    /// probe is admitted until its verdict arrives.
    pub fn allow_request(&mut self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.probe_outstanding {
                    false
                } else {
                    self.probe_outstanding = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state() {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.probe_outstanding = false;
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                    self.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        match self.state() {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.trip();
                }
            }
            CircuitState::HalfOpen => {
                self.probe_outstanding = false;
                self.trip();
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.failure_count = 0;
        self.success_count = 0;
        self.probe_outstanding = false;
    }
}
