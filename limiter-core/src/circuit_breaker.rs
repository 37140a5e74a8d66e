//! Circuit breaker around the shared store.
//!
//! Grounded in `tower-circuitbreaker::Circuit`
//! (`joshrotenberg-tower-resilience`): a private state struct behind a
//! lock, a `transition_to` that resets counters and emits a `tracing`
//! event plus a gauge, adapted from that crate's sliding-window
//! failure-rate policy to this spec's consecutive-failure-count
//! policy.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding for the `circuit_breaker_state` gauge:
    /// `0=closed,1=half,2=open`.
    pub fn as_metric_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_millis(60_000),
            success_threshold: 2,
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    next_attempt_time: Option<Instant>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            next_attempt_time: None,
        }
    }
}

/// One circuit breaker instance, named after the resource it guards
/// (`"bucket_store"`, `"policy_store"`, `"override_store"`).
pub struct CircuitBreaker {
    resource: &'static str,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(resource: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            resource,
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call should be allowed through right now. A call
    /// allowed through OPEN transitions the breaker to HALF_OPEN as a
    /// side effect.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let ready = inner
                    .next_attempt_time
                    .map(|t| Instant::now() >= t)
                    .unwrap_or(false);
                if ready {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
        crate::telemetry::record_circuit_breaker_state(self.resource, inner.state.as_metric_value());
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
        crate::telemetry::record_circuit_breaker_state(self.resource, inner.state.as_metric_value());
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        tracing::info!(resource = self.resource, from = from.label(), to = to.label(), "circuit breaker transition");
        crate::telemetry::record_circuit_breaker_transition(self.resource, from.label(), to.label());

        inner.state = to;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.next_attempt_time = if to == CircuitState::Open {
            Some(Instant::now() + self.config.timeout)
        } else {
            None
        };
    }
}
