//! Circuit breaker guarding one downstream endpoint

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::SharedClock;
use crate::config::CircuitConfig;
use crate::monitor::MetricsSink;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub endpoint: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    half_open_in_flight: u32,
    changed_at: DateTime<Utc>,
}

type Transition = (CircuitState, CircuitState);

pub struct CircuitBreaker {
    endpoint: String,
    config: CircuitConfig,
    clock: SharedClock,
    metrics: Option<Arc<dyn MetricsSink>>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: CircuitConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            endpoint: endpoint.into(),
            config,
            clock,
            metrics: None,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                half_open_in_flight: 0,
                changed_at: now,
            }),
        }
    }

    /// Report state changes to a metrics sink
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Current state, applying the open timeout if it has elapsed
    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.expire_open(&mut inner);
            (inner.state, transition)
        };
        self.announce(transition);
        state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let (snapshot, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.expire_open(&mut inner);
            (
                CircuitSnapshot {
                    endpoint: self.endpoint.clone(),
                    state: inner.state,
                    consecutive_failures: inner.failures,
                    consecutive_successes: inner.successes,
                    changed_at: inner.changed_at,
                },
                transition,
            )
        };
        self.announce(transition);
        snapshot
    }

    /// Run `f` if the circuit admits it.
    ///
    /// Only transient failures count against the circuit; a permanent
    /// (validation or permission) failure proves the endpoint is answering.
    pub fn call<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.admit()?;
        let result = f();
        let transition = {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
            match &result {
                Ok(_) | Err(Error::Permanent(_)) => self.on_success(&mut inner),
                Err(e) if e.is_retryable() => self.on_failure(&mut inner),
                Err(_) => None,
            }
        };
        self.announce(transition);
        result
    }

    fn admit(&self) -> Result<()> {
        let (admitted, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.expire_open(&mut inner);
            let admitted = match inner.state {
                CircuitState::Closed => true,
                CircuitState::Open => false,
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight < self.config.half_open_max_calls {
                        inner.half_open_in_flight += 1;
                        true
                    } else {
                        false
                    }
                }
            };
            (admitted, transition)
        };
        self.announce(transition);

        if admitted {
            Ok(())
        } else {
            tracing::debug!(endpoint = %self.endpoint, "Circuit rejected call");
            Err(Error::CircuitOpen {
                endpoint: self.endpoint.clone(),
            })
        }
    }

    fn expire_open(&self, inner: &mut BreakerState) -> Option<Transition> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let elapsed = self.clock.now() - inner.changed_at;
        let timeout = chrono::Duration::from_std(self.config.open_timeout()).unwrap_or(chrono::Duration::MAX);
        if elapsed >= timeout {
            Some(self.move_to(inner, CircuitState::HalfOpen))
        } else {
            None
        }
    }

    fn on_success(&self, inner: &mut BreakerState) -> Option<Transition> {
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    Some(self.move_to(inner, CircuitState::Closed))
                } else {
                    None
                }
            }
            // a call admitted before the circuit opened finished late
            CircuitState::Open => None,
        }
    }

    fn on_failure(&self, inner: &mut BreakerState) -> Option<Transition> {
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    Some(self.move_to(inner, CircuitState::Open))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => Some(self.move_to(inner, CircuitState::Open)),
            CircuitState::Open => None,
        }
    }

    fn move_to(&self, inner: &mut BreakerState, next: CircuitState) -> Transition {
        let from = inner.state;
        inner.state = next;
        inner.failures = 0;
        inner.successes = 0;
        inner.half_open_in_flight = 0;
        inner.changed_at = self.clock.now();
        (from, next)
    }

    fn announce(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };
        match to {
            CircuitState::Open => tracing::warn!(endpoint = %self.endpoint, %from, %to, "Circuit opened"),
            _ => tracing::info!(endpoint = %self.endpoint, %from, %to, "Circuit state changed"),
        }
        if let Some(metrics) = &self.metrics {
            let report = AssertUnwindSafe(|| metrics.circuit_transition(&self.endpoint, from, to));
            if catch_unwind(report).is_err() {
                tracing::warn!(endpoint = %self.endpoint, "Metrics sink panicked on circuit transition");
            }
        }
    }
}
