// =============================================================================
// circuit_breaker.rs: STOP HAMMERING A DEAD REDIS
// =============================================================================
//
// The reconciler runs on a timer whether or not its dependencies are up. If
// Redis or Postgres is down, every pass fails the same way and floods the
// log with the same error every ten minutes, forever.
//
// The breaker counts consecutive failed passes. At the threshold it opens
// and ticks are skipped outright. Once the reset timeout has passed it lets
// one pass through (half-open); enough successes close it again, any failure
// reopens it.
//
// Time comes from `tokio::time::Instant` so tests can fast-forward through
// the cooldown on a paused runtime.
// =============================================================================

use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    last_state_change: Instant,
    total_trips: u64,
}

impl Inner {
    fn transition(&mut self, name: &str, to: CircuitState) {
        info!(name, from = %self.state, to = %to, "Circuit breaker state change");
        self.state = to;
        self.last_state_change = Instant::now();
    }
}

pub struct CircuitBreaker {
    name: String,
    inner: Mutex<Inner>,
    failure_threshold: u32,
    reset_timeout: Duration,
    success_threshold: u32,
}

impl CircuitBreaker {
    /// `failure_threshold` and `success_threshold` are clamped to at least 1.
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        reset_timeout: Duration,
        success_threshold: u32,
    ) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                last_state_change: Instant::now(),
                total_trips: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            success_threshold: success_threshold.max(1),
        }
    }

    /// Whether the next pass may run. An open breaker whose cooldown has
    /// elapsed moves to half-open and answers yes.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.reset_timeout);
                if cooled {
                    inner.half_open_successes = 0;
                    inner.transition(&self.name, CircuitState::HalfOpen);
                }
                cooled
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.success_threshold {
                inner.opened_at = None;
                inner.transition(&self.name, CircuitState::Closed);
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let trip = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if trip {
            warn!(
                name = %self.name,
                failures = inner.consecutive_failures,
                cooldown_secs = self.reset_timeout.as_secs(),
                "Circuit breaker tripped"
            );
            inner.opened_at = Some(Instant::now());
            inner.total_trips += 1;
            inner.transition(&self.name, CircuitState::Open);
        } else if inner.state == CircuitState::Open {
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_trips: inner.total_trips,
            time_in_current_state_secs: inner.last_state_change.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_trips: u64,
    pub time_in_current_state_secs: u64,
}
