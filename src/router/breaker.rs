//! Per-Lane Circuit Breaker
//!
//! A lane that accumulates consecutive upstream failures past the
//! configured threshold is skipped for a cooldown window even if its
//! quota is available. Any success closes the circuit and resets the
//! failure count.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<DateTime<Utc>>,
}

/// Consecutive-failure circuit breaker for one lane
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                open_until: None,
            }),
        }
    }

    /// Whether the lane should be skipped at `now`
    ///
    /// An elapsed cooldown half-opens the breaker: the lane becomes
    /// eligible again, and the next failure re-opens it immediately.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match state.open_until {
            Some(until) if now < until => true,
            Some(_) => {
                state.open_until = None;
                false
            }
            None => false,
        }
    }

    /// Record an upstream failure; opens the breaker at the threshold
    pub fn record_failure(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.failure_threshold {
            state.open_until = Some(now + self.cooldown);
            warn!(
                failures = state.consecutive_failures,
                cooldown_secs = self.cooldown.num_seconds(),
                "circuit opened"
            );
        }
    }

    /// Record an upstream success; closes the breaker
    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    /// Current consecutive failure count
    pub fn consecutive_failures(&self) -> u32 {
        self.state
            .lock()
            .expect("breaker lock poisoned")
            .consecutive_failures
    }
}
