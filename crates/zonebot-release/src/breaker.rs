//! Circuit breaker guarding the external quarantine service.
//!
//! Closed → Open after a run of consecutive failures; Open fails fast until
//! the cooldown elapses; then exactly one trial call is permitted
//! (half-open) and its outcome decides between Closed and Open again.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    failure_count: u32,
    threshold: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            threshold,
            cooldown,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Whether a call may go out right now. Transitions Open → HalfOpen once
    /// the cooldown has elapsed; in HalfOpen only a single probe is allowed
    /// until its outcome is recorded.
    pub fn try_acquire(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| at.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    self.state = BreakerState::HalfOpen;
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Release an acquired slot without an outcome, e.g. when a cached
    /// result made the network call unnecessary.
    pub fn cancel(&mut self) {
        self.probe_in_flight = false;
    }

    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    /// One failure per outer call; the half-open probe failing re-arms the
    /// cooldown immediately.
    pub fn record_failure(&mut self) {
        self.probe_in_flight = false;
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }
}
