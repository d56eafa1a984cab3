// Honyaku Engine — Circuit breaker
//
// Wraps the subprocess translate path: after enough consecutive failures the
// breaker opens and calls fail fast without touching the socket, then a
// single trial probe decides whether to close again.
//
// State machine: closed → open → half-open → {closed | open}. Timeouts count
// as failures; caller-initiated cancellation must not be recorded at all.

use crate::atoms::error::{CoreError, CoreResult};
use log::{info, warn};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a trial call.
    pub cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: crate::atoms::constants::BREAKER_FAILURE_THRESHOLD,
            cool_down: Duration::from_secs(crate::atoms::constants::BREAKER_COOL_DOWN_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    /// One trial call is in flight; `since` lets a vanished prober (caller
    /// cancelled mid-trial) release the slot after another cool-down.
    HalfOpen { since: Instant },
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::Closed { consecutive_failures: 0 }),
        }
    }

    pub fn state(&self) -> BreakerState {
        match *self.inner.lock() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Ask permission to make a call. `Ok` means go ahead — the caller must
    /// report the outcome with `record_success` / `record_failure` (or
    /// nothing, if the call was cancelled).
    pub fn try_acquire(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        match *inner {
            Inner::Closed { .. } => Ok(()),
            Inner::Open { since } => {
                if since.elapsed() >= self.config.cool_down {
                    info!("[breaker:{}] cool-down elapsed, admitting trial call", self.name);
                    *inner = Inner::HalfOpen { since: Instant::now() };
                    Ok(())
                } else {
                    Err(CoreError::CircuitOpen)
                }
            }
            Inner::HalfOpen { since } => {
                // Trial slot is taken. If the prober never reported back,
                // free the slot once a full cool-down has passed.
                if since.elapsed() >= self.config.cool_down {
                    *inner = Inner::HalfOpen { since: Instant::now() };
                    Ok(())
                } else {
                    Err(CoreError::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match *inner {
            Inner::Closed { consecutive_failures: 0 } => {}
            Inner::Closed { .. } => *inner = Inner::Closed { consecutive_failures: 0 },
            Inner::HalfOpen { .. } | Inner::Open { .. } => {
                info!("[breaker:{}] trial succeeded, closing", self.name);
                *inner = Inner::Closed { consecutive_failures: 0 };
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match *inner {
            Inner::Closed { consecutive_failures } => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    warn!(
                        "[breaker:{}] opening after {} consecutive failures",
                        self.name, failures
                    );
                    *inner = Inner::Open { since: Instant::now() };
                } else {
                    *inner = Inner::Closed { consecutive_failures: failures };
                }
            }
            Inner::HalfOpen { .. } => {
                warn!("[breaker:{}] trial failed, re-opening", self.name);
                *inner = Inner::Open { since: Instant::now() };
            }
            // Late failure report from a call that started before the trip.
            Inner::Open { .. } => {}
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
