//! Circuit breaker for agent endpoints
//!
//! After `threshold` consecutive failures the endpoint is considered down and
//! calls are refused for `cooldown`. The first call after the cooldown is a
//! probe: its outcome either closes the circuit or restarts the cooldown.
//! Agents on the same endpoint share one breaker through an `Arc`.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    /// Refusing calls until the cooldown passes
    Open,
    /// One probe call is in flight
    HalfOpen,
}

#[derive(Debug)]
enum Phase {
    Closed { failures: u32 },
    Open { since: Instant },
    Probing,
}

/// Guards an agent endpoint against repeated failing calls
///
/// ```
/// use schemaflow_agent::{CircuitBreaker, CircuitState};
/// use std::time::Duration;
///
/// let breaker = CircuitBreaker::new(2, Duration::from_secs(30));
/// breaker.record_failure();
/// breaker.record_failure();
///
/// assert_eq!(breaker.state(), CircuitState::Open);
/// assert!(breaker.admit().is_err());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    phase: Mutex<Phase>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            phase: Mutex::new(Phase::Closed { failures: 0 }),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        match *self.phase() {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::Probing => CircuitState::HalfOpen,
        }
    }

    /// Ask to place a call
    ///
    /// `Err` carries how long the caller should wait. An open circuit whose
    /// cooldown has passed admits exactly one probe; further calls are refused
    /// until that probe reports back.
    pub fn admit(&self) -> Result<(), Duration> {
        let mut phase = self.phase();
        match *phase {
            Phase::Closed { .. } => Ok(()),
            Phase::Probing => Err(Duration::ZERO),
            Phase::Open { since } => {
                let waited = since.elapsed();
                if waited >= self.cooldown {
                    *phase = Phase::Probing;
                    Ok(())
                } else {
                    Err(self.cooldown - waited)
                }
            }
        }
    }

    pub fn record_success(&self) {
        *self.phase() = Phase::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut phase = self.phase();
        let next = match *phase {
            Phase::Closed { failures } if failures + 1 < self.threshold => Phase::Closed {
                failures: failures + 1,
            },
            _ => Phase::Open {
                since: Instant::now(),
            },
        };
        *phase = next;
    }

    /// Consecutive failures while closed; the threshold once tripped
    pub fn failure_count(&self) -> u32 {
        match *self.phase() {
            Phase::Closed { failures } => failures,
            Phase::Open { .. } | Phase::Probing => self.threshold,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}
