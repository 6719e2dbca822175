//! Circuit breaker
//!
//! One circuit per operation family. A circuit opens after
//! `failure_threshold` consecutive counted failures and rejects calls until
//! `recovery_timeout` has elapsed; it then lets exactly one trial call through
//! (half-open). The trial's outcome closes or re-opens the circuit.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// State of one circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

impl Circuit {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            trial_in_flight: false,
        }
    }
}

/// Per-family circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn circuits(&self) -> MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask permission to call into `family`.
    ///
    /// Returns the consecutive failure count when the call is rejected.
    pub fn try_acquire(&self, family: &str) -> Result<(), u32> {
        let mut circuits = self.circuits();
        let circuit = circuits.entry(family.to_string()).or_insert_with(Circuit::closed);
        match circuit.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled = circuit
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.recovery_timeout);
                if cooled {
                    info!("Circuit for {} is half-open, allowing one trial call", family);
                    circuit.state = CircuitState::HalfOpen;
                    circuit.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(circuit.consecutive_failures)
                }
            }
            CircuitState::HalfOpen => {
                if circuit.trial_in_flight {
                    Err(circuit.consecutive_failures)
                } else {
                    circuit.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self, family: &str) {
        let mut circuits = self.circuits();
        if let Some(circuit) = circuits.get_mut(family) {
            if circuit.state != CircuitState::Closed {
                info!("Circuit for {} closed after successful call", family);
            }
            *circuit = Circuit::closed();
        }
    }

    pub fn record_failure(&self, family: &str) {
        let mut circuits = self.circuits();
        let circuit = circuits.entry(family.to_string()).or_insert_with(Circuit::closed);
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
        circuit.last_failure = Some(Instant::now());
        circuit.trial_in_flight = false;
        match circuit.state {
            CircuitState::HalfOpen => {
                warn!("Trial call for {} failed, circuit re-opened", family);
                circuit.state = CircuitState::Open;
            }
            CircuitState::Closed if circuit.consecutive_failures >= self.failure_threshold => {
                warn!(
                    "Circuit for {} opened after {} consecutive failures",
                    family, circuit.consecutive_failures
                );
                circuit.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    /// Release a granted call whose outcome says nothing about remote health
    pub fn release(&self, family: &str) {
        if let Some(circuit) = self.circuits().get_mut(family) {
            circuit.trial_in_flight = false;
        }
    }

    pub fn state(&self, family: &str) -> CircuitState {
        self.snapshot(family).state
    }

    pub fn snapshot(&self, family: &str) -> CircuitSnapshot {
        self.circuits().get(family).map_or(
            CircuitSnapshot {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
            },
            |c| CircuitSnapshot {
                state: c.state,
                consecutive_failures: c.consecutive_failures,
                last_failure: c.last_failure,
            },
        )
    }

    pub fn reset(&self, family: &str) {
        self.circuits().remove(family);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        for _ in 0..2 {
            assert!(breaker.try_acquire("vm.create").is_ok());
            breaker.record_failure("vm.create");
        }
        assert_eq!(breaker.state("vm.create"), CircuitState::Closed);

        assert!(breaker.try_acquire("vm.create").is_ok());
        breaker.record_failure("vm.create");
        assert_eq!(breaker.state("vm.create"), CircuitState::Open);
        assert_eq!(breaker.try_acquire("vm.create"), Err(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_exactly_one_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure("vm.power_on");
        assert!(breaker.try_acquire("vm.power_on").is_err());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breaker.try_acquire("vm.power_on").is_ok());
        assert_eq!(breaker.state("vm.power_on"), CircuitState::HalfOpen);
        // second caller is turned away while the trial is running
        assert!(breaker.try_acquire("vm.power_on").is_err());

        breaker.record_success("vm.power_on");
        assert_eq!(breaker.state("vm.power_on"), CircuitState::Closed);
        assert!(breaker.try_acquire("vm.power_on").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(10));
        breaker.record_failure("dataset.create");
        breaker.record_failure("dataset.create");
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(breaker.try_acquire("dataset.create").is_ok());
        breaker.record_failure("dataset.create");
        assert_eq!(breaker.state("dataset.create"), CircuitState::Open);
        // timeout restarts from the trial failure
        assert!(breaker.try_acquire("dataset.create").is_err());
    }

    #[tokio::test]
    async fn test_families_are_independent() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure("vm.create");
        assert!(breaker.try_acquire("vm.create").is_err());
        assert!(breaker.try_acquire("vm.delete").is_ok());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure("vm.create");
        breaker.record_success("vm.create");
        breaker.record_failure("vm.create");
        assert_eq!(breaker.snapshot("vm.create").consecutive_failures, 1);
        assert_eq!(breaker.state("vm.create"), CircuitState::Closed);
    }
}
