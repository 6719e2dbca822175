//! Recovery metrics
//!
//! Counters are labelled by operation family, never by target, to keep label
//! cardinality bounded. The collector registers against a caller-supplied
//! registry and is handed to each `RecoveryManager` explicitly.

use prometheus::{IntCounterVec, Opts, Registry};

#[derive(Debug, Clone)]
pub struct RecoveryMetrics {
    attempts: IntCounterVec,
    retries: IntCounterVec,
    exhausted: IntCounterVec,
    circuit_rejections: IntCounterVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), &["operation"])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl RecoveryMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            attempts: counter(registry, "recovery_attempts_total", "Attempts made against a control plane")?,
            retries: counter(registry, "recovery_retries_total", "Retries scheduled after a failed attempt")?,
            exhausted: counter(
                registry,
                "recovery_exhausted_total",
                "Operations that failed after their last allowed attempt",
            )?,
            circuit_rejections: counter(
                registry,
                "recovery_circuit_rejections_total",
                "Calls rejected because the circuit was open",
            )?,
        })
    }

    pub(crate) fn record_attempt(&self, family: &str) {
        self.attempts.with_label_values(&[family]).inc();
    }

    pub(crate) fn record_retry(&self, family: &str) {
        self.retries.with_label_values(&[family]).inc();
    }

    pub(crate) fn record_exhausted(&self, family: &str) {
        self.exhausted.with_label_values(&[family]).inc();
    }

    pub(crate) fn record_circuit_rejection(&self, family: &str) {
        self.circuit_rejections.with_label_values(&[family]).inc();
    }

    pub fn attempts(&self, family: &str) -> u64 {
        self.attempts.with_label_values(&[family]).get()
    }

    pub fn retries(&self, family: &str) -> u64 {
        self.retries.with_label_values(&[family]).get()
    }

    pub fn exhausted(&self, family: &str) -> u64 {
        self.exhausted.with_label_values(&[family]).get()
    }

    pub fn circuit_rejections(&self, family: &str) -> u64 {
        self.circuit_rejections.with_label_values(&[family]).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_against_supplied_registry() {
        let registry = Registry::new();
        let metrics = RecoveryMetrics::new(&registry).unwrap();
        metrics.record_attempt("vm.create");
        metrics.record_attempt("vm.create");
        assert_eq!(metrics.attempts("vm.create"), 2);
        assert_eq!(metrics.attempts("vm.delete"), 0);
        assert!(!registry.gather().is_empty());
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        assert!(RecoveryMetrics::new(&registry).is_ok());
        assert!(RecoveryMetrics::new(&registry).is_err());
    }
}
