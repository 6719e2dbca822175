//! Retry loop
//!
//! `RecoveryManager::execute_with_recovery` runs an operation, and on failure
//! picks a strategy from the error's category, sleeps for the strategy's
//! backoff and tries again until the strategy gives up.
//!
//! Operation names take the form `family:target`, e.g.
//! `vsphere.power_on:k8s0`. The family (the part before the first `:`)
//! scopes the circuit breaker and labels metrics; the full name is used in
//! logs and errors.

use crate::circuit::CircuitBreaker;
use crate::error::{Categorized, ErrorCategory, RecoveryError};
use crate::metrics::RecoveryMetrics;
use crate::strategy::{ExponentialBackoff, NoRetry, RecoveryStrategy};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Family part of an operation name
pub fn operation_family(operation: &str) -> &str {
    operation.split(':').next().unwrap_or(operation)
}

/// Outcome of a recovered operation
#[derive(Debug)]
pub struct RecoveryResult<T, E> {
    pub outcome: Result<T, RecoveryError<E>>,
    /// Attempts actually made (0 when the circuit rejected the first one)
    pub attempts: u32,
    /// Wall time from the first attempt to the final outcome, sleeps included
    pub elapsed: Duration,
}

impl<T, E> RecoveryResult<T, E> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn into_result(self) -> Result<T, RecoveryError<E>> {
        self.outcome
    }
}

/// Drives retries for every remote-facing unit of work
pub struct RecoveryManager {
    strategies: HashMap<ErrorCategory, Arc<dyn RecoveryStrategy>>,
    default_strategy: Arc<dyn RecoveryStrategy>,
    breaker: Option<Arc<CircuitBreaker>>,
    metrics: Option<RecoveryMetrics>,
    cancel: CancellationToken,
}

impl fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("strategies", &self.strategies)
            .field("default_strategy", &self.default_strategy)
            .field("breaker", &self.breaker.is_some())
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl RecoveryManager {
    /// Manager using `default_strategy` for retryable categories.
    ///
    /// Validation, security and not-found errors map to [`NoRetry`].
    pub fn new(default_strategy: Arc<dyn RecoveryStrategy>) -> Self {
        let no_retry: Arc<dyn RecoveryStrategy> = Arc::new(NoRetry);
        let strategies = [ErrorCategory::Validation, ErrorCategory::Security, ErrorCategory::NotFound]
            .into_iter()
            .map(|category| (category, Arc::clone(&no_retry)))
            .collect();
        Self {
            strategies,
            default_strategy,
            breaker: None,
            metrics: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Manager with a default [`ExponentialBackoff`]
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(ExponentialBackoff::default()))
    }

    /// Replace the strategy for one error category
    #[must_use]
    pub fn with_strategy(mut self, category: ErrorCategory, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.strategies.insert(category, strategy);
        self
    }

    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: RecoveryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Strategy used for errors of `category`
    pub fn strategy_for(&self, category: ErrorCategory) -> &Arc<dyn RecoveryStrategy> {
        self.strategies.get(&category).unwrap_or(&self.default_strategy)
    }

    /// Run `operation` with retries.
    ///
    /// `f` is called once per attempt. Cancellation is honoured at every
    /// backoff sleep; an attempt already in flight is left to finish.
    pub async fn execute_with_recovery<T, E, F, Fut>(&self, operation: &str, f: F) -> RecoveryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Categorized + fmt::Display,
    {
        self.execute_with_strategy(operation, None, f).await
    }

    /// Like [`execute_with_recovery`](Self::execute_with_recovery) but with
    /// one strategy for every category.
    pub async fn execute_with_strategy<T, E, F, Fut>(
        &self,
        operation: &str,
        strategy: Option<&dyn RecoveryStrategy>,
        f: F,
    ) -> RecoveryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Categorized + fmt::Display,
    {
        self.run(operation, strategy, self.breaker.as_deref(), f).await
    }

    /// Run `operation` on a fixed `schedule` that the circuit breaker never
    /// cuts short.
    ///
    /// For failures that are per-target readiness rather than control-plane
    /// overload (power-on while disks are still being processed): one VM's
    /// failures must not use up another VM's schedule.
    pub async fn execute_with_schedule<T, E, F, Fut>(
        &self,
        operation: &str,
        schedule: &dyn RecoveryStrategy,
        f: F,
    ) -> RecoveryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Categorized + fmt::Display,
    {
        self.run(operation, Some(schedule), None, f).await
    }

    async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        strategy: Option<&dyn RecoveryStrategy>,
        breaker: Option<&CircuitBreaker>,
        mut f: F,
    ) -> RecoveryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Categorized + fmt::Display,
    {
        let family = operation_family(operation);
        let started = Instant::now();
        let mut attempt: u32 = 0;
        let mut last_error: Option<E> = None;

        loop {
            if let Some(breaker) = breaker {
                if let Err(failures) = breaker.try_acquire(family) {
                    warn!("{} rejected: circuit open for {}", operation, family);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_circuit_rejection(family);
                    }
                    let elapsed = started.elapsed();
                    // Attempts already made keep their cause
                    let outcome = match last_error.take() {
                        Some(source) => RecoveryError::Failed {
                            operation: operation.to_string(),
                            attempts: attempt,
                            elapsed,
                            source,
                        },
                        None => RecoveryError::CircuitOpen {
                            operation: operation.to_string(),
                            failures,
                        },
                    };
                    return RecoveryResult {
                        outcome: Err(outcome),
                        attempts: attempt,
                        elapsed,
                    };
                }
            }

            attempt += 1;
            if let Some(metrics) = &self.metrics {
                metrics.record_attempt(family);
            }

            let error = match f().await {
                Ok(value) => {
                    if let Some(breaker) = breaker {
                        breaker.record_success(family);
                    }
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", operation, attempt);
                    }
                    return RecoveryResult {
                        outcome: Ok(value),
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    };
                }
                Err(error) => error,
            };

            let category = error.category();
            if let Some(breaker) = breaker {
                if category.counts_toward_circuit() {
                    breaker.record_failure(family);
                } else {
                    breaker.release(family);
                }
            }

            let strategy = strategy.unwrap_or_else(|| self.strategy_for(category).as_ref());
            if attempt >= strategy.max_attempts() || !strategy.should_retry(&error, attempt) {
                if let Some(metrics) = &self.metrics {
                    metrics.record_exhausted(family);
                }
                let elapsed = started.elapsed();
                warn!(
                    "{} failed after {} attempt(s) in {:?} ({:?}): {}",
                    operation, attempt, elapsed, category, error
                );
                return RecoveryResult {
                    outcome: Err(RecoveryError::Failed {
                        operation: operation.to_string(),
                        attempts: attempt,
                        elapsed,
                        source: error,
                    }),
                    attempts: attempt,
                    elapsed,
                };
            }

            let delay = strategy.backoff_duration(attempt);
            if let Some(metrics) = &self.metrics {
                metrics.record_retry(family);
            }
            warn!(
                "{} attempt {}/{} failed: {}; retrying in {:?}",
                operation,
                attempt,
                strategy.max_attempts(),
                error,
                delay
            );

            let cancelled = tokio::select! {
                biased;
                () = self.cancel.cancelled() => true,
                () = tokio::time::sleep(delay) => false,
            };
            if cancelled {
                warn!("{} cancelled after {} attempt(s)", operation, attempt);
                return RecoveryResult {
                    outcome: Err(RecoveryError::Cancelled {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last_error: Some(error),
                    }),
                    attempts: attempt,
                    elapsed: started.elapsed(),
                };
            }
            last_error = Some(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::FixedDelays;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(ErrorCategory);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?} failure", self.0)
        }
    }

    impl Categorized for TestError {
        fn category(&self) -> ErrorCategory {
            self.0
        }
    }

    fn fixed_backoff() -> Arc<dyn RecoveryStrategy> {
        Arc::new(ExponentialBackoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(30), 3).without_jitter())
    }

    #[test]
    fn test_operation_family() {
        assert_eq!(operation_family("vsphere.power_on:k8s0"), "vsphere.power_on");
        assert_eq!(operation_family("truenas.vm.query"), "truenas.vm.query");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_up_to_max_attempts() {
        let manager = RecoveryManager::new(fixed_backoff());
        let calls = AtomicU32::new(0);

        let result: RecoveryResult<(), TestError> = manager
            .execute_with_recovery("truenas.vm.create:k8s0", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(ErrorCategory::Network))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.attempts, 3);
        // 1s + 2s of backoff between three attempts
        assert!(result.elapsed >= Duration::from_secs(3));
        match result.outcome {
            Err(RecoveryError::Failed { attempts, source, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source.0, ErrorCategory::Network);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failure() {
        let manager = RecoveryManager::new(fixed_backoff());
        let calls = AtomicU32::new(0);

        let result = manager
            .execute_with_recovery("vsphere.task:create", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TestError(ErrorCategory::ControlPlane))
                } else {
                    Ok("vm-42")
                }
            })
            .await;

        assert_eq!(result.attempts, 2);
        assert_eq!(result.into_result().unwrap(), "vm-42");
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_is_attempted_once() {
        let manager = RecoveryManager::new(fixed_backoff());
        let calls = AtomicU32::new(0);

        let result: RecoveryResult<(), TestError> = manager
            .execute_with_recovery("truenas.vm.create:bad name", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(ErrorCategory::Validation))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.elapsed, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_strategy_overrides_categories() {
        let manager = RecoveryManager::with_defaults();
        let schedule = FixedDelays::new(vec![Duration::from_secs(10), Duration::from_secs(20)]);
        let calls = AtomicU32::new(0);

        let result: RecoveryResult<(), TestError> = manager
            .execute_with_strategy("vsphere.power_on:k8s0", Some(&schedule), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(ErrorCategory::ControlPlane))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.elapsed >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_backoff() {
        let cancel = CancellationToken::new();
        let manager = RecoveryManager::new(fixed_backoff()).with_cancellation(cancel.clone());
        let calls = AtomicU32::new(0);

        let result: RecoveryResult<(), TestError> = manager
            .execute_with_recovery("truenas.dataset.create:tank/k8s0-boot", || {
                calls.fetch_add(1, Ordering::SeqCst);
                cancel.cancel();
                async { Err(TestError(ErrorCategory::Network)) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result.outcome,
            Err(RecoveryError::Cancelled { attempts: 1, last_error: Some(_), .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_rejects_without_calling() {
        let breaker = Arc::new(CircuitBreaker::new(2, Duration::from_secs(60)));
        let manager = RecoveryManager::new(fixed_backoff()).with_circuit_breaker(Arc::clone(&breaker));

        let _: RecoveryResult<(), TestError> = manager
            .execute_with_recovery("vsphere.reconfigure:k8s0", || async {
                Err(TestError(ErrorCategory::ControlPlane))
            })
            .await;
        assert_eq!(breaker.state("vsphere.reconfigure"), crate::CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result: RecoveryResult<(), TestError> = manager
            .execute_with_recovery("vsphere.reconfigure:k8s1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.attempts, 0);
        assert!(matches!(result.outcome, Err(RecoveryError::CircuitOpen { failures: 2, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opening_mid_retry_keeps_the_cause() {
        let breaker = Arc::new(CircuitBreaker::new(2, Duration::from_secs(60)));
        let manager = RecoveryManager::new(fixed_backoff()).with_circuit_breaker(Arc::clone(&breaker));
        let calls = AtomicU32::new(0);

        let result: RecoveryResult<(), TestError> = manager
            .execute_with_recovery("truenas.vm.start:k8s0", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(ErrorCategory::ControlPlane))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.attempts, 2);
        let err = result.into_result().unwrap_err();
        assert_eq!(err.last_error().map(|e| e.0), Some(ErrorCategory::ControlPlane));
        assert!(matches!(err, RecoveryError::Failed { attempts: 2, .. }));
        assert!(err.to_string().contains("truenas.vm.start:k8s0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_runs_past_an_open_circuit() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(60)));
        breaker.record_failure("vsphere.power_on");
        let manager = RecoveryManager::new(fixed_backoff()).with_circuit_breaker(Arc::clone(&breaker));
        let schedule = FixedDelays::new(vec![Duration::from_secs(5), Duration::from_secs(10)]);
        let calls = AtomicU32::new(0);

        let result: RecoveryResult<(), TestError> = manager
            .execute_with_schedule("vsphere.power_on:k8s1", &schedule, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError(ErrorCategory::ControlPlane))
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.elapsed >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_does_not_trip_circuit() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(60)));
        let manager = RecoveryManager::new(fixed_backoff()).with_circuit_breaker(Arc::clone(&breaker));

        let _: RecoveryResult<(), TestError> = manager
            .execute_with_recovery("truenas.vm.query:k8s9", || async { Err(TestError(ErrorCategory::NotFound)) })
            .await;

        assert_eq!(breaker.state("truenas.vm.query"), crate::CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_are_recorded() {
        let registry = prometheus::Registry::new();
        let metrics = RecoveryMetrics::new(&registry).unwrap();
        let manager = RecoveryManager::new(fixed_backoff()).with_metrics(metrics.clone());

        let _: RecoveryResult<(), TestError> = manager
            .execute_with_recovery("truenas.vm.start:k8s0", || async { Err(TestError(ErrorCategory::Network)) })
            .await;

        assert_eq!(metrics.attempts("truenas.vm.start"), 3);
        assert_eq!(metrics.retries("truenas.vm.start"), 2);
        assert_eq!(metrics.exhausted("truenas.vm.start"), 1);
    }
}
