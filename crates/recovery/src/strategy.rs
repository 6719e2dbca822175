//! # Retry strategies
//!
//! A strategy answers three questions for the retry loop: is this error worth
//! another attempt, how long to wait before it, and how many attempts are
//! allowed in total. Attempts are 1-indexed: `backoff_duration(1)` is the wait
//! after the first failure.

use crate::error::{Categorized, ErrorCategory};
use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Retry policy for one error category
pub trait RecoveryStrategy: Send + Sync + fmt::Debug {
    /// Whether `attempt` failing with `error` should be followed by another attempt
    fn should_retry(&self, error: &dyn Categorized, attempt: u32) -> bool;

    /// Wait before the attempt following `attempt`
    fn backoff_duration(&self, attempt: u32) -> Duration;

    /// Total attempts allowed, including the first
    fn max_attempts(&self) -> u32;
}

/// Shared retryability rule: permanent categories never retry, filesystem
/// errors only for transient codes.
fn is_retryable(error: &dyn Categorized) -> bool {
    match error.category() {
        ErrorCategory::Filesystem => error.filesystem_code().is_some_and(|code| code.is_transient()),
        category => !category.is_permanent(),
    }
}

/// Exponential backoff with jitter
///
/// Delay for attempt `n` is `base * multiplier^(n-1)`, randomised by
/// `±jitter` and capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Fraction of the delay to randomise by, `0.25` for ±25%
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
            jitter: 0.25,
        }
    }
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(base: Duration, multiplier: f64, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            multiplier,
            max_delay,
            max_attempts,
            ..Self::default()
        }
    }

    /// Same schedule without randomisation
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before jitter is applied
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "delays are far below 2^52 ns and bounded by max_delay"
    )]
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let nanos = self.base.as_nanos() as f64 * self.multiplier.powi(exponent);
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.round() as u64)
    }
}

impl RecoveryStrategy for ExponentialBackoff {
    fn should_retry(&self, error: &dyn Categorized, attempt: u32) -> bool {
        attempt < self.max_attempts && is_retryable(error)
    }

    fn backoff_duration(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(factor.max(0.0)).min(self.max_delay)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Fixed, escalating delay schedule
///
/// For failures caused by the remote still finishing background work rather
/// than by overload. One retry per entry, then give up.
#[derive(Debug, Clone)]
pub struct FixedDelays {
    delays: Vec<Duration>,
}

impl FixedDelays {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Sum of every scheduled wait
    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }
}

impl RecoveryStrategy for FixedDelays {
    fn should_retry(&self, error: &dyn Categorized, attempt: u32) -> bool {
        (attempt as usize) <= self.delays.len() && is_retryable(error)
    }

    fn backoff_duration(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) as usize - 1).min(self.delays.len().saturating_sub(1));
        self.delays.get(index).copied().unwrap_or_default()
    }

    fn max_attempts(&self) -> u32 {
        u32::try_from(self.delays.len()).unwrap_or(u32::MAX).saturating_add(1)
    }
}

/// Never retry
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RecoveryStrategy for NoRetry {
    fn should_retry(&self, _error: &dyn Categorized, _attempt: u32) -> bool {
        false
    }

    fn backoff_duration(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }

    fn max_attempts(&self) -> u32 {
        1
    }
}
