//! Recovery framework
//!
//! Hardens calls against remote control planes that fail transiently:
//!
//! - **Strategies** decide whether an error is worth another attempt and how
//!   long to wait first (`ExponentialBackoff`, `FixedDelays`, `NoRetry`)
//! - **Circuit breaker** stops hammering an operation family after repeated
//!   failures until a recovery timeout elapses
//! - **RecoveryManager** drives the retry loop, picks a strategy from the
//!   error category and honours cancellation at every backoff sleep
//! - **GracefulDegradationManager** runs a registered fallback when the
//!   primary path fails, keeping both errors
//!
//! # Example
//!
//! ```no_run
//! use recovery::{Categorized, ErrorCategory, RecoveryManager};
//!
//! #[derive(Debug)]
//! struct Flaky;
//! impl std::fmt::Display for Flaky {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "connection reset")
//!     }
//! }
//! impl Categorized for Flaky {
//!     fn category(&self) -> ErrorCategory {
//!         ErrorCategory::Network
//!     }
//! }
//!
//! # async fn example() {
//! let manager = RecoveryManager::with_defaults();
//! let result = manager
//!     .execute_with_recovery("truenas.vm.query:k8s0", || async { Err::<(), _>(Flaky) })
//!     .await;
//! println!("gave up after {} attempts in {:?}", result.attempts, result.elapsed);
//! # }
//! ```

pub mod circuit;
pub mod degradation;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod strategy;

pub use circuit::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use degradation::{Degraded, DegradationError, GracefulDegradationManager};
pub use error::{Categorized, ErrorCategory, FilesystemCode, RecoveryError};
pub use manager::{operation_family, RecoveryManager, RecoveryResult};
pub use metrics::RecoveryMetrics;
pub use strategy::{ExponentialBackoff, FixedDelays, NoRetry, RecoveryStrategy};

// Re-exported so callers can hand a token to the manager without a direct dependency
pub use tokio_util::sync::CancellationToken;
