//! Fallbacks for operations that have a cheaper, less precise alternative
//!
//! Volume discovery is the main user: the primary path reads a VM's device
//! list; when that fails the registered fallback guesses from naming
//! patterns instead.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{info, warn};

type Fallback<T, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// A value and whether it came from the fallback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Degraded<T> {
    pub value: T,
    pub used_fallback: bool,
}

#[derive(Debug, Error)]
pub enum DegradationError<E> {
    #[error("{operation} failed and no fallback is registered: {source}")]
    NoFallback {
        operation: String,
        #[source]
        source: E,
    },

    #[error("{operation} failed ({source}) and its fallback failed too: {fallback_error}")]
    FallbackFailed {
        operation: String,
        #[source]
        source: E,
        fallback_error: E,
    },
}

impl<E> DegradationError<E> {
    /// Error of the primary path
    pub fn primary_error(&self) -> &E {
        match self {
            DegradationError::NoFallback { source, .. } | DegradationError::FallbackFailed { source, .. } => source,
        }
    }
}

/// Registry of fallbacks keyed by operation name
pub struct GracefulDegradationManager<T, E> {
    fallbacks: RwLock<HashMap<String, Fallback<T, E>>>,
}

impl<T, E> fmt::Debug for GracefulDegradationManager<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .fallbacks
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("GracefulDegradationManager").field("fallbacks", &names).finish()
    }
}

impl<T, E> Default for GracefulDegradationManager<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> GracefulDegradationManager<T, E> {
    pub fn new() -> Self {
        Self {
            fallbacks: RwLock::new(HashMap::new()),
        }
    }

    /// Register a fallback for `operation`, replacing any earlier one
    pub fn register_fallback<F, Fut>(&self, operation: impl Into<String>, fallback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let fallback: Fallback<T, E> = Arc::new(move || Box::pin(fallback()));
        let mut fallbacks = self.fallbacks.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        fallbacks.insert(operation.into(), fallback);
    }

    pub fn has_fallback(&self, operation: &str) -> bool {
        self.fallback(operation).is_some()
    }

    fn fallback(&self, operation: &str) -> Option<Fallback<T, E>> {
        let fallbacks = self.fallbacks.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        fallbacks.get(operation).cloned()
    }

    /// Run `primary`; if it fails, run the fallback registered for `operation`.
    pub async fn execute<Fut>(&self, operation: &str, primary: Fut) -> Result<Degraded<T>, DegradationError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let source = match primary.await {
            Ok(value) => {
                return Ok(Degraded {
                    value,
                    used_fallback: false,
                });
            }
            Err(e) => e,
        };

        let Some(fallback) = self.fallback(operation) else {
            return Err(DegradationError::NoFallback {
                operation: operation.to_string(),
                source,
            });
        };

        warn!("{} failed: {}; using fallback", operation, source);
        match fallback().await {
            Ok(value) => {
                info!("{} served by fallback", operation);
                Ok(Degraded {
                    value,
                    used_fallback: true,
                })
            }
            Err(fallback_error) => Err(DegradationError::FallbackFailed {
                operation: operation.to_string(),
                source,
                fallback_error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let manager: GracefulDegradationManager<Vec<&str>, String> = GracefulDegradationManager::new();
        manager.register_fallback("discover", || async { Ok(vec!["guessed"]) });

        let result = manager.execute("discover", async { Ok(vec!["tank/k8s0-boot"]) }).await.unwrap();
        assert!(!result.used_fallback);
        assert_eq!(result.value, vec!["tank/k8s0-boot"]);
    }

    #[tokio::test]
    async fn test_fallback_used_on_primary_failure() {
        let manager: GracefulDegradationManager<u32, String> = GracefulDegradationManager::new();
        manager.register_fallback("discover", || async { Ok(3) });

        let result = manager
            .execute("discover", async { Err("device query failed".to_string()) })
            .await
            .unwrap();
        assert!(result.used_fallback);
        assert_eq!(result.value, 3);
    }

    #[tokio::test]
    async fn test_missing_fallback_surfaces_primary_error() {
        let manager: GracefulDegradationManager<u32, String> = GracefulDegradationManager::new();
        assert!(!manager.has_fallback("discover"));

        let err = manager.execute("discover", async { Err("boom".to_string()) }).await.unwrap_err();
        assert!(matches!(err, DegradationError::NoFallback { .. }));
        assert_eq!(err.primary_error(), "boom");
    }

    #[tokio::test]
    async fn test_both_paths_failing_keeps_both_errors() {
        let manager: GracefulDegradationManager<u32, String> = GracefulDegradationManager::new();
        manager.register_fallback("discover", || async { Err("pattern scan failed".to_string()) });

        let err = manager.execute("discover", async { Err("boom".to_string()) }).await.unwrap_err();
        match err {
            DegradationError::FallbackFailed {
                source, fallback_error, ..
            } => {
                assert_eq!(source, "boom");
                assert_eq!(fallback_error, "pattern scan failed");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
