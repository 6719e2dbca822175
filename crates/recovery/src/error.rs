//! Error taxonomy and recovery errors

use std::time::Duration;
use thiserror::Error;

/// Category of a failure, independent of the backend that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad input; never retried
    Validation,
    /// Transport failure (connect, reset, timeout)
    Network,
    /// The control plane rejected or failed the operation
    ControlPlane,
    /// Authentication or authorization failure; never retried
    Security,
    /// Filesystem failure; retried only for transient codes
    Filesystem,
    /// Target does not exist; surfaced, not retried
    NotFound,
    /// Anything that could not be classified
    Unknown,
}

impl ErrorCategory {
    /// Categories no strategy should ever retry
    pub fn is_permanent(self) -> bool {
        matches!(self, ErrorCategory::Validation | ErrorCategory::Security | ErrorCategory::NotFound)
    }

    /// Whether a failure in this category says anything about remote health.
    ///
    /// Validation and not-found errors do not count toward a circuit.
    pub fn counts_toward_circuit(self) -> bool {
        !matches!(self, ErrorCategory::Validation | ErrorCategory::NotFound)
    }
}

/// Sub-code for [`ErrorCategory::Filesystem`] errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilesystemCode {
    TemporarilyUnavailable,
    LockTimeout,
    Busy,
    NotFound,
    PermissionDenied,
    NoSpace,
    Other,
}

impl FilesystemCode {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FilesystemCode::TemporarilyUnavailable | FilesystemCode::LockTimeout | FilesystemCode::Busy
        )
    }
}

/// Errors that can be mapped onto the recovery taxonomy
pub trait Categorized {
    fn category(&self) -> ErrorCategory;

    /// Sub-code, only meaningful for [`ErrorCategory::Filesystem`]
    fn filesystem_code(&self) -> Option<FilesystemCode> {
        None
    }
}

impl Categorized for std::io::Error {
    fn category(&self) -> ErrorCategory {
        match self.kind() {
            std::io::ErrorKind::InvalidInput => ErrorCategory::Validation,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => ErrorCategory::Network,
            _ => ErrorCategory::Filesystem,
        }
    }

    fn filesystem_code(&self) -> Option<FilesystemCode> {
        let code = match self.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => {
                FilesystemCode::TemporarilyUnavailable
            }
            std::io::ErrorKind::TimedOut => FilesystemCode::LockTimeout,
            std::io::ErrorKind::ResourceBusy => FilesystemCode::Busy,
            std::io::ErrorKind::NotFound => FilesystemCode::NotFound,
            std::io::ErrorKind::PermissionDenied => FilesystemCode::PermissionDenied,
            std::io::ErrorKind::StorageFull => FilesystemCode::NoSpace,
            _ => FilesystemCode::Other,
        };
        Some(code)
    }
}

/// Why a recovered operation ultimately failed
#[derive(Debug, Error)]
pub enum RecoveryError<E> {
    /// The circuit for this operation family is open; nothing was attempted
    #[error("{operation}: circuit open after {failures} consecutive failures")]
    CircuitOpen { operation: String, failures: u32 },

    /// Cancellation was requested while waiting to retry
    #[error("{operation}: cancelled after {attempts} attempt(s)")]
    Cancelled {
        operation: String,
        attempts: u32,
        last_error: Option<E>,
    },

    /// The last attempt failed and no further retry was allowed
    #[error("{operation} failed after {attempts} attempt(s) in {elapsed:?}: {source}")]
    Failed {
        operation: String,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: E,
    },
}

impl<E> RecoveryError<E> {
    pub fn operation(&self) -> &str {
        match self {
            RecoveryError::CircuitOpen { operation, .. }
            | RecoveryError::Cancelled { operation, .. }
            | RecoveryError::Failed { operation, .. } => operation,
        }
    }

    /// The underlying error of the last attempt, if one was made
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RecoveryError::CircuitOpen { .. } => None,
            RecoveryError::Cancelled { last_error, .. } => last_error.as_ref(),
            RecoveryError::Failed { source, .. } => Some(source),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            RecoveryError::CircuitOpen { .. } => None,
            RecoveryError::Cancelled { last_error, .. } => last_error,
            RecoveryError::Failed { source, .. } => Some(source),
        }
    }
}

impl<E: Categorized> Categorized for RecoveryError<E> {
    fn category(&self) -> ErrorCategory {
        match self {
            RecoveryError::CircuitOpen { .. } => ErrorCategory::ControlPlane,
            RecoveryError::Cancelled { .. } => ErrorCategory::Unknown,
            RecoveryError::Failed { source, .. } => source.category(),
        }
    }

    fn filesystem_code(&self) -> Option<FilesystemCode> {
        self.last_error().and_then(Categorized::filesystem_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_categories() {
        assert!(ErrorCategory::Validation.is_permanent());
        assert!(ErrorCategory::Security.is_permanent());
        assert!(ErrorCategory::NotFound.is_permanent());
        assert!(!ErrorCategory::Network.is_permanent());
        assert!(!ErrorCategory::ControlPlane.is_permanent());
        assert!(!ErrorCategory::Filesystem.is_permanent());
    }

    #[test]
    fn test_io_error_mapping() {
        let busy = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        assert_eq!(busy.category(), ErrorCategory::Filesystem);
        assert_eq!(busy.filesystem_code(), Some(FilesystemCode::TemporarilyUnavailable));

        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(reset.category(), ErrorCategory::Network);

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(!denied.filesystem_code().is_some_and(FilesystemCode::is_transient));
    }
}
