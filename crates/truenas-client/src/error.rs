//! TrueNAS client errors

use recovery::{Categorized, ErrorCategory, FilesystemCode};
use thiserror::Error;

/// Errors that can occur when talking to the TrueNAS middleware
#[derive(Debug, Error)]
pub enum TrueNasError {
    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The middleware closed the session
    #[error("Connection closed by TrueNAS")]
    ConnectionClosed,

    /// A method call returned a JSON-RPC error
    #[error("{method} failed: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
        /// errno name reported by the middleware, e.g. `ENOENT`, `EBUSY`
        errname: Option<String>,
    },

    /// A background job ended in `FAILED` or `ABORTED`
    #[error("{method} job {id} failed: {message}")]
    Job { method: String, id: u64, message: String },

    /// No response within the client timeout
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// API key rejected
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request (e.g., malformed path)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TrueNasError {
    /// Whether the session can no longer be used
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TrueNasError::WebSocket(_) | TrueNasError::ConnectionClosed | TrueNasError::Timeout(_)
        )
    }

    fn errname(&self) -> Option<&str> {
        match self {
            TrueNasError::Rpc { errname, .. } => errname.as_deref(),
            _ => None,
        }
    }
}

impl Categorized for TrueNasError {
    fn category(&self) -> ErrorCategory {
        match self {
            TrueNasError::WebSocket(_) | TrueNasError::ConnectionClosed | TrueNasError::Timeout(_) => {
                ErrorCategory::Network
            }
            TrueNasError::Tls(_) | TrueNasError::Authentication(_) => ErrorCategory::Security,
            TrueNasError::NotFound(_) => ErrorCategory::NotFound,
            TrueNasError::InvalidRequest(_) => ErrorCategory::Validation,
            TrueNasError::Serialization(_) => ErrorCategory::Unknown,
            TrueNasError::Job { .. } => ErrorCategory::ControlPlane,
            TrueNasError::Rpc { .. } => match self.errname() {
                Some("ENOENT") => ErrorCategory::NotFound,
                Some("EACCES" | "EPERM") => ErrorCategory::Security,
                Some("EINVAL" | "EEXIST") => ErrorCategory::Validation,
                Some("EBUSY" | "EAGAIN" | "ETIMEDOUT" | "EDEADLK" | "ENOSPC") => ErrorCategory::Filesystem,
                _ => ErrorCategory::ControlPlane,
            },
        }
    }

    fn filesystem_code(&self) -> Option<FilesystemCode> {
        let code = match self.errname()? {
            "EAGAIN" => FilesystemCode::TemporarilyUnavailable,
            "ETIMEDOUT" | "EDEADLK" => FilesystemCode::LockTimeout,
            "EBUSY" => FilesystemCode::Busy,
            "ENOSPC" => FilesystemCode::NoSpace,
            "ENOENT" => FilesystemCode::NotFound,
            "EACCES" | "EPERM" => FilesystemCode::PermissionDenied,
            _ => FilesystemCode::Other,
        };
        Some(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc(errname: Option<&str>) -> TrueNasError {
        TrueNasError::Rpc {
            method: "pool.dataset.delete".to_string(),
            code: -32001,
            message: "Method call error".to_string(),
            errname: errname.map(str::to_string),
        }
    }

    #[test]
    fn test_errname_mapping() {
        assert_eq!(rpc(Some("ENOENT")).category(), ErrorCategory::NotFound);
        assert_eq!(rpc(Some("EPERM")).category(), ErrorCategory::Security);
        assert_eq!(rpc(None).category(), ErrorCategory::ControlPlane);

        let busy = rpc(Some("EBUSY"));
        assert_eq!(busy.category(), ErrorCategory::Filesystem);
        assert_eq!(busy.filesystem_code(), Some(FilesystemCode::Busy));

        let full = rpc(Some("ENOSPC"));
        assert_eq!(full.filesystem_code(), Some(FilesystemCode::NoSpace));
    }

    #[test]
    fn test_transport_errors_are_network() {
        assert_eq!(TrueNasError::ConnectionClosed.category(), ErrorCategory::Network);
        assert!(TrueNasError::Timeout("vm.query".into()).is_transport());
        assert!(!TrueNasError::NotFound("vm k8s0".into()).is_transport());
    }
}
