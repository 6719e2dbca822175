//! vSphere client errors

use recovery::{Categorized, ErrorCategory, FilesystemCode};
use thiserror::Error;

/// Errors that can occur when interacting with the vSphere API
#[derive(Debug, Error)]
pub enum VSphereError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// vSphere API returned a fault
    #[error("vSphere API error ({status}): {message}")]
    Api {
        status: u16,
        /// Fault type name, e.g. `InvalidPowerState`
        fault: Option<String>,
        message: String,
    },

    /// A `*_Task` method finished in the `error` state
    #[error("{operation} task failed: {message}")]
    Task {
        operation: String,
        fault: Option<String>,
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local file error (install media staging)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Login failed or session expired and could not be renewed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request (e.g., device spec rejected before sending)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Task did not finish within the client's task timeout
    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

impl VSphereError {
    /// Fault type name, when the control plane reported one
    pub fn fault(&self) -> Option<&str> {
        match self {
            VSphereError::Api { fault, .. } | VSphereError::Task { fault, .. } => fault.as_deref(),
            _ => None,
        }
    }
}

fn fault_category(fault: &str) -> Option<ErrorCategory> {
    let category = match fault {
        "NotAuthenticated" | "NoPermission" | "InvalidLogin" => ErrorCategory::Security,
        "ManagedObjectNotFound" | "FileNotFound" | "NotFound" => ErrorCategory::NotFound,
        "InvalidArgument" | "InvalidRequest" | "InvalidDeviceSpec" | "InvalidName" | "DuplicateName"
        | "AlreadyExists" => ErrorCategory::Validation,
        "FileLocked" | "NoDiskSpace" | "FileFault" | "CannotAccessFile" => ErrorCategory::Filesystem,
        _ => return None,
    };
    Some(category)
}

impl Categorized for VSphereError {
    fn category(&self) -> ErrorCategory {
        match self {
            VSphereError::Http(e) if e.is_timeout() || e.is_connect() || e.is_request() => ErrorCategory::Network,
            VSphereError::Http(_) => ErrorCategory::ControlPlane,
            VSphereError::Api { status, fault, .. } => {
                if let Some(category) = fault.as_deref().and_then(fault_category) {
                    return category;
                }
                match status {
                    401 | 403 => ErrorCategory::Security,
                    404 => ErrorCategory::NotFound,
                    400 => ErrorCategory::Validation,
                    _ => ErrorCategory::ControlPlane,
                }
            }
            VSphereError::Task { fault, .. } => fault
                .as_deref()
                .and_then(fault_category)
                .unwrap_or(ErrorCategory::ControlPlane),
            VSphereError::Serialization(_) => ErrorCategory::Unknown,
            VSphereError::Io(e) => e.category(),
            VSphereError::Authentication(_) => ErrorCategory::Security,
            VSphereError::NotFound(_) => ErrorCategory::NotFound,
            VSphereError::InvalidRequest(_) => ErrorCategory::Validation,
            VSphereError::Timeout(_) => ErrorCategory::Network,
        }
    }

    fn filesystem_code(&self) -> Option<FilesystemCode> {
        if let VSphereError::Io(e) = self {
            return e.filesystem_code();
        }
        let code = match self.fault()? {
            "FileLocked" => FilesystemCode::LockTimeout,
            "NoDiskSpace" => FilesystemCode::NoSpace,
            "CannotAccessFile" => FilesystemCode::TemporarilyUnavailable,
            "FileFault" => FilesystemCode::Other,
            _ => return None,
        };
        Some(code)
    }
}
