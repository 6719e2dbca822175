//! Provisioner error types.
//!
//! Every error names the operation that failed and the VM or volume it was
//! working on, so a single log line is enough to diagnose a failure.

use recovery::{Categorized, DegradationError, ErrorCategory, FilesystemCode, RecoveryError};
use std::time::Duration;
use thiserror::Error;
use truenas_client::TrueNasError;
use vm_model::ModelError;
use vsphere_client::VSphereError;

/// Errors that can occur while provisioning or deleting VMs.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Configuration rejected before any remote call
    #[error("Invalid configuration: {0}")]
    Model(#[from] ModelError),

    /// TrueNAS middleware call failed
    #[error("{operation} failed for {target}: {source}")]
    TrueNas {
        operation: String,
        target: String,
        #[source]
        source: TrueNasError,
    },

    /// vSphere API call failed
    #[error("{operation} failed for {target}: {source}")]
    VSphere {
        operation: String,
        target: String,
        #[source]
        source: VSphereError,
    },

    /// A recovered unit of work gave up
    #[error(transparent)]
    Recovery(Box<RecoveryError<ProvisionError>>),

    /// Volume discovery failed on both the device list and naming patterns
    #[error("volume discovery for VM {vm} failed: {source}")]
    Discovery {
        vm: String,
        #[source]
        source: Box<DegradationError<ProvisionError>>,
    },

    /// VM name already taken on the backend
    #[error("VM {0} already exists")]
    AlreadyExists(String),

    /// VM does not exist
    #[error("VM {0} not found")]
    NotFound(String),

    /// The VM's device list points at no ZVol
    #[error("no volumes found in the device list of VM {0}")]
    NoVolumesDiscovered(String),

    /// A volume path is taken by a dataset of the wrong type
    #[error("{path} exists but is not a volume")]
    NotAVolume { path: String },

    /// Volume creation was skipped but a derived volume does not exist
    #[error("volume {path} for VM {vm} does not exist (volume creation was skipped)")]
    MissingVolume { vm: String, path: String },

    /// The backend kept listing a deleted VM
    #[error("VM {name} still listed after {polls} checks following deletion")]
    DeleteNotConfirmed { name: String, polls: u32 },

    /// Power-on retries ran out
    #[error("power-on of VM {name} failed after {attempts} attempt(s), {waited:?} elapsed: {source}")]
    PowerOn {
        name: String,
        attempts: u32,
        waited: Duration,
        #[source]
        source: Box<ProvisionError>,
    },

    /// A batch task ended without producing a result
    #[error("deployment task for VM {name} did not complete: {reason}")]
    TaskFailed { name: String, reason: String },

    /// One or more VMs of a batch failed
    #[error("{0}")]
    Batch(#[from] crate::batch::BatchError),

    /// Settings could not be loaded
    #[error("Invalid settings: {0}")]
    Settings(String),
}

impl ProvisionError {
    pub(crate) fn truenas(operation: &str, target: impl Into<String>, source: TrueNasError) -> Self {
        ProvisionError::TrueNas {
            operation: operation.to_string(),
            target: target.into(),
            source,
        }
    }

    pub(crate) fn vsphere(operation: &str, target: impl Into<String>, source: VSphereError) -> Self {
        ProvisionError::VSphere {
            operation: operation.to_string(),
            target: target.into(),
            source,
        }
    }

    /// The error behind any retry wrapping
    pub fn root_cause(&self) -> &ProvisionError {
        match self {
            ProvisionError::Recovery(e) => e.last_error().map_or(self, ProvisionError::root_cause),
            ProvisionError::PowerOn { source, .. } => source.root_cause(),
            _ => self,
        }
    }
}

impl From<RecoveryError<ProvisionError>> for ProvisionError {
    fn from(error: RecoveryError<ProvisionError>) -> Self {
        ProvisionError::Recovery(Box::new(error))
    }
}

impl Categorized for ProvisionError {
    fn category(&self) -> ErrorCategory {
        match self {
            ProvisionError::Model(_)
            | ProvisionError::AlreadyExists(_)
            | ProvisionError::MissingVolume { .. }
            | ProvisionError::NotAVolume { .. }
            | ProvisionError::Settings(_) => ErrorCategory::Validation,
            ProvisionError::TrueNas { source, .. } => source.category(),
            ProvisionError::VSphere { source, .. } => source.category(),
            ProvisionError::Recovery(e) => e.category(),
            ProvisionError::Discovery { source, .. } => source.primary_error().category(),
            ProvisionError::NotFound(_) | ProvisionError::NoVolumesDiscovered(_) => ErrorCategory::NotFound,
            ProvisionError::DeleteNotConfirmed { .. } | ProvisionError::PowerOn { .. } => ErrorCategory::ControlPlane,
            ProvisionError::TaskFailed { .. } | ProvisionError::Batch(_) => ErrorCategory::Unknown,
        }
    }

    fn filesystem_code(&self) -> Option<FilesystemCode> {
        match self {
            ProvisionError::TrueNas { source, .. } => source.filesystem_code(),
            ProvisionError::VSphere { source, .. } => source.filesystem_code(),
            ProvisionError::Recovery(e) => e.filesystem_code(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_errors_keep_their_category() {
        let busy = ProvisionError::truenas(
            "pool.dataset.delete",
            "tank/k8s0-boot",
            TrueNasError::Rpc {
                method: "pool.dataset.delete".to_string(),
                code: -32001,
                message: "dataset is busy".to_string(),
                errname: Some("EBUSY".to_string()),
            },
        );
        assert_eq!(busy.category(), ErrorCategory::Filesystem);
        assert!(busy.filesystem_code().is_some_and(FilesystemCode::is_transient));
        assert!(busy.to_string().contains("tank/k8s0-boot"));
    }

    #[test]
    fn test_operator_errors_are_permanent() {
        let missing = ProvisionError::MissingVolume {
            vm: "k8s0".to_string(),
            path: "tank/k8s0-boot".to_string(),
        };
        assert!(missing.category().is_permanent());
        assert!(ProvisionError::AlreadyExists("k8s0".to_string()).category().is_permanent());
    }
}
