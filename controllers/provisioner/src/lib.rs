//! Fleet VM provisioner
//!
//! Creates and tears down Kubernetes-node VMs on two backends:
//! - **TrueNAS** (`truenas`): ZVols first, then the VM object and its ordered
//!   device list
//! - **vSphere** (`vsphere`): shell, disks, re-registration, power-on
//!
//! Both implement [`VmBackend`], which the [`batch`] coordinator drives with
//! bounded concurrency. Every remote unit of work runs through a
//! [`recovery::RecoveryManager`] handed in by the caller.

pub mod backend;
pub mod batch;
pub mod error;
pub mod settings;
pub mod truenas;
pub mod vsphere;

#[cfg(test)]
mod test_utils;

pub use backend::{DeleteReport, DeploymentReport, Phase, VmBackend, VmPowerState, VmSummary, VolumeDeletion};
pub use batch::{BatchCoordinator, BatchError, BatchReport};
pub use error::ProvisionError;
pub use settings::ProvisionerSettings;
pub use truenas::{MachineManager, StorageVolumeManager};
pub use vsphere::VmBuilder;

use recovery::{RecoveryError, RecoveryManager};
use std::future::Future;

/// Run `f` under `recovery`, flattening single-attempt failures to their cause
pub(crate) async fn recovered<T, F, Fut>(recovery: &RecoveryManager, operation: &str, f: F) -> Result<T, ProvisionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProvisionError>>,
{
    match recovery.execute_with_recovery(operation, f).await.into_result() {
        Ok(value) => Ok(value),
        Err(RecoveryError::Failed {
            attempts: 1, source, ..
        }) => Err(source),
        Err(e) => Err(e.into()),
    }
}
