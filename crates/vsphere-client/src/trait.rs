//! VSphereClient trait for mocking
//!
//! The concrete `VSphereClient` implements this trait, and tests use the
//! in-memory mock.

use crate::error::VSphereError;
use crate::models::*;
use std::path::Path;

/// Trait for vSphere API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
/// Methods backed by a `*_Task` return once the task has finished.
#[async_trait::async_trait]
pub trait VSphereClientTrait: Send + Sync {
    /// Host the client talks to
    fn host(&self) -> &str;

    /// Datastore new VMs and uploaded files are placed on
    fn datastore(&self) -> &str;

    /// Create a VM and return its managed object id
    async fn create_vm(&self, spec: &VmSpec) -> Result<String, VSphereError>;
    async fn get_vm_info(&self, vm_id: &str) -> Result<VmInfo, VSphereError>;

    /// Devices of a VM, with the keys the control plane assigned
    async fn get_devices(&self, vm_id: &str) -> Result<Vec<VirtualDevice>, VSphereError> {
        Ok(self.get_vm_info(vm_id).await?.devices)
    }

    async fn reconfigure_vm(&self, vm_id: &str, changes: &[DeviceChange]) -> Result<(), VSphereError>;

    // Inventory
    async fn unregister_vm(&self, vm_id: &str) -> Result<(), VSphereError>;
    /// Register a VM from its `.vmx` descriptor and return the new managed object id
    async fn register_vm(&self, vmx_path: &str, name: &str) -> Result<String, VSphereError>;
    async fn find_vm(&self, name: &str) -> Result<Option<VmInfo>, VSphereError>;
    async fn list_vms(&self) -> Result<Vec<VmInfo>, VSphereError>;

    // Power
    async fn power_on(&self, vm_id: &str) -> Result<(), VSphereError>;
    async fn power_off(&self, vm_id: &str) -> Result<(), VSphereError>;
    /// Destroy the VM and its files
    async fn destroy_vm(&self, vm_id: &str) -> Result<(), VSphereError>;

    /// Upload a local file to `remote_path` on the configured datastore and
    /// return its datastore path (`[datastore] remote_path`)
    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<String, VSphereError>;
}

