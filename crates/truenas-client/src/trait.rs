//! TrueNasClient trait for mocking
//!
//! The concrete `TrueNasClient` implements this trait, and tests use the
//! in-memory mock.

use crate::error::TrueNasError;
use crate::models::*;

/// Trait for TrueNAS middleware operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait TrueNasClientTrait: Send + Sync {
    /// Host the client talks to
    fn host(&self) -> &str;

    // VM operations
    async fn query_vm(&self, name: &str) -> Result<Option<VmRecord>, TrueNasError>;
    async fn list_vms(&self) -> Result<Vec<VmRecord>, TrueNasError>;
    async fn create_vm(&self, request: &CreateVmRequest) -> Result<VmRecord, TrueNasError>;
    /// Delete the VM object only; its ZVols are left in place
    async fn delete_vm(&self, id: u64) -> Result<(), TrueNasError>;
    async fn start_vm(&self, id: u64) -> Result<(), TrueNasError>;
    async fn stop_vm(&self, id: u64, force: bool) -> Result<(), TrueNasError>;

    // Device operations
    async fn query_devices(&self, vm_id: u64) -> Result<Vec<DeviceRecord>, TrueNasError>;
    async fn create_device(&self, request: &CreateDeviceRequest) -> Result<DeviceRecord, TrueNasError>;

    // Dataset operations
    async fn get_dataset(&self, path: &str) -> Result<Option<Dataset>, TrueNasError>;
    async fn query_datasets(&self, kind: Option<DatasetType>) -> Result<Vec<Dataset>, TrueNasError>;
    async fn create_dataset(&self, request: &CreateDatasetRequest) -> Result<Dataset, TrueNasError>;
    async fn delete_dataset(&self, path: &str, recursive: bool, force: bool) -> Result<(), TrueNasError>;
}
