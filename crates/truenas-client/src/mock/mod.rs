//! Mock TrueNasClient for unit testing
//!
//! Stores VMs, devices and datasets in memory and enforces the middleware
//! rules the provisioner depends on: dataset parents must exist, names are
//! unique, disk devices must point at an existing ZVol.
//!
//! - `vm.rs` - VM and device operations
//! - `pool.rs` - dataset operations

mod pool;
mod vm;

use crate::error::TrueNasError;
use crate::models::*;
use crate::truenas_trait::TrueNasClientTrait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lock a mock store, ignoring poisoning from a panicked test thread
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock TrueNasClient for testing
#[derive(Clone, Default)]
pub struct MockTrueNasClient {
    pub(crate) host: String,
    pub(crate) vms: Arc<Mutex<HashMap<u64, VmRecord>>>,
    pub(crate) devices: Arc<Mutex<HashMap<u64, DeviceRecord>>>,
    pub(crate) datasets: Arc<Mutex<BTreeMap<String, Dataset>>>,
    /// Deleted VMs still reported by queries, with the number of queries left
    pub(crate) ghosts: Arc<Mutex<HashMap<u64, (VmRecord, u32)>>>,
    pub(crate) linger_polls: Arc<Mutex<u32>>,
    pub(crate) next_id: Arc<Mutex<u64>>,
    pub(crate) calls: Arc<Mutex<Vec<String>>>,
    /// Remaining injected failures per method
    pub(crate) failures: Arc<Mutex<HashMap<String, u32>>>,
    /// `method:target` pairs that always fail
    pub(crate) failing_targets: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for MockTrueNasClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTrueNasClient").field("host", &self.host).finish_non_exhaustive()
    }
}

impl MockTrueNasClient {
    /// Create a new mock client
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            next_id: Arc::new(Mutex::new(1)),
            ..Self::default()
        }
    }

    /// Add a pool root dataset (for test setup)
    pub fn add_pool(&self, name: &str) {
        self.insert_dataset(name, DatasetType::Filesystem, None);
    }

    /// Add an existing ZVol (for test setup); parents are not checked
    pub fn add_volume(&self, path: &str, size_bytes: u64) {
        self.insert_dataset(path, DatasetType::Volume, Some(size_bytes));
    }

    /// Add a VM with no devices (for test setup)
    pub fn add_vm(&self, name: &str) -> u64 {
        let id = self.next_id();
        let record = vm::record_from_request(id, &CreateVmRequest::new(name, 2, 4096));
        lock(&self.vms).insert(id, record);
        id
    }

    /// Attach a disk device backed by `volume_path` (for test setup)
    pub fn attach_disk(&self, vm_id: u64, volume_path: &str) {
        let id = self.next_id();
        let device = DeviceRecord {
            id,
            vm: vm_id,
            dtype: Some("DISK".to_string()),
            attributes: serde_json::json!({"path": format!("/dev/zvol/{volume_path}"), "type": "VIRTIO"}),
            order: Some(1000 + u32::try_from(id).unwrap_or(0)),
        };
        lock(&self.devices).insert(id, device);
    }

    /// Fail the next `times` calls of `method`
    pub fn fail_next(&self, method: &str, times: u32) {
        lock(&self.failures).insert(method.to_string(), times);
    }

    /// Always fail `method` for `target` (VM id or dataset path)
    pub fn fail_target(&self, method: &str, target: &str) {
        lock(&self.failing_targets).insert(format!("{method}:{target}"));
    }

    /// Keep deleted VMs visible to the next `polls` queries
    pub fn linger_deleted_vms(&self, polls: u32) {
        *lock(&self.linger_polls) = polls;
    }

    /// Every call made so far, as `method:target`
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Number of calls made to `method`
    pub fn call_count(&self, method: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| call.split(':').next() == Some(method))
            .count()
    }

    /// Paths of every dataset of `kind`
    pub fn dataset_paths(&self, kind: DatasetType) -> Vec<String> {
        lock(&self.datasets)
            .values()
            .filter(|d| d.kind == kind)
            .map(|d| d.id.clone())
            .collect()
    }

    /// Devices of `vm_id` sorted by `order`
    pub fn vm_devices(&self, vm_id: u64) -> Vec<DeviceRecord> {
        let mut devices: Vec<DeviceRecord> = lock(&self.devices)
            .values()
            .filter(|d| d.vm == vm_id)
            .cloned()
            .collect();
        devices.sort_by_key(|d| d.order.unwrap_or(u32::MAX));
        devices
    }

    pub(crate) fn next_id(&self) -> u64 {
        let mut id = lock(&self.next_id);
        let current = *id;
        *id += 1;
        current
    }

    pub(crate) fn insert_dataset(&self, path: &str, kind: DatasetType, volsize: Option<u64>) -> Dataset {
        let dataset = Dataset {
            id: path.to_string(),
            name: path.to_string(),
            kind,
            volsize: volsize.map(|bytes| PropertyValue {
                parsed: serde_json::json!(bytes),
                rawvalue: Some(bytes.to_string()),
            }),
        };
        lock(&self.datasets).insert(path.to_string(), dataset.clone());
        dataset
    }

    /// Record a call and apply any injected failure
    pub(crate) fn record(&self, method: &str, target: &str) -> Result<(), TrueNasError> {
        lock(&self.calls).push(format!("{method}:{target}"));

        if lock(&self.failing_targets).contains(&format!("{method}:{target}")) {
            return Err(injected(method));
        }
        let mut failures = lock(&self.failures);
        if let Some(remaining) = failures.get_mut(method) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(injected(method));
            }
        }
        Ok(())
    }
}

fn injected(method: &str) -> TrueNasError {
    TrueNasError::Rpc {
        method: method.to_string(),
        code: -32001,
        message: "injected failure".to_string(),
        errname: None,
    }
}

pub(crate) fn rpc_error(method: &str, errname: &str, message: String) -> TrueNasError {
    TrueNasError::Rpc {
        method: method.to_string(),
        code: -32001,
        message,
        errname: Some(errname.to_string()),
    }
}

#[async_trait::async_trait]
impl TrueNasClientTrait for MockTrueNasClient {
    fn host(&self) -> &str {
        &self.host
    }

    // VM operations - delegated to vm module
    async fn query_vm(&self, name: &str) -> Result<Option<VmRecord>, TrueNasError> {
        vm::query_vm(self, name)
    }

    async fn list_vms(&self) -> Result<Vec<VmRecord>, TrueNasError> {
        vm::list_vms(self)
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> Result<VmRecord, TrueNasError> {
        vm::create_vm(self, request)
    }

    async fn delete_vm(&self, id: u64) -> Result<(), TrueNasError> {
        vm::delete_vm(self, id)
    }

    async fn start_vm(&self, id: u64) -> Result<(), TrueNasError> {
        vm::set_state(self, "vm.start", id, "RUNNING")
    }

    async fn stop_vm(&self, id: u64, _force: bool) -> Result<(), TrueNasError> {
        vm::set_state(self, "vm.stop", id, "STOPPED")
    }

    async fn query_devices(&self, vm_id: u64) -> Result<Vec<DeviceRecord>, TrueNasError> {
        self.record("vm.device.query", &vm_id.to_string())?;
        Ok(self.vm_devices(vm_id))
    }

    async fn create_device(&self, request: &CreateDeviceRequest) -> Result<DeviceRecord, TrueNasError> {
        vm::create_device(self, request)
    }

    // Dataset operations - delegated to pool module
    async fn get_dataset(&self, path: &str) -> Result<Option<Dataset>, TrueNasError> {
        pool::get_dataset(self, path)
    }

    async fn query_datasets(&self, kind: Option<DatasetType>) -> Result<Vec<Dataset>, TrueNasError> {
        pool::query_datasets(self, kind)
    }

    async fn create_dataset(&self, request: &CreateDatasetRequest) -> Result<Dataset, TrueNasError> {
        pool::create_dataset(self, request)
    }

    async fn delete_dataset(&self, path: &str, recursive: bool, force: bool) -> Result<(), TrueNasError> {
        pool::delete_dataset(self, path, recursive, force)
    }
}
