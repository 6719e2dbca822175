//! Mock VSphereClient for unit testing
//!
//! Keeps an in-memory inventory and reproduces the control plane behaviour
//! the provisioner relies on: real device keys replace negative
//! placeholders, disks must reference an existing controller, and a VM
//! whose disks were added after creation refuses to power on until it has
//! been unregistered and registered again.
//!
//! - `vm.rs` - creation, device reconfiguration and inventory
//! - `power.rs` - power operations

mod power;
mod vm;

use crate::error::VSphereError;
use crate::models::*;
use crate::vsphere_trait::VSphereClientTrait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A VM known to the mock, registered or not
#[derive(Debug, Clone)]
pub(crate) struct MockVm {
    pub(crate) info: VmInfo,
    /// Disks were added since the descriptor was last loaded
    pub(crate) descriptor_stale: bool,
}

/// Mock VSphereClient for testing
#[derive(Clone, Default)]
pub struct MockVSphereClient {
    pub(crate) host: String,
    pub(crate) datastore: String,
    /// Registered VMs by id
    pub(crate) vms: Arc<Mutex<HashMap<String, MockVm>>>,
    /// Unregistered VMs by `.vmx` path
    pub(crate) unregistered: Arc<Mutex<HashMap<String, MockVm>>>,
    pub(crate) next_id: Arc<Mutex<u64>>,
    pub(crate) calls: Arc<Mutex<Vec<String>>>,
    pub(crate) failures: Arc<Mutex<HashMap<String, u32>>>,
    pub(crate) uploads: Arc<Mutex<Vec<(PathBuf, String)>>>,
}

impl std::fmt::Debug for MockVSphereClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockVSphereClient")
            .field("host", &self.host)
            .field("datastore", &self.datastore)
            .finish_non_exhaustive()
    }
}

impl MockVSphereClient {
    /// Create a new mock client
    pub fn new(host: impl Into<String>, datastore: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            datastore: datastore.into(),
            next_id: Arc::new(Mutex::new(1)),
            ..Self::default()
        }
    }

    /// Add a registered VM with no devices (for test setup)
    pub fn add_vm(&self, name: &str, power_state: PowerState) -> String {
        let id = self.next_id();
        let info = VmInfo {
            id: id.clone(),
            name: name.to_string(),
            power_state,
            num_cpus: 2,
            memory_mb: 4096,
            vmx_path: Some(vm::vmx_path(&self.datastore, name)),
            devices: Vec::new(),
        };
        lock(&self.vms).insert(
            id.clone(),
            MockVm {
                info,
                descriptor_stale: false,
            },
        );
        id
    }

    /// Fail the next `times` calls of `method` (vim25 method name, e.g. `PowerOnVM_Task`)
    pub fn fail_next(&self, method: &str, times: u32) {
        lock(&self.failures).insert(method.to_string(), times);
    }

    /// Fail the next `times` power-on attempts
    pub fn fail_power_on(&self, times: u32) {
        self.fail_next("PowerOnVM_Task", times);
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

    /// Registered VM by name
    pub fn vm_by_name(&self, name: &str) -> Option<VmInfo> {
        lock(&self.vms)
            .values()
            .find(|vm| vm.info.name == name)
            .map(|vm| vm.info.clone())
    }

    /// Whether a registered VM still runs on a descriptor older than its disks
    pub fn is_descriptor_stale(&self, name: &str) -> bool {
        lock(&self.vms)
            .values()
            .any(|vm| vm.info.name == name && vm.descriptor_stale)
    }

    /// Uploaded files as `(local path, datastore path)`
    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        lock(&self.uploads).clone()
    }

    pub(crate) fn next_id(&self) -> String {
        let mut id = lock(&self.next_id);
        let current = *id;
        *id += 1;
        current.to_string()
    }

    /// Record a call and apply any injected failure
    pub(crate) fn record(&self, method: &str, target: &str) -> Result<(), VSphereError> {
        lock(&self.calls).push(format!("{method}:{target}"));

        let mut failures = lock(&self.failures);
        if let Some(remaining) = failures.get_mut(method) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(task_error(method, None, "injected failure".to_string()));
            }
        }
        Ok(())
    }
}

pub(crate) fn task_error(method: &str, fault: Option<&str>, message: String) -> VSphereError {
    VSphereError::Task {
        operation: method.to_string(),
        fault: fault.map(str::to_string),
        message,
    }
}

pub(crate) fn not_found(id: &str) -> VSphereError {
    VSphereError::Api {
        status: 500,
        fault: Some("ManagedObjectNotFound".to_string()),
        message: format!("The object 'vim.VirtualMachine:{id}' has already been deleted or has not been completely created"),
    }
}

#[async_trait::async_trait]
impl VSphereClientTrait for MockVSphereClient {
    fn host(&self) -> &str {
        &self.host
    }

    fn datastore(&self) -> &str {
        &self.datastore
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<String, VSphereError> {
        vm::create_vm(self, spec)
    }

    async fn get_vm_info(&self, vm_id: &str) -> Result<VmInfo, VSphereError> {
        self.record("config", vm_id)?;
        lock(&self.vms)
            .get(vm_id)
            .map(|vm| vm.info.clone())
            .ok_or_else(|| not_found(vm_id))
    }

    async fn reconfigure_vm(&self, vm_id: &str, changes: &[DeviceChange]) -> Result<(), VSphereError> {
        vm::reconfigure_vm(self, vm_id, changes)
    }

    async fn unregister_vm(&self, vm_id: &str) -> Result<(), VSphereError> {
        vm::unregister_vm(self, vm_id)
    }

    async fn register_vm(&self, vmx_path: &str, name: &str) -> Result<String, VSphereError> {
        vm::register_vm(self, vmx_path, name)
    }

    async fn find_vm(&self, name: &str) -> Result<Option<VmInfo>, VSphereError> {
        self.record("childEntity", name)?;
        Ok(self.vm_by_name(name))
    }

    async fn list_vms(&self) -> Result<Vec<VmInfo>, VSphereError> {
        self.record("childEntity", "*")?;
        let mut vms: Vec<VmInfo> = lock(&self.vms).values().map(|vm| vm.info.clone()).collect();
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vms)
    }

    async fn power_on(&self, vm_id: &str) -> Result<(), VSphereError> {
        power::power_on(self, vm_id)
    }

    async fn power_off(&self, vm_id: &str) -> Result<(), VSphereError> {
        power::power_off(self, vm_id)
    }

    async fn destroy_vm(&self, vm_id: &str) -> Result<(), VSphereError> {
        power::destroy_vm(self, vm_id)
    }

    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<String, VSphereError> {
        self.record("upload", remote_path)?;
        if !local_path.exists() {
            return Err(VSphereError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", local_path.display()),
            )));
        }
        let datastore_path = format!("[{}] {}", self.datastore, remote_path.trim_start_matches('/'));
        lock(&self.uploads).push((local_path.to_path_buf(), datastore_path.clone()));
        Ok(datastore_path)
    }
}
