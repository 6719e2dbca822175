//! VM and device operations for MockTrueNasClient

use super::{MockTrueNasClient, lock, rpc_error};
use crate::error::TrueNasError;
use crate::models::*;

pub(crate) fn record_from_request(id: u64, request: &CreateVmRequest) -> VmRecord {
    VmRecord {
        id,
        name: request.name.clone(),
        description: request.description.clone(),
        vcpus: request.vcpus,
        cores: request.cores,
        threads: request.threads,
        memory: request.memory,
        bootloader: request.bootloader.clone(),
        autostart: request.autostart,
        status: VmStatus {
            state: "STOPPED".to_string(),
            pid: None,
        },
        devices: Vec::new(),
    }
}

/// Live VMs plus deleted ones that are still lingering, with devices filled in
fn visible_vms(client: &MockTrueNasClient) -> Vec<VmRecord> {
    let mut visible: Vec<VmRecord> = lock(&client.vms).values().cloned().collect();
    {
        let mut ghosts = lock(&client.ghosts);
        ghosts.retain(|_, (record, polls)| {
            if *polls == 0 {
                return false;
            }
            *polls -= 1;
            visible.push(record.clone());
            true
        });
    }
    for vm in &mut visible {
        vm.devices = client.vm_devices(vm.id);
    }
    visible.sort_by_key(|vm| vm.id);
    visible
}

pub fn query_vm(client: &MockTrueNasClient, name: &str) -> Result<Option<VmRecord>, TrueNasError> {
    client.record("vm.query", name)?;
    Ok(visible_vms(client).into_iter().find(|vm| vm.name == name))
}

pub fn list_vms(client: &MockTrueNasClient) -> Result<Vec<VmRecord>, TrueNasError> {
    client.record("vm.query", "*")?;
    Ok(visible_vms(client))
}

pub fn create_vm(client: &MockTrueNasClient, request: &CreateVmRequest) -> Result<VmRecord, TrueNasError> {
    client.record("vm.create", &request.name)?;
    if lock(&client.vms).values().any(|vm| vm.name == request.name) {
        return Err(rpc_error(
            "vm.create",
            "EEXIST",
            format!("VM {} already exists", request.name),
        ));
    }
    let record = record_from_request(client.next_id(), request);
    lock(&client.vms).insert(record.id, record.clone());
    Ok(record)
}

pub fn delete_vm(client: &MockTrueNasClient, id: u64) -> Result<(), TrueNasError> {
    client.record("vm.delete", &id.to_string())?;
    let Some(record) = lock(&client.vms).remove(&id) else {
        return Err(rpc_error("vm.delete", "ENOENT", format!("VM {id} does not exist")));
    };
    lock(&client.devices).retain(|_, device| device.vm != id);

    let polls = *lock(&client.linger_polls);
    if polls > 0 {
        lock(&client.ghosts).insert(id, (record, polls));
    }
    Ok(())
}

pub fn set_state(client: &MockTrueNasClient, method: &str, id: u64, state: &str) -> Result<(), TrueNasError> {
    client.record(method, &id.to_string())?;
    let mut vms = lock(&client.vms);
    let vm = vms
        .get_mut(&id)
        .ok_or_else(|| rpc_error(method, "ENOENT", format!("VM {id} does not exist")))?;
    vm.status.state = state.to_string();
    Ok(())
}

pub fn create_device(client: &MockTrueNasClient, request: &CreateDeviceRequest) -> Result<DeviceRecord, TrueNasError> {
    let dtype = request.attributes.dtype();
    client.record("vm.device.create", &format!("{}/{}", request.vm, dtype))?;

    if !lock(&client.vms).contains_key(&request.vm) {
        return Err(rpc_error(
            "vm.device.create",
            "ENOENT",
            format!("VM {} does not exist", request.vm),
        ));
    }
    if let DeviceAttributes::Disk { path, .. } = &request.attributes {
        let volume = path.strip_prefix("/dev/zvol/").unwrap_or(path);
        let exists = lock(&client.datasets).get(volume).is_some_and(Dataset::is_volume);
        if !exists {
            return Err(rpc_error(
                "vm.device.create",
                "EINVAL",
                format!("disk path {path} is not a zvol"),
            ));
        }
    }

    let mut attributes = serde_json::to_value(&request.attributes)?;
    if let Some(map) = attributes.as_object_mut() {
        map.remove("dtype");
    }
    let device = DeviceRecord {
        id: client.next_id(),
        vm: request.vm,
        dtype: Some(dtype.to_string()),
        attributes,
        order: Some(request.order),
    };
    lock(&client.devices).insert(device.id, device.clone());
    Ok(device)
}
