//! VM creation, reconfiguration and inventory for MockVSphereClient

use super::{MockVSphereClient, MockVm, lock, not_found, task_error};
use crate::error::VSphereError;
use crate::models::*;
use std::collections::HashMap;

const DISK_KEY_BASE: i32 = 2000;
const CDROM_KEY_BASE: i32 = 3000;
const NIC_KEY_BASE: i32 = 4000;
const OTHER_KEY_BASE: i32 = 9000;

pub(crate) fn vmx_path(datastore: &str, name: &str) -> String {
    format!("[{datastore}] {name}/{name}.vmx")
}

fn controller_key_base(kind: ControllerKind) -> i32 {
    match kind {
        ControllerKind::Pvscsi => 1000,
        ControllerKind::Sata => 15000,
        ControllerKind::Nvme => 31000,
    }
}

fn next_key(devices: &[VirtualDevice], base: i32) -> i32 {
    let used = devices
        .iter()
        .filter(|d| (base..base + 1000).contains(&d.key()))
        .count();
    base + i32::try_from(used).unwrap_or(0)
}

fn invalid_spec(method: &str, message: String) -> VSphereError {
    task_error(method, Some("InvalidDeviceSpec"), message)
}

/// Resolve a controller reference and check the requested unit number on it.
///
/// Several devices added to one controller in a single spec need explicit,
/// distinct units; the control plane rejects an add without one.
fn place_on_controller(
    method: &str,
    devices: &[VirtualDevice],
    keys: &HashMap<i32, i32>,
    controller_key: i32,
    unit_number: Option<i32>,
) -> Result<(i32, i32), VSphereError> {
    let controller_key = keys.get(&controller_key).copied().unwrap_or(controller_key);
    let kind = devices
        .iter()
        .find(|d| d.key() == controller_key)
        .and_then(VirtualDevice::controller_kind)
        .ok_or_else(|| invalid_spec(method, format!("controller {controller_key} does not exist")))?;

    let taken: Vec<i32> = devices
        .iter()
        .filter(|d| d.controller_key() == Some(controller_key))
        .filter_map(|d| match d {
            VirtualDevice::Disk { unit_number, .. } | VirtualDevice::Cdrom { unit_number, .. } => *unit_number,
            _ => None,
        })
        .collect();

    let unit = match unit_number {
        Some(unit) if taken.contains(&unit) || !kind.unit_numbers().any(|u| u == unit) => {
            return Err(invalid_spec(
                method,
                format!("unit {unit} on controller {controller_key} is not available"),
            ));
        }
        Some(unit) => unit,
        None => {
            return Err(invalid_spec(
                method,
                format!("device on controller {controller_key} has no unit number"),
            ));
        }
    };
    Ok((controller_key, unit))
}

/// Apply `changes` to `devices`, returning whether a disk was added
fn apply_changes(
    method: &str,
    vm_name: &str,
    datastore: &str,
    devices: &mut Vec<VirtualDevice>,
    changes: &[DeviceChange],
) -> Result<bool, VSphereError> {
    let mut keys: HashMap<i32, i32> = HashMap::new();
    let mut added_disk = false;

    for change in changes {
        match change.operation {
            DeviceOperation::Remove => {
                devices.retain(|d| d.key() != change.device.key());
                continue;
            }
            DeviceOperation::Edit => continue,
            DeviceOperation::Add => {}
        }

        let device = match &change.device {
            VirtualDevice::Controller {
                key,
                controller,
                bus_number,
            } => {
                let real = controller_key_base(*controller) + bus_number;
                if devices.iter().any(|d| d.key() == real) {
                    return Err(invalid_spec(
                        method,
                        format!("{} bus {bus_number} already exists", controller.type_name()),
                    ));
                }
                keys.insert(*key, real);
                VirtualDevice::Controller {
                    key: real,
                    controller: *controller,
                    bus_number: *bus_number,
                }
            }
            VirtualDevice::Disk {
                controller_key,
                unit_number,
                capacity_kb,
                thin,
                file_name,
                ..
            } => {
                if *capacity_kb == 0 {
                    return Err(invalid_spec(method, "disk capacity must be positive".to_string()));
                }
                let (controller_key, unit) = place_on_controller(method, devices, &keys, *controller_key, *unit_number)?;
                let disk_count = devices.iter().filter(|d| d.is_disk()).count();
                let file_name = file_name.clone().unwrap_or_else(|| match disk_count {
                    0 => format!("[{datastore}] {vm_name}/{vm_name}.vmdk"),
                    n => format!("[{datastore}] {vm_name}/{vm_name}_{n}.vmdk"),
                });
                added_disk = true;
                VirtualDevice::Disk {
                    key: next_key(devices, DISK_KEY_BASE),
                    controller_key,
                    unit_number: Some(unit),
                    capacity_kb: *capacity_kb,
                    thin: *thin,
                    file_name: Some(file_name),
                }
            }
            VirtualDevice::Cdrom {
                controller_key,
                unit_number,
                iso_path,
                ..
            } => {
                let (controller_key, unit) = place_on_controller(method, devices, &keys, *controller_key, *unit_number)?;
                VirtualDevice::Cdrom {
                    key: next_key(devices, CDROM_KEY_BASE),
                    controller_key,
                    unit_number: Some(unit),
                    iso_path: iso_path.clone(),
                }
            }
            VirtualDevice::Nic {
                model,
                network,
                mac_address,
                physical_function,
                ..
            } => {
                if *model == NicKind::Sriov && physical_function.is_none() {
                    return Err(invalid_spec(method, "SR-IOV adapter needs a physical function".to_string()));
                }
                VirtualDevice::Nic {
                    key: next_key(devices, NIC_KEY_BASE),
                    model: *model,
                    network: network.clone(),
                    mac_address: mac_address.clone(),
                    physical_function: physical_function.clone(),
                }
            }
            VirtualDevice::Other { type_name, .. } => VirtualDevice::Other {
                key: next_key(devices, OTHER_KEY_BASE),
                type_name: type_name.clone(),
            },
        };
        devices.push(device);
    }
    Ok(added_disk)
}

pub fn create_vm(client: &MockVSphereClient, spec: &VmSpec) -> Result<String, VSphereError> {
    client.record("CreateVM_Task", &spec.name)?;
    if client.vm_by_name(&spec.name).is_some() {
        return Err(task_error(
            "CreateVM_Task",
            Some("DuplicateName"),
            format!("The name '{}' already exists.", spec.name),
        ));
    }

    let mut devices = Vec::new();
    apply_changes("CreateVM_Task", &spec.name, &client.datastore, &mut devices, &spec.devices)?;

    let id = client.next_id();
    let info = VmInfo {
        id: id.clone(),
        name: spec.name.clone(),
        power_state: PowerState::PoweredOff,
        num_cpus: spec.num_cpus,
        memory_mb: spec.memory_mb,
        vmx_path: Some(vmx_path(&client.datastore, &spec.name)),
        devices,
    };
    lock(&client.vms).insert(
        id.clone(),
        MockVm {
            info,
            descriptor_stale: false,
        },
    );
    Ok(id)
}

pub fn reconfigure_vm(client: &MockVSphereClient, vm_id: &str, changes: &[DeviceChange]) -> Result<(), VSphereError> {
    client.record("ReconfigVM_Task", vm_id)?;
    let mut vms = lock(&client.vms);
    let vm = vms.get_mut(vm_id).ok_or_else(|| not_found(vm_id))?;

    // Apply to a copy so a rejected spec leaves the VM untouched
    let mut devices = vm.info.devices.clone();
    let added_disk = apply_changes("ReconfigVM_Task", &vm.info.name, &client.datastore, &mut devices, changes)?;
    vm.info.devices = devices;
    if added_disk {
        vm.descriptor_stale = true;
    }
    Ok(())
}

pub fn unregister_vm(client: &MockVSphereClient, vm_id: &str) -> Result<(), VSphereError> {
    client.record("UnregisterVM", vm_id)?;
    let vm = lock(&client.vms).remove(vm_id).ok_or_else(|| not_found(vm_id))?;
    if vm.info.power_state == PowerState::PoweredOn {
        let vm_id = vm.info.id.clone();
        lock(&client.vms).insert(vm_id, vm);
        return Err(VSphereError::Api {
            status: 500,
            fault: Some("InvalidPowerState".to_string()),
            message: "The attempted operation cannot be performed in the current state (Powered on).".to_string(),
        });
    }
    let path = vm
        .info
        .vmx_path
        .clone()
        .unwrap_or_else(|| vmx_path(&client.datastore, &vm.info.name));
    lock(&client.unregistered).insert(path, vm);
    Ok(())
}

pub fn register_vm(client: &MockVSphereClient, path: &str, name: &str) -> Result<String, VSphereError> {
    client.record("RegisterVM_Task", path)?;
    if client.vm_by_name(name).is_some() {
        return Err(task_error(
            "RegisterVM_Task",
            Some("AlreadyExists"),
            format!("The specified key, name, or identifier '{name}' already exists."),
        ));
    }
    let mut vm = lock(&client.unregistered).remove(path).ok_or_else(|| {
        task_error(
            "RegisterVM_Task",
            Some("FileNotFound"),
            format!("File {path} was not found"),
        )
    })?;

    let id = client.next_id();
    vm.info.id = id.clone();
    vm.info.name = name.to_string();
    vm.descriptor_stale = false;
    lock(&client.vms).insert(id.clone(), vm);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pvscsi() -> Vec<VirtualDevice> {
        vec![VirtualDevice::Controller {
            key: 1000,
            controller: ControllerKind::Pvscsi,
            bus_number: 0,
        }]
    }

    #[test]
    fn test_add_without_unit_number_is_rejected() {
        let err = place_on_controller("ReconfigVM_Task", &pvscsi(), &HashMap::new(), 1000, None).unwrap_err();
        assert!(err.to_string().contains("has no unit number"), "{err}");
    }

    #[test]
    fn test_scsi_slot_and_taken_units_are_rejected() {
        let mut devices = pvscsi();
        devices.push(VirtualDevice::Disk {
            key: 2000,
            controller_key: 1000,
            unit_number: Some(0),
            capacity_kb: 1024,
            thin: true,
            file_name: None,
        });

        assert!(place_on_controller("ReconfigVM_Task", &devices, &HashMap::new(), 1000, Some(0)).is_err());
        assert!(place_on_controller("ReconfigVM_Task", &devices, &HashMap::new(), 1000, Some(7)).is_err());
        assert_eq!(
            place_on_controller("ReconfigVM_Task", &devices, &HashMap::new(), 1000, Some(1)).unwrap(),
            (1000, 1)
        );
    }
}
