//! Device specs for a vSphere VM
//!
//! The shell carries everything except disks. Disks are added in a second
//! reconfiguration once the control plane has assigned real controller keys.

use crate::error::ProvisionError;
use std::collections::{BTreeSet, HashMap};
use tracing::warn;
use vm_model::{ConsoleProtocol, DiskBus, DiskRole, VmConfiguration};
use vsphere_client::{ControllerKind, DeviceChange, NicKind, VSphereError, VirtualDevice, VmSpec};

pub fn controller_kind(bus: DiskBus) -> ControllerKind {
    match bus {
        DiskBus::Nvme => ControllerKind::Nvme,
        DiskBus::Pvscsi => ControllerKind::Pvscsi,
        DiskBus::Sata => ControllerKind::Sata,
    }
}

/// Controller kinds the disks of `config` need, one per bus generation
fn disk_controllers(config: &VmConfiguration) -> BTreeSet<ControllerKind> {
    config.disks.iter().map(|d| controller_kind(d.bus)).collect()
}

/// `CreateVM_Task` spec without disks.
///
/// `iso_path` is the datastore path of already staged install media.
pub fn shell_spec(config: &VmConfiguration, iso_path: Option<&str>) -> VmSpec {
    let mut spec = VmSpec::new(config.name.as_str(), config.vcpus, config.memory_mb);
    let mut next_key = -1;
    let mut placeholder = || {
        let key = next_key;
        next_key -= 1;
        key
    };

    let controllers = disk_controllers(config);
    for kind in &controllers {
        spec.devices.push(DeviceChange::add(VirtualDevice::Controller {
            key: placeholder(),
            controller: *kind,
            bus_number: 0,
        }));
    }

    if let Some(iso_path) = iso_path {
        // The CD-ROM gets its own SATA controller, after any SATA disk controller
        let bus_number = i32::from(controllers.contains(&ControllerKind::Sata));
        let controller_key = placeholder();
        spec.devices.push(DeviceChange::add(VirtualDevice::Controller {
            key: controller_key,
            controller: ControllerKind::Sata,
            bus_number,
        }));
        spec.devices.push(DeviceChange::add(VirtualDevice::Cdrom {
            key: placeholder(),
            controller_key,
            unit_number: Some(0),
            iso_path: iso_path.to_string(),
        }));
    }

    let sriov = config.network.physical_function.is_some();
    spec.devices.push(DeviceChange::add(VirtualDevice::Nic {
        key: placeholder(),
        model: if sriov { NicKind::Sriov } else { NicKind::Vmxnet3 },
        network: config.network.network.clone(),
        mac_address: config.network.mac_address.clone(),
        physical_function: config.network.physical_function.clone(),
    }));
    spec.memory_reservation_locked = sriov;

    if let Some(console) = &config.console {
        match console.protocol {
            ConsoleProtocol::Vnc => {
                spec.extra_config.push(("RemoteDisplay.vnc.enabled".to_string(), "TRUE".to_string()));
                if let Some(port) = console.port {
                    spec.extra_config.push(("RemoteDisplay.vnc.port".to_string(), port.to_string()));
                }
                if let Some(password) = &console.password {
                    spec.extra_config.push(("RemoteDisplay.vnc.password".to_string(), password.clone()));
                }
            }
            ConsoleProtocol::Spice => {
                warn!("VM {}: SPICE consoles are not available on vSphere, ignoring", config.name);
            }
        }
    }

    spec
}

/// Bus 0 controller of `kind` among `devices`
fn controller_key(devices: &[VirtualDevice], kind: ControllerKind) -> Option<i32> {
    devices.iter().find_map(|d| match d {
        VirtualDevice::Controller {
            key,
            controller,
            bus_number: 0,
        } if *controller == kind => Some(*key),
        _ => None,
    })
}

/// Unit numbers already occupied on `controller_key`
fn taken_units(devices: &[VirtualDevice], controller_key: i32) -> Vec<i32> {
    devices
        .iter()
        .filter(|d| d.controller_key() == Some(controller_key))
        .filter_map(|d| match d {
            VirtualDevice::Disk { unit_number, .. } | VirtualDevice::Cdrom { unit_number, .. } => *unit_number,
            _ => None,
        })
        .collect()
}

/// One disk add per configured disk, wired to the real controller keys in `devices`.
///
/// Each disk gets the next free unit on its controller, so disks sharing a
/// controller in one reconfiguration never collide.
pub fn disk_changes(config: &VmConfiguration, devices: &[VirtualDevice]) -> Result<Vec<DeviceChange>, ProvisionError> {
    let mut changes = Vec::new();
    let mut taken: HashMap<i32, Vec<i32>> = HashMap::new();
    let mut key = -1;
    for role in DiskRole::ALL {
        let Some(disk) = config.disk(role) else {
            continue;
        };
        let target = || format!("{}/{}", config.name, role);
        let kind = controller_kind(disk.bus);
        let controller_key = controller_key(devices, kind).ok_or_else(|| {
            ProvisionError::vsphere(
                "ReconfigVM_Task",
                target(),
                VSphereError::InvalidRequest(format!("VM has no {} controller", kind.type_name())),
            )
        })?;
        let used = taken
            .entry(controller_key)
            .or_insert_with(|| taken_units(devices, controller_key));
        let unit = kind.unit_numbers().find(|u| !used.contains(u)).ok_or_else(|| {
            ProvisionError::vsphere(
                "ReconfigVM_Task",
                target(),
                VSphereError::InvalidRequest(format!("{} {controller_key} has no free unit", kind.type_name())),
            )
        })?;
        used.push(unit);
        changes.push(DeviceChange::add(VirtualDevice::Disk {
            key,
            controller_key,
            unit_number: Some(unit),
            capacity_kb: disk.size_kb(),
            thin: disk.provisioning.is_thin(),
            file_name: None,
        }));
        key -= 1;
    }
    Ok(changes)
}
