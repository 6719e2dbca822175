//! Device list for a TrueNAS VM
//!
//! The hypervisor layer initializes devices by ascending `order`, so the
//! list is built in boot-relevant order: CD-ROM, boot disk, NIC, display,
//! then secondary disks.

use truenas_client::{CreateDeviceRequest, DeviceAttributes, DiskMode, DisplayType};
use vm_model::{ConsoleAccess, ConsoleProtocol, DiskRole, StorageVolume, VmConfiguration};

/// `order` of the first device
const ORDER_BASE: u32 = 1000;

/// A device to attach and the label it is reported under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDevice {
    pub label: String,
    pub request: CreateDeviceRequest,
}

fn disk(volume: &StorageVolume) -> DeviceAttributes {
    DeviceAttributes::Disk {
        path: volume.device_path(),
        mode: DiskMode::Virtio,
        iotype: "THREADS".to_string(),
    }
}

fn display(console: &ConsoleAccess) -> DeviceAttributes {
    DeviceAttributes::Display {
        protocol: match console.protocol {
            ConsoleProtocol::Spice => DisplayType::Spice,
            ConsoleProtocol::Vnc => DisplayType::Vnc,
        },
        bind: console.bind.clone(),
        port: console.port,
        password: console.password.clone(),
        web: console.web && console.protocol == ConsoleProtocol::Spice,
    }
}

/// Devices for `vm_id` in attach order
pub fn plan_devices(config: &VmConfiguration, vm_id: u64, volumes: &[StorageVolume]) -> Vec<PlannedDevice> {
    let volume = |role: DiskRole| volumes.iter().find(|v| v.role == Some(role));
    let mut attributes: Vec<(String, DeviceAttributes)> = Vec::new();

    if let Some(media) = &config.install_media {
        attributes.push((
            "cdrom".to_string(),
            DeviceAttributes::Cdrom {
                path: media.as_str().to_string(),
            },
        ));
    }
    if let Some(boot) = volume(DiskRole::Boot) {
        attributes.push((DiskRole::Boot.to_string(), disk(boot)));
    }
    attributes.push((
        "nic".to_string(),
        DeviceAttributes::Nic {
            model: "VIRTIO".to_string(),
            nic_attach: config.network.network.clone(),
            mac: config.network.mac_address.clone(),
        },
    ));
    let console = config.console.clone().unwrap_or_default();
    attributes.push(("display".to_string(), display(&console)));
    for role in [DiskRole::SecondaryA, DiskRole::SecondaryB] {
        if let Some(secondary) = volume(role) {
            attributes.push((role.to_string(), disk(secondary)));
        }
    }

    attributes
        .into_iter()
        .zip(ORDER_BASE..)
        .map(|((label, attributes), order)| PlannedDevice {
            label,
            request: CreateDeviceRequest {
                vm: vm_id,
                attributes,
                order,
            },
        })
        .collect()
}
