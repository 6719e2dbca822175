//! vSphere data models
//!
//! A typed subset of the vim25 data objects the provisioner touches. The
//! VI/JSON wire form (with `_typeName` discriminators) lives in `wire.rs`.

use serde::{Deserialize, Serialize};

/// Connection and placement parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VSphereConfig {
    /// vCenter or ESXi host name
    pub host: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    #[serde(default = "default_datacenter")]
    pub datacenter: String,
    /// Datastore VM files and uploaded install media go to
    pub datastore: String,
    /// VM folder managed object id
    #[serde(default = "default_folder")]
    pub folder: String,
    /// Resource pool managed object id
    #[serde(default = "default_resource_pool")]
    pub resource_pool: String,
    /// vim25 release used in request paths
    #[serde(default = "default_release")]
    pub api_release: String,
}

fn default_true() -> bool {
    true
}

fn default_datacenter() -> String {
    "ha-datacenter".to_string()
}

fn default_folder() -> String {
    "ha-folder-vm".to_string()
}

fn default_resource_pool() -> String {
    "ha-root-pool".to_string()
}

fn default_release() -> String {
    "8.0.2.0".to_string()
}

impl VSphereConfig {
    /// Standalone ESXi defaults for folder, pool and datacenter
    pub fn esxi(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>, datastore: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            verify_tls: true,
            datacenter: default_datacenter(),
            datastore: datastore.into(),
            folder: default_folder(),
            resource_pool: default_resource_pool(),
            api_release: default_release(),
        }
    }
}

/// Storage controller generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    Pvscsi,
    Nvme,
    Sata,
}

impl ControllerKind {
    /// vSphere managed object type name
    pub fn type_name(self) -> &'static str {
        match self {
            ControllerKind::Pvscsi => "ParaVirtualSCSIController",
            ControllerKind::Nvme => "VirtualNVMEController",
            ControllerKind::Sata => "VirtualAHCIController",
        }
    }

    /// Inverse of [`ControllerKind::type_name`]
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "ParaVirtualSCSIController" => Some(ControllerKind::Pvscsi),
            "VirtualNVMEController" => Some(ControllerKind::Nvme),
            "VirtualAHCIController" => Some(ControllerKind::Sata),
            _ => None,
        }
    }

    /// Usable unit numbers on one controller of this kind
    pub fn unit_numbers(self) -> impl Iterator<Item = i32> {
        let (count, reserved) = match self {
            // unit 7 is the SCSI controller itself
            ControllerKind::Pvscsi => (16, Some(7)),
            ControllerKind::Nvme => (15, None),
            ControllerKind::Sata => (30, None),
        };
        (0..count).filter(move |unit| Some(*unit) != reserved)
    }
}

/// Network adapter model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicKind {
    Vmxnet3,
    Sriov,
}

impl NicKind {
    /// vSphere managed object type name
    pub fn type_name(self) -> &'static str {
        match self {
            NicKind::Vmxnet3 => "VirtualVmxnet3",
            NicKind::Sriov => "VirtualSriovEthernetCard",
        }
    }
}

/// One virtual device.
///
/// Keys are negative placeholders until the control plane assigns real ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VirtualDevice {
    Controller {
        key: i32,
        controller: ControllerKind,
        bus_number: i32,
    },
    Disk {
        key: i32,
        controller_key: i32,
        unit_number: Option<i32>,
        capacity_kb: u64,
        thin: bool,
        /// Backing file, empty until the control plane creates it
        file_name: Option<String>,
    },
    Cdrom {
        key: i32,
        controller_key: i32,
        unit_number: Option<i32>,
        /// Datastore path of the ISO, `[datastore] path/file.iso`
        iso_path: String,
    },
    Nic {
        key: i32,
        model: NicKind,
        network: String,
        mac_address: Option<String>,
        /// PCI id of the SR-IOV physical function
        physical_function: Option<String>,
    },
    /// Any device type not modelled above
    Other { key: i32, type_name: String },
}

impl VirtualDevice {
    /// Device key, unique within one VM
    pub fn key(&self) -> i32 {
        match self {
            VirtualDevice::Controller { key, .. }
            | VirtualDevice::Disk { key, .. }
            | VirtualDevice::Cdrom { key, .. }
            | VirtualDevice::Nic { key, .. }
            | VirtualDevice::Other { key, .. } => *key,
        }
    }

    /// Key of the controller a disk or CD-ROM is attached to
    pub fn controller_key(&self) -> Option<i32> {
        match self {
            VirtualDevice::Disk { controller_key, .. } | VirtualDevice::Cdrom { controller_key, .. } => {
                Some(*controller_key)
            }
            _ => None,
        }
    }

    pub fn is_disk(&self) -> bool {
        matches!(self, VirtualDevice::Disk { .. })
    }

    /// Controller kind, for controller devices
    pub fn controller_kind(&self) -> Option<ControllerKind> {
        match self {
            VirtualDevice::Controller { controller, .. } => Some(*controller),
            _ => None,
        }
    }
}

/// Device change operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceOperation {
    Add,
    Remove,
    Edit,
}

/// One entry of a `deviceChange` list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceChange {
    pub operation: DeviceOperation,
    /// Create the backing file (new disks)
    pub create_file: bool,
    pub device: VirtualDevice,
}

impl DeviceChange {
    /// Add `device`, creating a backing file for disks
    pub fn add(device: VirtualDevice) -> Self {
        let create_file = device.is_disk();
        Self {
            operation: DeviceOperation::Add,
            create_file,
            device,
        }
    }
}

/// Spec for `CreateVM_Task`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub guest_id: String,
    pub num_cpus: u32,
    pub memory_mb: u64,
    /// Reserve all guest memory (required for SR-IOV passthrough)
    pub memory_reservation_locked: bool,
    pub firmware: String,
    pub devices: Vec<DeviceChange>,
    /// `extraConfig` key/value options
    pub extra_config: Vec<(String, String)>,
}

impl VmSpec {
    pub fn new(name: impl Into<String>, num_cpus: u32, memory_mb: u64) -> Self {
        Self {
            name: name.into(),
            guest_id: "otherLinux64Guest".to_string(),
            num_cpus,
            memory_mb,
            memory_reservation_locked: false,
            firmware: "efi".to_string(),
            devices: Vec::new(),
            extra_config: Vec::new(),
        }
    }
}

/// VM power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            PowerState::PoweredOn => "poweredOn",
            PowerState::PoweredOff => "poweredOff",
            PowerState::Suspended => "suspended",
        };
        f.write_str(state)
    }
}

/// VM properties the provisioner reads back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    /// Managed object id, e.g. `12` on ESXi or `vm-1042` on vCenter
    pub id: String,
    pub name: String,
    pub power_state: PowerState,
    pub num_cpus: u32,
    pub memory_mb: u64,
    /// Datastore path of the `.vmx` descriptor
    pub vmx_path: Option<String>,
    pub devices: Vec<VirtualDevice>,
}

impl VmInfo {
    pub fn controllers(&self) -> impl Iterator<Item = &VirtualDevice> {
        self.devices.iter().filter(|d| d.controller_kind().is_some())
    }

    pub fn disks(&self) -> impl Iterator<Item = &VirtualDevice> {
        self.devices.iter().filter(|d| d.is_disk())
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_type_names_round_trip_known_kinds() {
        for kind in [ControllerKind::Pvscsi, ControllerKind::Nvme, ControllerKind::Sata] {
            assert_eq!(ControllerKind::from_type_name(kind.type_name()), Some(kind));
        }
        assert_eq!(ControllerKind::from_type_name("VirtualLsiLogicController"), None);
    }

    #[test]
    fn test_scsi_units_skip_controller_slot() {
        let units: Vec<i32> = ControllerKind::Pvscsi.unit_numbers().collect();
        assert_eq!(units.len(), 15);
        assert!(!units.contains(&7));
        assert_eq!(ControllerKind::Nvme.unit_numbers().count(), 15);
    }

    #[test]
    fn test_new_disks_create_their_backing_file() {
        let disk = DeviceChange::add(VirtualDevice::Disk {
            key: -1,
            controller_key: 31000,
            unit_number: Some(0),
            capacity_kb: 1024,
            thin: true,
            file_name: None,
        });
        assert!(disk.create_file);

        let nic = DeviceChange::add(VirtualDevice::Nic {
            key: -2,
            model: NicKind::Vmxnet3,
            network: "VM Network".to_string(),
            mac_address: None,
            physical_function: None,
        });
        assert!(!nic.create_file);
    }
}
