//! VM configuration types
//!
//! These types are deserialized straight from the provisioner settings file,
//! so field names follow the YAML convention (`snake_case`, kebab-case enums).

use crate::error::ModelError;
use crate::naming::{validate_vm_name, Backend};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Role of a disk inside a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiskRole {
    /// OS disk, the only one the VM boots from
    Boot,
    /// First data disk (block storage for workloads)
    SecondaryA,
    /// Second data disk (distributed storage)
    SecondaryB,
}

impl DiskRole {
    /// All roles, in device attach order
    pub const ALL: [DiskRole; 3] = [DiskRole::Boot, DiskRole::SecondaryA, DiskRole::SecondaryB];

    /// Suffix used by the volume naming convention
    pub fn suffix(self) -> &'static str {
        match self {
            DiskRole::Boot => "boot",
            DiskRole::SecondaryA => "ebs",
            DiskRole::SecondaryB => "rook",
        }
    }

    /// Reverse of [`DiskRole::suffix`]
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.suffix() == suffix)
    }
}

impl std::fmt::Display for DiskRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskRole::Boot => write!(f, "boot"),
            DiskRole::SecondaryA => write!(f, "secondary-a"),
            DiskRole::SecondaryB => write!(f, "secondary-b"),
        }
    }
}

/// Storage provisioning mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provisioning {
    /// Sparse, grows on demand
    #[default]
    Thin,
    /// Fully allocated up front
    Thick,
}

impl Provisioning {
    pub fn is_thin(self) -> bool {
        self == Provisioning::Thin
    }
}

/// Disk bus generation (vSphere only; TrueNAS always uses virtio)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    #[default]
    Nvme,
    Pvscsi,
    Sata,
}

/// One disk of the VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub role: DiskRole,
    pub size_gb: u64,
    #[serde(default)]
    pub provisioning: Provisioning,
    #[serde(default)]
    pub bus: DiskBus,
}

impl DiskSpec {
    /// Thin-provisioned disk on the default bus
    pub fn new(role: DiskRole, size_gb: u64) -> Self {
        Self {
            role,
            size_gb,
            provisioning: Provisioning::Thin,
            bus: DiskBus::default(),
        }
    }

    #[must_use]
    pub fn thick(mut self) -> Self {
        self.provisioning = Provisioning::Thick;
        self
    }

    #[must_use]
    pub fn on_bus(mut self, bus: DiskBus) -> Self {
        self.bus = bus;
        self
    }

    /// Size in bytes (sizes are GiB)
    pub fn size_bytes(&self) -> u64 {
        self.size_gb * 1024 * 1024 * 1024
    }

    /// Size in KiB, the unit vSphere disks are declared in
    pub fn size_kb(&self) -> u64 {
        self.size_gb * 1024 * 1024
    }
}

/// Network attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Bridge (TrueNAS) or port group (vSphere) name
    pub network: String,
    /// Static MAC address; generated by the control plane when absent
    #[serde(default)]
    pub mac_address: Option<String>,
    /// SR-IOV physical function PCI id, e.g. `0000:3b:00.0` (vSphere only)
    #[serde(default)]
    pub physical_function: Option<String>,
}

/// Where the install image lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMediaKind {
    /// `http(s)://...`
    Url,
    /// vSphere datastore path, `[datastore] folder/file.iso`
    DatastorePath,
    /// A path local to the control plane (TrueNAS) or to the caller (vSphere upload)
    LocalPath,
}

/// Install media reference (URL or backend-local path to a bootable image)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstallMedia(pub String);

impl InstallMedia {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> InstallMediaKind {
        let location = self.0.trim();
        if location.starts_with("http://") || location.starts_with("https://") {
            InstallMediaKind::Url
        } else if location.starts_with('[') && location.contains("] ") {
            InstallMediaKind::DatastorePath
        } else {
            InstallMediaKind::LocalPath
        }
    }

    /// Final path component, used as the upload name when staging media
    pub fn file_name(&self) -> &str {
        self.0.rsplit(['/', '\\']).next().unwrap_or(&self.0)
    }
}

/// Custom image metadata, display and audit only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomImage {
    /// Image factory schematic identifier
    pub schematic_id: String,
    /// Image version, e.g. `v1.9.1`
    pub version: String,
}

/// Remote console protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleProtocol {
    #[default]
    Spice,
    Vnc,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

/// Console access
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleAccess {
    #[serde(default)]
    pub protocol: ConsoleProtocol,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub password: Option<String>,
    /// Expose the web client (TrueNAS SPICE only)
    #[serde(default = "default_true")]
    pub web: bool,
}

impl Default for ConsoleAccess {
    fn default() -> Self {
        Self {
            protocol: ConsoleProtocol::Spice,
            bind: default_bind(),
            port: None,
            password: None,
            web: true,
        }
    }
}

/// The provisioning request for one VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfiguration {
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    pub network: NetworkAttachment,
    #[serde(default)]
    pub install_media: Option<InstallMedia>,
    #[serde(default)]
    pub custom_image: Option<CustomImage>,
    #[serde(default)]
    pub console: Option<ConsoleAccess>,
    /// Volumes already exist: verify them instead of creating them
    #[serde(default)]
    pub skip_volume_creation: bool,
    /// Power the VM on once it is fully built
    #[serde(default)]
    pub power_on: bool,
}

impl VmConfiguration {
    /// Minimal configuration with no disks, no media and power-on disabled
    pub fn new(name: impl Into<String>, vcpus: u32, memory_mb: u64, network: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vcpus,
            memory_mb,
            disks: Vec::new(),
            network: NetworkAttachment {
                network: network.into(),
                mac_address: None,
                physical_function: None,
            },
            install_media: None,
            custom_image: None,
            console: None,
            skip_volume_creation: false,
            power_on: false,
        }
    }

    #[must_use]
    pub fn with_disk(mut self, disk: DiskSpec) -> Self {
        self.disks.push(disk);
        self
    }

    #[must_use]
    pub fn with_install_media(mut self, media: impl Into<String>) -> Self {
        self.install_media = Some(InstallMedia::new(media));
        self
    }

    #[must_use]
    pub fn with_mac_address(mut self, mac: impl Into<String>) -> Self {
        self.network.mac_address = Some(mac.into());
        self
    }

    #[must_use]
    pub fn with_physical_function(mut self, pf: impl Into<String>) -> Self {
        self.network.physical_function = Some(pf.into());
        self
    }

    #[must_use]
    pub fn with_console(mut self, console: ConsoleAccess) -> Self {
        self.console = Some(console);
        self
    }

    #[must_use]
    pub fn with_custom_image(mut self, schematic_id: impl Into<String>, version: impl Into<String>) -> Self {
        self.custom_image = Some(CustomImage {
            schematic_id: schematic_id.into(),
            version: version.into(),
        });
        self
    }

    #[must_use]
    pub fn powered_on(mut self, power_on: bool) -> Self {
        self.power_on = power_on;
        self
    }

    #[must_use]
    pub fn skipping_volume_creation(mut self, skip: bool) -> Self {
        self.skip_volume_creation = skip;
        self
    }

    /// First disk with `role`
    pub fn disk(&self, role: DiskRole) -> Option<&DiskSpec> {
        self.disks.iter().find(|d| d.role == role)
    }

    pub fn boot_disk(&self) -> Option<&DiskSpec> {
        self.disk(DiskRole::Boot)
    }

    /// Disks other than boot, in attach order
    pub fn secondary_disks(&self) -> impl Iterator<Item = &DiskSpec> {
        DiskRole::ALL[1..].iter().filter_map(|role| self.disk(*role))
    }

    /// Validate everything that can be checked without a control plane.
    pub fn validate(&self, backend: Backend) -> Result<(), ModelError> {
        validate_vm_name(&self.name, backend)?;

        let invalid = |reason: String| ModelError::InvalidConfig {
            name: self.name.clone(),
            reason,
        };

        if self.vcpus == 0 {
            return Err(invalid("vcpus must be at least 1".to_string()));
        }
        if self.memory_mb == 0 {
            return Err(invalid("memory_mb must be greater than 0".to_string()));
        }
        if self.network.network.trim().is_empty() {
            return Err(invalid("network name must not be empty".to_string()));
        }
        if let Some(mac) = &self.network.mac_address {
            if !is_valid_mac(mac) {
                return Err(invalid(format!("invalid MAC address {mac:?}")));
            }
        }
        if backend == Backend::TrueNas && self.network.physical_function.is_some() {
            return Err(invalid("SR-IOV physical functions are only supported on vSphere".to_string()));
        }

        if self.boot_disk().is_none() {
            return Err(invalid("a boot disk is required".to_string()));
        }
        let mut seen = HashSet::new();
        for disk in &self.disks {
            if !seen.insert(disk.role) {
                return Err(invalid(format!("disk role {} is declared more than once", disk.role)));
            }
            if disk.size_gb == 0 {
                return Err(invalid(format!("disk {} must have a non-zero size", disk.role)));
            }
        }

        if let Some(media) = &self.install_media {
            if media.as_str().trim().is_empty() {
                return Err(invalid("install media must not be empty".to_string()));
            }
            if backend == Backend::VSphere && media.kind() == InstallMediaKind::Url {
                return Err(invalid(
                    "vSphere CD-ROMs cannot boot from a URL; use a datastore or local path".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn is_valid_mac(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}
