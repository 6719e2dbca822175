//! TrueNAS middleware data models
//!
//! Shapes follow the `vm.*`, `vm.device.*`, `pool.dataset.*` and `core.*`
//! namespaces of the middleware API.

use serde::{Deserialize, Serialize};

/// Runtime status of a VM
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VmStatus {
    /// `RUNNING`, `STOPPED`, `SUSPENDED`, ...
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub pid: Option<i64>,
}

impl VmStatus {
    /// Whether the middleware reports the VM as `RUNNING`
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("RUNNING")
    }
}

/// VM object as returned by `vm.query`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub vcpus: u32,
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub threads: u32,
    /// Memory in MiB
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub bootloader: String,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub status: VmStatus,
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
}

/// Request body for `vm.create`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateVmRequest {
    pub name: String,
    pub description: String,
    pub vcpus: u32,
    pub cores: u32,
    pub threads: u32,
    /// Memory in MiB
    pub memory: u64,
    pub bootloader: String,
    pub autostart: bool,
    pub time: String,
}

impl CreateVmRequest {
    /// UEFI VM with one core/thread per vCPU socket and local time
    pub fn new(name: impl Into<String>, vcpus: u32, memory_mb: u64) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            vcpus,
            cores: 1,
            threads: 1,
            memory: memory_mb,
            bootloader: "UEFI".to_string(),
            autostart: false,
            time: "LOCAL".to_string(),
        }
    }
}

/// Disk bus as understood by the TrueNAS hypervisor layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiskMode {
    Ahci,
    Virtio,
}

/// Display protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DisplayType {
    Spice,
    Vnc,
}

/// Typed device attributes, tagged by `dtype`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "dtype", rename_all = "UPPERCASE")]
pub enum DeviceAttributes {
    Cdrom {
        path: String,
    },
    Disk {
        path: String,
        #[serde(rename = "type")]
        mode: DiskMode,
        #[serde(default = "default_iotype")]
        iotype: String,
    },
    Nic {
        #[serde(rename = "type")]
        model: String,
        nic_attach: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mac: Option<String>,
    },
    Display {
        #[serde(rename = "type")]
        protocol: DisplayType,
        bind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        web: bool,
    },
}

fn default_iotype() -> String {
    "THREADS".to_string()
}

impl DeviceAttributes {
    /// `dtype` tag of this device
    pub fn dtype(&self) -> &'static str {
        match self {
            DeviceAttributes::Cdrom { .. } => "CDROM",
            DeviceAttributes::Disk { .. } => "DISK",
            DeviceAttributes::Nic { .. } => "NIC",
            DeviceAttributes::Display { .. } => "DISPLAY",
        }
    }
}

/// Device object as returned by `vm.device.query`.
///
/// Attributes are kept untyped: depending on the release `dtype` lives either
/// at the top level or inside `attributes`, and unknown device types
/// (PCI, USB, RAW) must not break deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: u64,
    pub vm: u64,
    #[serde(default)]
    pub dtype: Option<String>,
    #[serde(default)]
    pub attributes: serde_json::Value,
    #[serde(default)]
    pub order: Option<u32>,
}

impl DeviceRecord {
    /// Device type, from `dtype` or the older `attributes.dtype`
    pub fn device_type(&self) -> Option<&str> {
        self.dtype
            .as_deref()
            .or_else(|| self.attributes.get("dtype").and_then(serde_json::Value::as_str))
    }

    /// Whether this is a `DISK` device
    pub fn is_disk(&self) -> bool {
        self.device_type().is_some_and(|t| t.eq_ignore_ascii_case("DISK"))
    }

    /// Backing path of a disk or CD-ROM device
    pub fn path(&self) -> Option<&str> {
        self.attributes.get("path").and_then(serde_json::Value::as_str)
    }
}

/// Request body for `vm.device.create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateDeviceRequest {
    pub vm: u64,
    pub attributes: DeviceAttributes,
    pub order: u32,
}

/// Dataset kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatasetType {
    Filesystem,
    Volume,
}

/// ZFS property as reported by `pool.dataset.query`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertyValue {
    #[serde(default)]
    pub parsed: serde_json::Value,
    #[serde(default)]
    pub rawvalue: Option<String>,
}

/// Dataset (filesystem or ZVol)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Full path, e.g. `tank/vms/k8s0-boot`
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DatasetType,
    #[serde(default)]
    pub volsize: Option<PropertyValue>,
}

impl Dataset {
    /// Whether the dataset is a zvol
    pub fn is_volume(&self) -> bool {
        self.kind == DatasetType::Volume
    }

    /// Volume size in bytes, when reported
    pub fn volsize_bytes(&self) -> Option<u64> {
        let volsize = self.volsize.as_ref()?;
        volsize
            .parsed
            .as_u64()
            .or_else(|| volsize.rawvalue.as_deref().and_then(|raw| raw.parse().ok()))
    }
}

/// Request body for `pool.dataset.create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateDatasetRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DatasetType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volsize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse: Option<bool>,
}

impl CreateDatasetRequest {
    /// Plain filesystem container
    pub fn filesystem(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DatasetType::Filesystem,
            volsize: None,
            sparse: None,
        }
    }

    /// ZVol of `size_bytes`, sparse when `thin`
    pub fn volume(name: impl Into<String>, size_bytes: u64, thin: bool) -> Self {
        Self {
            name: name.into(),
            kind: DatasetType::Volume,
            volsize: Some(size_bytes),
            sparse: Some(thin),
        }
    }
}

/// State of a middleware background job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Waiting,
    Running,
    Success,
    Failed,
    Aborted,
}

impl JobState {
    /// Whether the job reached a terminal state
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Aborted)
    }
}

/// Job object as returned by `core.get_jobs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    #[serde(default)]
    pub method: String,
    pub state: JobState,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: serde_json::Value,
}
