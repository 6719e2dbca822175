//! Backend-agnostic VM operations
//!
//! Both backends implement [`VmBackend`]; each keeps its own phase sequence
//! private and reports what it did through [`DeploymentReport`].

use crate::error::ProvisionError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use vm_model::{Backend, CustomImage, VmConfiguration};

/// A lifecycle step a deployment went through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    // TrueNAS
    VolumesReady,
    Created,
    DevicesAttached,
    // vSphere
    ShellCreated,
    DisksAttached,
    Reregistered,
    // Both
    PoweredOn,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::VolumesReady => "volumes-ready",
            Phase::Created => "created",
            Phase::DevicesAttached => "devices-attached",
            Phase::ShellCreated => "shell-created",
            Phase::DisksAttached => "disks-attached",
            Phase::Reregistered => "reregistered",
            Phase::PoweredOn => "powered-on",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful deployment
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentReport {
    pub name: String,
    pub backend: Backend,
    /// Backend VM id (TrueNAS numeric id, vSphere managed object id)
    pub vm_id: String,
    /// Volume paths (TrueNAS) or disk files (vSphere) backing the VM
    pub volumes: Vec<String>,
    pub device_count: usize,
    pub powered_on: bool,
    pub phases: Vec<Phase>,
    /// Audit-only image metadata carried through from the configuration
    pub custom_image: Option<CustomImage>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl DeploymentReport {
    pub(crate) fn start(config: &VmConfiguration, backend: Backend) -> Self {
        Self {
            name: config.name.clone(),
            backend,
            vm_id: String::new(),
            volumes: Vec::new(),
            device_count: 0,
            powered_on: false,
            phases: Vec::new(),
            custom_image: config.custom_image.clone(),
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
        }
    }

    /// Whether `phase` completed
    pub fn reached(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }
}

/// Power state as reported by either backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmPowerState {
    On,
    Off,
    Suspended,
}

impl fmt::Display for VmPowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmPowerState::On => write!(f, "on"),
            VmPowerState::Off => write!(f, "off"),
            VmPowerState::Suspended => write!(f, "suspended"),
        }
    }
}

/// Read-only view of a VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmSummary {
    pub name: String,
    pub id: String,
    pub power_state: VmPowerState,
    pub vcpus: u32,
    pub memory_mb: u64,
}

/// Why deleting one volume failed
#[derive(Debug)]
pub struct VolumeFailure {
    pub path: String,
    pub error: ProvisionError,
}

/// Aggregate result of deleting a set of volumes
#[derive(Debug)]
pub enum VolumeDeletion {
    /// Volume deletion was not asked for
    NotRequested,
    /// Nothing to delete
    NoneFound,
    AllDeleted(Vec<String>),
    Partial {
        deleted: Vec<String>,
        failed: Vec<VolumeFailure>,
    },
    AllFailed(Vec<VolumeFailure>),
}

impl VolumeDeletion {
    /// Classify per-path outcomes
    pub fn from_outcomes(deleted: Vec<String>, failed: Vec<VolumeFailure>) -> Self {
        match (deleted.is_empty(), failed.is_empty()) {
            (true, true) => VolumeDeletion::NoneFound,
            (_, true) => VolumeDeletion::AllDeleted(deleted),
            (true, false) => VolumeDeletion::AllFailed(failed),
            (false, false) => VolumeDeletion::Partial { deleted, failed },
        }
    }

    /// Paths that were deleted
    pub fn deleted(&self) -> &[String] {
        match self {
            VolumeDeletion::AllDeleted(deleted) | VolumeDeletion::Partial { deleted, .. } => deleted,
            _ => &[],
        }
    }

    /// Volumes that could not be deleted, with their errors
    pub fn failed(&self) -> &[VolumeFailure] {
        match self {
            VolumeDeletion::Partial { failed, .. } | VolumeDeletion::AllFailed(failed) => failed,
            _ => &[],
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failed().is_empty()
    }
}

/// Outcome of deleting one VM
#[derive(Debug)]
pub struct DeleteReport {
    pub name: String,
    /// False when the VM was already gone and only orphans were cleaned up
    pub vm_deleted: bool,
    pub volumes: VolumeDeletion,
}

impl DeleteReport {
    /// VM is gone but some volumes are left behind
    pub fn is_partial_failure(&self) -> bool {
        self.volumes.has_failures()
    }
}

/// The capability set shared by every backend
#[async_trait::async_trait]
pub trait VmBackend: Send + Sync {
    fn kind(&self) -> Backend;

    /// Build the VM described by `config`, powering it on if it asks for it
    async fn create(&self, config: &VmConfiguration) -> Result<DeploymentReport, ProvisionError>;

    /// Delete a VM and, where the backend keeps them apart, its volumes
    async fn delete(&self, name: &str, delete_volumes: bool) -> Result<DeleteReport, ProvisionError>;

    async fn find(&self, name: &str) -> Result<Option<VmSummary>, ProvisionError>;
    async fn list(&self) -> Result<Vec<VmSummary>, ProvisionError>;
    async fn power_on(&self, name: &str) -> Result<(), ProvisionError>;
    async fn power_off(&self, name: &str) -> Result<(), ProvisionError>;
}
