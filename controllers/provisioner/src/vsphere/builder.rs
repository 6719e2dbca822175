//! vSphere VM Builder
//!
//! Builds a VM in four remote steps:
//!
//! 1. `ShellCreated`: controllers, NIC and CD-ROM, no disks
//! 2. `DisksAttached`: one disk per configured role, on the real controller keys
//! 3. `Reregistered`: unregister and register again from the `.vmx` so the
//!    control plane re-reads the disk adapter types from the descriptor
//! 4. `PoweredOn`: optional, retried on a fixed schedule while the control
//!    plane finishes its background disk processing

use super::devices::{disk_changes, shell_spec};
use crate::backend::{DeleteReport, DeploymentReport, Phase, VmBackend, VmPowerState, VmSummary, VolumeDeletion};
use crate::error::ProvisionError;
use crate::recovered;
use recovery::{FixedDelays, RecoveryError, RecoveryManager};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vm_model::{Backend, InstallMediaKind, VmConfiguration};
use vsphere_client::{PowerState, VSphereClientTrait, VSphereError, VirtualDevice, VmInfo};

/// Datastore folder install media is uploaded to
const MEDIA_FOLDER: &str = "iso";

/// Waits between builder phases
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderTimings {
    /// Pause after attaching disks, before unregistering
    pub reregister_grace: Duration,
    /// Waits before each power-on retry; one attempt more than delays
    pub power_on_delays: Vec<Duration>,
}

impl Default for BuilderTimings {
    fn default() -> Self {
        Self {
            reregister_grace: Duration::from_secs(5),
            power_on_delays: vec![Duration::from_secs(5), Duration::from_secs(10), Duration::from_secs(20)],
        }
    }
}

fn summary(vm: &VmInfo) -> VmSummary {
    VmSummary {
        name: vm.name.clone(),
        id: vm.id.clone(),
        power_state: match vm.power_state {
            PowerState::PoweredOn => VmPowerState::On,
            PowerState::PoweredOff => VmPowerState::Off,
            PowerState::Suspended => VmPowerState::Suspended,
        },
        vcpus: vm.num_cpus,
        memory_mb: vm.memory_mb,
    }
}

fn disk_files(vm: &VmInfo) -> Vec<String> {
    vm.disks()
        .filter_map(|d| match d {
            VirtualDevice::Disk { file_name, .. } => file_name.clone(),
            _ => None,
        })
        .collect()
}

/// vSphere VM lifecycle
pub struct VmBuilder {
    client: Arc<dyn VSphereClientTrait>,
    recovery: Arc<RecoveryManager>,
    timings: BuilderTimings,
}

impl std::fmt::Debug for VmBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmBuilder")
            .field("host", &self.client.host())
            .field("datastore", &self.client.datastore())
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}

impl VmBuilder {
    pub fn new(client: Arc<dyn VSphereClientTrait>, recovery: Arc<RecoveryManager>) -> Self {
        Self {
            client,
            recovery,
            timings: BuilderTimings::default(),
        }
    }

    #[must_use]
    pub fn with_timings(mut self, timings: BuilderTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn timings(&self) -> &BuilderTimings {
        &self.timings
    }

    pub async fn find_vm(&self, name: &str) -> Result<Option<VmInfo>, ProvisionError> {
        recovered(&self.recovery, &format!("vsphere.vm.find:{name}"), || async {
            self.client
                .find_vm(name)
                .await
                .map_err(|e| ProvisionError::vsphere("find_vm", name, e))
        })
        .await
    }

    async fn require(&self, name: &str) -> Result<VmInfo, ProvisionError> {
        self.find_vm(name)
            .await?
            .ok_or_else(|| ProvisionError::NotFound(name.to_string()))
    }

    pub async fn get_vm_info(&self, name: &str, vm_id: &str) -> Result<VmInfo, ProvisionError> {
        recovered(&self.recovery, &format!("vsphere.vm.info:{name}"), || async {
            self.client
                .get_vm_info(vm_id)
                .await
                .map_err(|e| ProvisionError::vsphere("get_vm_info", name, e))
        })
        .await
    }

    /// Datastore path of the install media, uploading local files first
    async fn stage_media(&self, config: &VmConfiguration) -> Result<Option<String>, ProvisionError> {
        let Some(media) = &config.install_media else {
            return Ok(None);
        };
        let name = config.name.as_str();
        match media.kind() {
            InstallMediaKind::DatastorePath => Ok(Some(media.as_str().to_string())),
            InstallMediaKind::LocalPath => {
                let remote = format!("{MEDIA_FOLDER}/{}", media.file_name());
                info!("VM {}: uploading {} to {}", name, media.as_str(), remote);
                let path = recovered(&self.recovery, &format!("vsphere.upload:{name}"), || async {
                    self.client
                        .upload_file(Path::new(media.as_str()), &remote)
                        .await
                        .map_err(|e| ProvisionError::vsphere("upload", media.as_str(), e))
                })
                .await?;
                info!("VM {}: install media staged at {}", name, path);
                Ok(Some(path))
            }
            InstallMediaKind::Url => Err(ProvisionError::vsphere(
                "upload",
                media.as_str(),
                VSphereError::InvalidRequest("a CD-ROM cannot boot from a URL".to_string()),
            )),
        }
    }

    /// Build the VM described by `config`.
    ///
    /// Any failure stops the build; a partially built VM is left in place
    /// for inspection.
    pub async fn create_vm(&self, config: &VmConfiguration) -> Result<DeploymentReport, ProvisionError> {
        config.validate(Backend::VSphere)?;
        let started = Instant::now();
        let name = config.name.as_str();
        let mut report = DeploymentReport::start(config, Backend::VSphere);

        info!("Creating VM {} on vSphere {}", name, self.client.host());
        if let Some(image) = &config.custom_image {
            info!("VM {} installs image {} (schematic {})", name, image.version, image.schematic_id);
        }

        if self.find_vm(name).await?.is_some() {
            return Err(ProvisionError::AlreadyExists(name.to_string()));
        }

        let iso_path = self.stage_media(config).await?;

        let spec = shell_spec(config, iso_path.as_deref());
        let shell_devices = spec.devices.len();
        let vm_id = self
            .client
            .create_vm(&spec)
            .await
            .map_err(|e| ProvisionError::vsphere("CreateVM_Task", name, e))?;
        report.phases.push(Phase::ShellCreated);
        info!("VM {}: shell created with id {} ({} device(s))", name, vm_id, shell_devices);

        let devices = recovered(&self.recovery, &format!("vsphere.vm.devices:{name}"), || async {
            self.client
                .get_devices(&vm_id)
                .await
                .map_err(|e| ProvisionError::vsphere("get_devices", name, e))
        })
        .await?;
        let disks = disk_changes(config, &devices)?;
        self.client
            .reconfigure_vm(&vm_id, &disks)
            .await
            .map_err(|e| ProvisionError::vsphere("ReconfigVM_Task", name, e))?;
        report.phases.push(Phase::DisksAttached);
        info!("VM {}: {} disk(s) attached", name, disks.len());

        let vm_id = self.reregister(name, &vm_id).await?;
        report.phases.push(Phase::Reregistered);

        let info = self.get_vm_info(name, &vm_id).await?;
        report.volumes = disk_files(&info);
        report.device_count = info.devices.len();
        report.vm_id = vm_id;

        if config.power_on {
            self.power_on_with_retry(name, &report.vm_id).await?;
            report.powered_on = true;
            report.phases.push(Phase::PoweredOn);
        }

        report.elapsed = started.elapsed();
        info!("VM {} created in {:?}", name, report.elapsed);
        Ok(report)
    }

    /// Unregister and register `vm_id` from its descriptor, returning the new id
    async fn reregister(&self, name: &str, vm_id: &str) -> Result<String, ProvisionError> {
        debug!("VM {}: waiting {:?} before re-registering", name, self.timings.reregister_grace);
        tokio::time::sleep(self.timings.reregister_grace).await;

        let info = self.get_vm_info(name, vm_id).await?;
        let vmx_path = info.vmx_path.clone().ok_or_else(|| {
            ProvisionError::vsphere(
                "UnregisterVM",
                name,
                VSphereError::NotFound(format!("no descriptor path for VM {vm_id}")),
            )
        })?;

        recovered(&self.recovery, &format!("vsphere.vm.unregister:{name}"), || async {
            self.client
                .unregister_vm(vm_id)
                .await
                .map_err(|e| ProvisionError::vsphere("UnregisterVM", name, e))
        })
        .await?;
        let new_id = recovered(&self.recovery, &format!("vsphere.vm.register:{name}"), || async {
            self.client
                .register_vm(&vmx_path, name)
                .await
                .map_err(|e| ProvisionError::vsphere("RegisterVM_Task", vmx_path.as_str(), e))
        })
        .await?;
        info!("VM {}: re-registered from {} as {}", name, vmx_path, new_id);
        Ok(new_id)
    }

    /// Power on, retrying on the fixed delay schedule.
    ///
    /// The schedule runs outside the circuit breaker so other VMs' power-on
    /// failures never shorten it.
    async fn power_on_with_retry(&self, name: &str, vm_id: &str) -> Result<(), ProvisionError> {
        let schedule = FixedDelays::new(self.timings.power_on_delays.clone());
        let result = self
            .recovery
            .execute_with_schedule(&format!("vsphere.power_on:{name}"), &schedule, || async {
                self.client
                    .power_on(vm_id)
                    .await
                    .map_err(|e| ProvisionError::vsphere("PowerOnVM_Task", name, e))
            })
            .await;

        let attempts = result.attempts;
        let waited = result.elapsed;
        match result.outcome {
            Ok(()) => {
                info!("VM {}: powered on after {} attempt(s)", name, attempts);
                Ok(())
            }
            Err(error) => {
                let source = match error {
                    RecoveryError::Failed { source, .. } => source,
                    other => other.into(),
                };
                Err(ProvisionError::PowerOn {
                    name: name.to_string(),
                    attempts,
                    waited,
                    source: Box::new(source),
                })
            }
        }
    }

    /// Power off if running (best effort), then destroy the VM and its disks
    pub async fn delete_vm(&self, name: &str) -> Result<DeleteReport, ProvisionError> {
        let vm = self.require(name).await?;

        if vm.power_state == PowerState::PoweredOn {
            match self.client.power_off(&vm.id).await {
                Ok(()) => info!("VM {}: powered off", name),
                Err(e) => warn!("Failed to power off VM {} before deletion: {}", name, e),
            }
        }

        recovered(&self.recovery, &format!("vsphere.vm.destroy:{name}"), || async {
            self.client
                .destroy_vm(&vm.id)
                .await
                .map_err(|e| ProvisionError::vsphere("Destroy_Task", name, e))
        })
        .await?;
        info!("VM {} destroyed", name);

        Ok(DeleteReport {
            name: name.to_string(),
            vm_deleted: true,
            volumes: VolumeDeletion::from_outcomes(disk_files(&vm), Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl VmBackend for VmBuilder {
    fn kind(&self) -> Backend {
        Backend::VSphere
    }

    async fn create(&self, config: &VmConfiguration) -> Result<DeploymentReport, ProvisionError> {
        self.create_vm(config).await
    }

    /// Disks live in the VM folder and are destroyed with the VM either way
    async fn delete(&self, name: &str, _delete_volumes: bool) -> Result<DeleteReport, ProvisionError> {
        self.delete_vm(name).await
    }

    async fn find(&self, name: &str) -> Result<Option<VmSummary>, ProvisionError> {
        Ok(self.find_vm(name).await?.as_ref().map(summary))
    }

    async fn list(&self) -> Result<Vec<VmSummary>, ProvisionError> {
        let vms = recovered(&self.recovery, "vsphere.vm.list", || async {
            self.client
                .list_vms()
                .await
                .map_err(|e| ProvisionError::vsphere("list_vms", "*", e))
        })
        .await?;
        Ok(vms.iter().map(summary).collect())
    }

    async fn power_on(&self, name: &str) -> Result<(), ProvisionError> {
        let vm = self.require(name).await?;
        if vm.power_state == PowerState::PoweredOn {
            info!("VM {} is already powered on", name);
            return Ok(());
        }
        self.power_on_with_retry(name, &vm.id).await
    }

    async fn power_off(&self, name: &str) -> Result<(), ProvisionError> {
        let vm = self.require(name).await?;
        if vm.power_state == PowerState::PoweredOff {
            info!("VM {} is already powered off", name);
            return Ok(());
        }
        recovered(&self.recovery, &format!("vsphere.vm.power_off:{name}"), || async {
            self.client
                .power_off(&vm.id)
                .await
                .map_err(|e| ProvisionError::vsphere("PowerOffVM_Task", name, e))
        })
        .await?;
        info!("VM {}: powered off", name);
        Ok(())
    }
}
