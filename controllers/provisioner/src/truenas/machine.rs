//! Machine Manager
//!
//! Deploys and deletes TrueNAS VMs. A deployment walks
//! `VolumesReady -> Created -> DevicesAttached -> PoweredOn`; volumes are
//! created before the VM object that references them.

use super::devices::plan_devices;
use super::storage::StorageVolumeManager;
use crate::backend::{DeleteReport, DeploymentReport, Phase, VmBackend, VmPowerState, VmSummary, VolumeDeletion};
use crate::error::ProvisionError;
use crate::recovered;
use recovery::{GracefulDegradationManager, RecoveryManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use truenas_client::{CreateVmRequest, TrueNasClientTrait, VmRecord};
use vm_model::{Backend, VmConfiguration, VolumeLayout};

const DISCOVERY_OPERATION: &str = "truenas.volume.discover";

/// How long to wait for a deleted VM to drop out of listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletePoll {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for DeletePoll {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(1),
        }
    }
}

/// TrueNAS VM lifecycle
pub struct MachineManager {
    client: Arc<dyn TrueNasClientTrait>,
    storage: StorageVolumeManager,
    recovery: Arc<RecoveryManager>,
    delete_poll: DeletePoll,
}

impl std::fmt::Debug for MachineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineManager")
            .field("host", &self.client.host())
            .field("storage", &self.storage)
            .field("delete_poll", &self.delete_poll)
            .finish_non_exhaustive()
    }
}

fn summary(vm: &VmRecord) -> VmSummary {
    let power_state = match vm.status.state.as_str() {
        "RUNNING" => VmPowerState::On,
        "SUSPENDED" | "PAUSED" => VmPowerState::Suspended,
        _ => VmPowerState::Off,
    };
    VmSummary {
        name: vm.name.clone(),
        id: vm.id.to_string(),
        power_state,
        vcpus: vm.vcpus,
        memory_mb: vm.memory,
    }
}

impl MachineManager {
    pub fn new(client: Arc<dyn TrueNasClientTrait>, layout: VolumeLayout, recovery: Arc<RecoveryManager>) -> Self {
        let storage = StorageVolumeManager::new(Arc::clone(&client), layout, Arc::clone(&recovery));
        Self {
            client,
            storage,
            recovery,
            delete_poll: DeletePoll::default(),
        }
    }

    #[must_use]
    pub fn with_delete_poll(mut self, delete_poll: DeletePoll) -> Self {
        self.delete_poll = delete_poll;
        self
    }

    pub fn storage(&self) -> &StorageVolumeManager {
        &self.storage
    }

    async fn lookup(&self, name: &str) -> Result<Option<VmRecord>, ProvisionError> {
        recovered(&self.recovery, &format!("truenas.vm.query:{name}"), || async {
            self.client
                .query_vm(name)
                .await
                .map_err(|e| ProvisionError::truenas("vm.query", name, e))
        })
        .await
    }

    async fn require(&self, name: &str) -> Result<VmRecord, ProvisionError> {
        self.lookup(name)
            .await?
            .ok_or_else(|| ProvisionError::NotFound(name.to_string()))
    }

    /// Deploy one VM: volumes, VM object, ordered devices, then the optional power-on
    pub async fn deploy_vm(&self, config: &VmConfiguration) -> Result<DeploymentReport, ProvisionError> {
        config.validate(Backend::TrueNas)?;
        let started = Instant::now();
        let name = config.name.as_str();
        let mut report = DeploymentReport::start(config, Backend::TrueNas);

        info!("Deploying VM {} on TrueNAS {}", name, self.client.host());
        if let Some(image) = &config.custom_image {
            info!("VM {} installs image {} (schematic {})", name, image.version, image.schematic_id);
        }

        if self.lookup(name).await?.is_some() {
            return Err(ProvisionError::AlreadyExists(name.to_string()));
        }

        let volumes = if config.skip_volume_creation {
            info!("Volume creation skipped for {}, verifying existing volumes", name);
            recovered(&self.recovery, &format!("truenas.volume.verify:{name}"), || {
                self.storage.verify_volumes(config)
            })
            .await?
        } else {
            recovered(&self.recovery, &format!("truenas.volume.create:{name}"), || {
                self.storage.create_volumes(config)
            })
            .await?
        };
        report.volumes = volumes.iter().map(|v| v.path.clone()).collect();
        report.phases.push(Phase::VolumesReady);
        info!("VM {}: {} volume(s) ready", name, volumes.len());

        let vm = self
            .client
            .create_vm(&CreateVmRequest::new(name, config.vcpus, config.memory_mb))
            .await
            .map_err(|e| ProvisionError::truenas("vm.create", name, e))?;
        report.vm_id = vm.id.to_string();
        report.phases.push(Phase::Created);
        info!("VM {}: created with id {}", name, vm.id);

        let devices = plan_devices(config, vm.id, &volumes);
        for device in &devices {
            self.client
                .create_device(&device.request)
                .await
                .map_err(|e| ProvisionError::truenas("vm.device.create", format!("{name}/{}", device.label), e))?;
            debug!("VM {}: attached {} (order {})", name, device.label, device.request.order);
        }
        report.device_count = devices.len();
        report.phases.push(Phase::DevicesAttached);
        info!("VM {}: {} device(s) attached", name, devices.len());

        if config.power_on {
            self.start(name, vm.id).await?;
            report.powered_on = true;
            report.phases.push(Phase::PoweredOn);
        }

        report.elapsed = started.elapsed();
        info!("VM {} deployed in {:?}", name, report.elapsed);
        Ok(report)
    }

    async fn start(&self, name: &str, id: u64) -> Result<(), ProvisionError> {
        recovered(&self.recovery, &format!("truenas.vm.start:{name}"), || async {
            self.client
                .start_vm(id)
                .await
                .map_err(|e| ProvisionError::truenas("vm.start", name, e))
        })
        .await?;
        info!("VM {}: powered on", name);
        Ok(())
    }

    /// Volumes of `vm`, read from its devices or, failing that, from naming patterns
    async fn discover_volumes(&self, vm: &VmRecord, pool: &str) -> Result<Vec<String>, ProvisionError> {
        let degradation = GracefulDegradationManager::new();
        let storage = self.storage.clone();
        let fallback_pool = pool.to_string();
        let fallback_name = vm.name.clone();
        degradation.register_fallback(DISCOVERY_OPERATION, move || {
            let storage = storage.clone();
            let pool = fallback_pool.clone();
            let name = fallback_name.clone();
            async move { storage.discover_volumes_by_naming_pattern(&pool, &name).await }
        });

        let primary = async {
            let devices = if vm.devices.is_empty() {
                self.client
                    .query_devices(vm.id)
                    .await
                    .map_err(|e| ProvisionError::truenas("vm.device.query", vm.name.as_str(), e))?
            } else {
                vm.devices.clone()
            };
            let paths = StorageVolumeManager::discover_volumes_for_vm(&devices, pool);
            if paths.is_empty() {
                return Err(ProvisionError::NoVolumesDiscovered(vm.name.clone()));
            }
            Ok(paths)
        };

        match degradation.execute(DISCOVERY_OPERATION, primary).await {
            Ok(discovered) => {
                info!(
                    "Discovered {} volume(s) for {}{}",
                    discovered.value.len(),
                    vm.name,
                    if discovered.used_fallback { " by naming pattern" } else { "" }
                );
                Ok(discovered.value)
            }
            Err(e) => Err(ProvisionError::Discovery {
                vm: vm.name.clone(),
                source: Box::new(e),
            }),
        }
    }

    /// Wait until `name` no longer shows up in the VM listing
    async fn confirm_deleted(&self, name: &str) -> Result<(), ProvisionError> {
        let DeletePoll { attempts, interval } = self.delete_poll;
        for check in 1..=attempts {
            let vms = self
                .client
                .list_vms()
                .await
                .map_err(|e| ProvisionError::truenas("vm.query", name, e))?;
            if !vms.iter().any(|vm| vm.name == name) {
                debug!("VM {} gone after {} check(s)", name, check);
                return Ok(());
            }
            debug!("VM {} still listed ({}/{})", name, check, attempts);
            if check < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        Err(ProvisionError::DeleteNotConfirmed {
            name: name.to_string(),
            polls: attempts,
        })
    }

    /// Delete a VM and optionally its volumes.
    ///
    /// Volumes are discovered before the VM goes away. When the VM is
    /// already gone, only orphaned volumes found by naming pattern are
    /// removed. Volume failures come back in the report, not as an error.
    pub async fn delete_vm(&self, name: &str, delete_volumes: bool, pool: &str) -> Result<DeleteReport, ProvisionError> {
        let Some(vm) = self.lookup(name).await? else {
            if !delete_volumes {
                return Err(ProvisionError::NotFound(name.to_string()));
            }
            info!("VM {} not found, cleaning up orphaned volumes under {}", name, pool);
            let paths = recovered(&self.recovery, &format!("truenas.volume.discover:{name}"), || {
                self.storage.discover_volumes_by_naming_pattern(pool, name)
            })
            .await?;
            return Ok(DeleteReport {
                name: name.to_string(),
                vm_deleted: false,
                volumes: self.delete_discovered(&paths).await,
            });
        };

        let paths = if delete_volumes {
            self.discover_volumes(&vm, pool).await?
        } else {
            Vec::new()
        };

        if vm.status.is_running() {
            if let Err(e) = self.client.stop_vm(vm.id, true).await {
                warn!("Failed to stop VM {} before deletion: {}", name, e);
            }
        }

        recovered(&self.recovery, &format!("truenas.vm.delete:{name}"), || async {
            self.client
                .delete_vm(vm.id)
                .await
                .map_err(|e| ProvisionError::truenas("vm.delete", name, e))
        })
        .await?;
        self.confirm_deleted(name).await?;
        info!("VM {} deleted", name);

        let volumes = if delete_volumes {
            self.delete_discovered(&paths).await
        } else {
            VolumeDeletion::NotRequested
        };
        if volumes.has_failures() {
            warn!(
                "VM {} deleted but {} volume(s) were left behind",
                name,
                volumes.failed().len()
            );
        }
        Ok(DeleteReport {
            name: name.to_string(),
            vm_deleted: true,
            volumes,
        })
    }

    async fn delete_discovered(&self, paths: &[String]) -> VolumeDeletion {
        if paths.is_empty() {
            return VolumeDeletion::NoneFound;
        }
        self.storage.delete_volumes(paths).await
    }
}

#[async_trait::async_trait]
impl VmBackend for MachineManager {
    fn kind(&self) -> Backend {
        Backend::TrueNas
    }

    async fn create(&self, config: &VmConfiguration) -> Result<DeploymentReport, ProvisionError> {
        self.deploy_vm(config).await
    }

    async fn delete(&self, name: &str, delete_volumes: bool) -> Result<DeleteReport, ProvisionError> {
        let pool = self.storage.layout().pool.clone();
        self.delete_vm(name, delete_volumes, &pool).await
    }

    async fn find(&self, name: &str) -> Result<Option<VmSummary>, ProvisionError> {
        Ok(self.lookup(name).await?.as_ref().map(summary))
    }

    async fn list(&self) -> Result<Vec<VmSummary>, ProvisionError> {
        let vms = recovered(&self.recovery, "truenas.vm.list", || async {
            self.client
                .list_vms()
                .await
                .map_err(|e| ProvisionError::truenas("vm.query", "*", e))
        })
        .await?;
        Ok(vms.iter().map(summary).collect())
    }

    async fn power_on(&self, name: &str) -> Result<(), ProvisionError> {
        let vm = self.require(name).await?;
        if vm.status.is_running() {
            info!("VM {} is already running", name);
            return Ok(());
        }
        self.start(name, vm.id).await
    }

    async fn power_off(&self, name: &str) -> Result<(), ProvisionError> {
        let vm = self.require(name).await?;
        recovered(&self.recovery, &format!("truenas.vm.stop:{name}"), || async {
            self.client
                .stop_vm(vm.id, false)
                .await
                .map_err(|e| ProvisionError::truenas("vm.stop", name, e))
        })
        .await?;
        info!("VM {}: powered off", name);
        Ok(())
    }
}
