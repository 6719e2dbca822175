//! Storage Volume Manager
//!
//! Creates, verifies, discovers and deletes the ZVols backing TrueNAS VM
//! disks. Paths come from [`VolumeLayout`], so creation and later orphan
//! discovery land on the same strings.

use crate::backend::{VolumeDeletion, VolumeFailure};
use crate::error::ProvisionError;
use crate::recovered;
use recovery::{Categorized, ErrorCategory, RecoveryManager};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use truenas_client::{CreateDatasetRequest, DatasetType, DeviceRecord, TrueNasClientTrait, TrueNasError};
use vm_model::{
    DiskRole, NameMatch, StorageVolume, VmConfiguration, VolumeLayout, VolumeState, candidate_paths,
    match_volume_name, strip_reserved_segment, volume_from_device_path,
};

const GIB: u64 = 1024 * 1024 * 1024;

/// ZVol lifecycle for one pool layout
#[derive(Clone)]
pub struct StorageVolumeManager {
    client: Arc<dyn TrueNasClientTrait>,
    layout: VolumeLayout,
    recovery: Arc<RecoveryManager>,
}

impl std::fmt::Debug for StorageVolumeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageVolumeManager")
            .field("host", &self.client.host())
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl StorageVolumeManager {
    pub fn new(client: Arc<dyn TrueNasClientTrait>, layout: VolumeLayout, recovery: Arc<RecoveryManager>) -> Self {
        Self {
            client,
            layout,
            recovery,
        }
    }

    pub fn layout(&self) -> &VolumeLayout {
        &self.layout
    }

    /// Volumes `config` needs, in device attach order
    pub fn planned_volumes(&self, config: &VmConfiguration) -> Vec<StorageVolume> {
        DiskRole::ALL
            .iter()
            .filter_map(|role| config.disk(*role))
            .map(|disk| self.layout.planned(&config.name, disk))
            .collect()
    }

    /// Create every volume of `config` that does not exist yet.
    ///
    /// Safe to call again after a failure: existing parents and volumes are
    /// detected and skipped.
    pub async fn create_volumes(&self, config: &VmConfiguration) -> Result<Vec<StorageVolume>, ProvisionError> {
        let mut volumes = self.planned_volumes(config);

        for volume in &mut volumes {
            let existing = self
                .client
                .get_dataset(&volume.path)
                .await
                .map_err(|e| ProvisionError::truenas("pool.dataset.query", volume.path.as_str(), e))?;
            match existing {
                Some(dataset) if dataset.is_volume() => {
                    info!("Volume {} already exists, skipping", volume.path);
                    volume.state = VolumeState::Present;
                    continue;
                }
                Some(_) => {
                    return Err(ProvisionError::NotAVolume {
                        path: volume.path.clone(),
                    });
                }
                None => {}
            }

            self.ensure_parents(&volume.path).await?;

            let request = CreateDatasetRequest::volume(
                volume.path.as_str(),
                volume.size_bytes(),
                volume.provisioning.is_thin(),
            );
            self.client
                .create_dataset(&request)
                .await
                .map_err(|e| ProvisionError::truenas("pool.dataset.create", volume.path.as_str(), e))?;
            info!(
                "Created {} volume {} ({} GiB)",
                if volume.provisioning.is_thin() { "sparse" } else { "thick" },
                volume.path,
                volume.size_gb
            );
            volume.state = VolumeState::Present;
        }

        Ok(volumes)
    }

    /// Create missing parent segments of `path` as filesystems, left to right.
    ///
    /// The first segment is the pool itself and is never created.
    async fn ensure_parents(&self, path: &str) -> Result<(), ProvisionError> {
        let segments: Vec<&str> = path.split('/').collect();
        for depth in 2..segments.len() {
            let parent = segments[..depth].join("/");
            let existing = self
                .client
                .get_dataset(&parent)
                .await
                .map_err(|e| ProvisionError::truenas("pool.dataset.query", parent.as_str(), e))?;
            match existing {
                Some(dataset) if dataset.is_volume() => {
                    return Err(ProvisionError::truenas(
                        "pool.dataset.create",
                        path,
                        TrueNasError::InvalidRequest(format!("parent {parent} is a volume")),
                    ));
                }
                Some(_) => {}
                None => {
                    self.client
                        .create_dataset(&CreateDatasetRequest::filesystem(parent.as_str()))
                        .await
                        .map_err(|e| ProvisionError::truenas("pool.dataset.create", parent.as_str(), e))?;
                    info!("Created parent dataset {}", parent);
                }
            }
        }
        Ok(())
    }

    /// Check that every volume of `config` already exists.
    ///
    /// Used when volume creation is skipped; a missing volume is an error.
    pub async fn verify_volumes(&self, config: &VmConfiguration) -> Result<Vec<StorageVolume>, ProvisionError> {
        let mut volumes = self.planned_volumes(config);
        for volume in &mut volumes {
            let existing = self
                .client
                .get_dataset(&volume.path)
                .await
                .map_err(|e| ProvisionError::truenas("pool.dataset.query", volume.path.as_str(), e))?;
            let Some(dataset) = existing.filter(|d| d.is_volume()) else {
                return Err(ProvisionError::MissingVolume {
                    vm: config.name.clone(),
                    path: volume.path.clone(),
                });
            };
            if let Some(bytes) = dataset.volsize_bytes() {
                if bytes / GIB != volume.size_gb {
                    warn!(
                        "Volume {} is {} GiB, configuration asks for {} GiB",
                        volume.path,
                        bytes / GIB,
                        volume.size_gb
                    );
                }
            }
            debug!("Verified volume {}", volume.path);
            volume.state = VolumeState::Present;
        }
        Ok(volumes)
    }

    /// Volume paths behind the disk devices of a VM.
    ///
    /// Only volumes under `pool` count; the reserved segment is optional, so
    /// `tank` and `tank/vms` keep the same set.
    pub fn discover_volumes_for_vm(devices: &[DeviceRecord], pool: &str) -> Vec<String> {
        let prefix = format!("{}/", strip_reserved_segment(pool));
        let mut seen = HashSet::new();
        devices
            .iter()
            .filter(|device| device.is_disk())
            .filter_map(DeviceRecord::path)
            .filter_map(volume_from_device_path)
            .filter(|path| path.starts_with(&prefix))
            .filter(|path| seen.insert(path.to_string()))
            .map(str::to_string)
            .collect()
    }

    /// Volumes that look like they belong to `vm_name`, whether or not the VM still exists.
    ///
    /// Accepts candidate paths under `pool` (with and without the reserved
    /// segment) plus looser name matches anywhere. The flexible match can
    /// pick up volumes of a VM whose name contains `vm_name`.
    pub async fn discover_volumes_by_naming_pattern(
        &self,
        pool: &str,
        vm_name: &str,
    ) -> Result<Vec<String>, ProvisionError> {
        let candidates: HashSet<String> = candidate_paths(pool, vm_name).into_iter().collect();
        let volumes = self
            .client
            .query_datasets(Some(DatasetType::Volume))
            .await
            .map_err(|e| ProvisionError::truenas("pool.dataset.query", pool, e))?;

        let mut found = BTreeSet::new();
        for dataset in volumes.iter().filter(|d| d.is_volume()) {
            let path = dataset.id.as_str();
            if candidates.contains(path) {
                found.insert(path.to_string());
                continue;
            }
            match match_volume_name(path, vm_name) {
                Some(NameMatch::Exact | NameMatch::Prefixed) => {
                    found.insert(path.to_string());
                }
                Some(NameMatch::Flexible) => {
                    warn!("Volume {} matched VM {} by substring only", path, vm_name);
                    found.insert(path.to_string());
                }
                None => {}
            }
        }

        let found: Vec<String> = found.into_iter().collect();
        info!("Naming-pattern discovery found {} volume(s) for {}", found.len(), vm_name);
        Ok(found)
    }

    /// Delete `paths` recursively and forcefully, each independently.
    ///
    /// A volume that is already gone counts as deleted.
    pub async fn delete_volumes(&self, paths: &[String]) -> VolumeDeletion {
        let mut deleted = Vec::new();
        let mut failed = Vec::new();

        for path in paths {
            let result = recovered(&self.recovery, &format!("truenas.volume.delete:{path}"), || async {
                self.client
                    .delete_dataset(path, true, true)
                    .await
                    .map_err(|e| ProvisionError::truenas("pool.dataset.delete", path.as_str(), e))
            })
            .await;

            match result {
                Ok(()) => {
                    info!("Deleted volume {}", path);
                    deleted.push(path.clone());
                }
                Err(e) if e.category() == ErrorCategory::NotFound => {
                    debug!("Volume {} already gone", path);
                    deleted.push(path.clone());
                }
                Err(error) => {
                    warn!("Failed to delete volume {}: {}", path, error);
                    failed.push(VolumeFailure {
                        path: path.clone(),
                        error,
                    });
                }
            }
        }

        if !failed.is_empty() {
            warn!("{} of {} volume(s) could not be deleted", failed.len(), paths.len());
        }
        VolumeDeletion::from_outcomes(deleted, failed)
    }
}
