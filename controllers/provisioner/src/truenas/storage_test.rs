//! Unit tests for the Storage Volume Manager

#[cfg(test)]
mod tests {
    use crate::backend::VolumeDeletion;
    use crate::error::ProvisionError;
    use crate::test_utils::*;
    use crate::truenas::StorageVolumeManager;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use truenas_client::{DatasetType, DeviceRecord, MockTrueNasClient, TrueNasClientTrait};
    use vm_model::{DiskRole, DiskSpec, VolumeLayout, VolumeState};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn storage(mock: &MockTrueNasClient, layout: VolumeLayout) -> StorageVolumeManager {
        let client: Arc<dyn TrueNasClientTrait> = Arc::new(mock.clone());
        StorageVolumeManager::new(client, layout, test_recovery())
    }

    fn dataset_creates(mock: &MockTrueNasClient) -> Vec<String> {
        mock.calls()
            .into_iter()
            .filter_map(|call| call.strip_prefix("pool.dataset.create:").map(str::to_string))
            .collect()
    }

    fn disk_device(id: u64, path: &str) -> DeviceRecord {
        DeviceRecord {
            id,
            vm: 1,
            dtype: Some("DISK".to_string()),
            attributes: serde_json::json!({"path": path, "type": "VIRTIO"}),
            order: Some(1000 + u32::try_from(id).unwrap_or(0)),
        }
    }

    #[tokio::test]
    async fn test_create_volumes_sparse_at_derived_paths() {
        let mock = truenas_mock();
        let storage = storage(&mock, VolumeLayout::new("tank"));

        let volumes = storage.create_volumes(&node_config("k8s0")).await.unwrap();

        let paths: Vec<&str> = volumes.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, ["tank/k8s0-boot", "tank/k8s0-ebs"]);
        assert!(volumes.iter().all(|v| v.state == VolumeState::Present));
        assert_eq!(dataset_creates(&mock), ["tank/k8s0-boot", "tank/k8s0-ebs"]);

        let boot = mock.get_dataset("tank/k8s0-boot").await.unwrap().unwrap();
        assert!(boot.is_volume());
        assert_eq!(boot.volsize_bytes(), Some(100 * GIB));
    }

    #[tokio::test]
    async fn test_create_volumes_twice_is_a_no_op() {
        let mock = truenas_mock();
        let storage = storage(&mock, VolumeLayout::new("tank"));
        let config = node_config("k8s0");

        storage.create_volumes(&config).await.unwrap();
        let second = storage.create_volumes(&config).await;

        assert!(second.is_ok(), "second create must not fail: {second:?}");
        assert_eq!(dataset_creates(&mock).len(), 2, "no dataset may be created twice");
        assert_eq!(mock.dataset_paths(DatasetType::Volume).len(), 2);
    }

    #[tokio::test]
    async fn test_missing_parents_created_left_to_right() {
        let mock = truenas_mock();
        let storage = storage(&mock, VolumeLayout::new("tank/k8s/nodes"));
        let config = node_config("k8s0");

        storage.create_volumes(&config).await.unwrap();

        assert_eq!(
            dataset_creates(&mock),
            ["tank/k8s", "tank/k8s/nodes", "tank/k8s/nodes/k8s0-boot", "tank/k8s/nodes/k8s0-ebs"]
        );
        let filesystems = mock.dataset_paths(DatasetType::Filesystem);
        assert!(filesystems.contains(&"tank/k8s/nodes".to_string()));
    }

    #[tokio::test]
    async fn test_reserved_segment_layout() {
        let mock = truenas_mock();
        let storage = storage(&mock, VolumeLayout::nested("tank"));

        let volumes = storage.create_volumes(&node_config("k8s0")).await.unwrap();

        assert_eq!(volumes[0].path, "tank/vms/k8s0-boot");
        assert!(mock.dataset_paths(DatasetType::Filesystem).contains(&"tank/vms".to_string()));
    }

    #[tokio::test]
    async fn test_parent_failure_names_the_failing_path() {
        let mock = truenas_mock();
        mock.fail_target("pool.dataset.create", "tank/k8s");
        let storage = storage(&mock, VolumeLayout::new("tank/k8s"));

        let err = storage.create_volumes(&node_config("k8s0")).await.unwrap_err();

        assert!(matches!(&err, ProvisionError::TrueNas { target, .. } if target == "tank/k8s"));
        assert!(mock.dataset_paths(DatasetType::Volume).is_empty());
    }

    #[tokio::test]
    async fn test_thick_disk_is_not_sparse() {
        let mock = truenas_mock();
        let storage = storage(&mock, VolumeLayout::new("tank"));
        let config = vm_model::VmConfiguration::new("k8s0", 2, 4096, "br0")
            .with_disk(DiskSpec::new(DiskRole::Boot, 20).thick());

        let volumes = storage.create_volumes(&config).await.unwrap();
        assert!(!volumes[0].provisioning.is_thin());
    }

    #[tokio::test]
    async fn test_verify_fails_loudly_on_missing_volume() {
        let mock = truenas_mock();
        mock.add_volume("tank/k8s0-boot", 100 * GIB);
        let storage = storage(&mock, VolumeLayout::new("tank"));

        let err = storage.verify_volumes(&node_config("k8s0")).await.unwrap_err();

        assert!(matches!(&err, ProvisionError::MissingVolume { path, .. } if path == "tank/k8s0-ebs"));
        assert_eq!(mock.call_count("pool.dataset.create"), 0);
    }

    #[tokio::test]
    async fn test_verify_accepts_existing_volumes() {
        let mock = truenas_mock();
        mock.add_volume("tank/k8s0-boot", 100 * GIB);
        mock.add_volume("tank/k8s0-ebs", 800 * GIB);
        let storage = storage(&mock, VolumeLayout::new("tank"));

        let volumes = storage.verify_volumes(&node_config("k8s0")).await.unwrap();
        assert_eq!(volumes.len(), 2);
    }

    #[test]
    fn test_device_discovery_keeps_zvol_disks_only() {
        let mut cdrom = disk_device(1, "/mnt/tank/isos/metal.iso");
        cdrom.dtype = Some("CDROM".to_string());
        let devices = vec![
            cdrom,
            disk_device(2, "/dev/zvol/tank/k8s0-boot"),
            disk_device(3, "/mnt/tank/images/raw.img"),
            disk_device(4, "/dev/zvol/tank/k8s0-ebs"),
            disk_device(5, "/dev/zvol/tank/k8s0-boot"),
        ];

        let paths = StorageVolumeManager::discover_volumes_for_vm(&devices, "tank");
        assert_eq!(paths, ["tank/k8s0-boot", "tank/k8s0-ebs"]);
    }

    #[test]
    fn test_device_discovery_stays_inside_the_pool() {
        let devices = vec![
            disk_device(1, "/dev/zvol/tank/vms/k8s0-boot"),
            disk_device(2, "/dev/zvol/scratch/k8s0-ebs"),
            disk_device(3, "/dev/zvol/tankard/k8s0-rook"),
        ];

        assert_eq!(
            StorageVolumeManager::discover_volumes_for_vm(&devices, "tank"),
            ["tank/vms/k8s0-boot"]
        );
        assert_eq!(
            StorageVolumeManager::discover_volumes_for_vm(&devices, "tank/vms"),
            ["tank/vms/k8s0-boot"]
        );
    }

    #[tokio::test]
    async fn test_naming_discovery_finds_orphans() {
        let mock = truenas_mock();
        mock.add_volume("tank/k8s0-boot", GIB);
        mock.add_volume("tank/vms/k8s0-ebs", GIB);
        mock.add_volume("tank/old-k8s0-rook", GIB);
        mock.add_volume("tank/k8s1-boot", GIB);
        mock.add_volume("tank/k8s0-scratch", GIB);
        let storage = storage(&mock, VolumeLayout::new("tank"));

        let found = storage.discover_volumes_by_naming_pattern("tank", "k8s0").await.unwrap();
        assert_eq!(found, ["tank/k8s0-boot", "tank/old-k8s0-rook", "tank/vms/k8s0-ebs"]);

        let nested = storage.discover_volumes_by_naming_pattern("tank/vms", "k8s0").await.unwrap();
        assert_eq!(found, nested);
    }

    #[tokio::test]
    async fn test_flexible_match_over_matches_substring_names() {
        let mock = truenas_mock();
        mock.add_volume("tank/k8s-boot", GIB);
        mock.add_volume("tank/k8s_extra-boot", GIB);
        let storage = storage(&mock, VolumeLayout::new("tank"));

        let found = storage.discover_volumes_by_naming_pattern("tank", "k8s").await.unwrap();
        assert_eq!(found, ["tank/k8s-boot", "tank/k8s_extra-boot"]);
    }

    #[tokio::test]
    async fn test_device_discovery_is_subset_of_naming_discovery() {
        let mock = truenas_mock();
        let storage = storage(&mock, VolumeLayout::new("tank"));
        let config = node_config("k8s0").with_disk(DiskSpec::new(DiskRole::SecondaryB, 200));
        storage.create_volumes(&config).await.unwrap();

        let vm_id = mock.add_vm("k8s0");
        for path in ["tank/k8s0-boot", "tank/k8s0-ebs", "tank/k8s0-rook"] {
            mock.attach_disk(vm_id, path);
        }

        let by_device: BTreeSet<String> = StorageVolumeManager::discover_volumes_for_vm(&mock.vm_devices(vm_id), "tank")
            .into_iter()
            .collect();
        let by_name: BTreeSet<String> = storage
            .discover_volumes_by_naming_pattern("tank", "k8s0")
            .await
            .unwrap()
            .into_iter()
            .collect();

        assert_eq!(by_device.len(), 3);
        assert!(by_device.is_subset(&by_name));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_continues_past_failures() {
        let mock = truenas_mock();
        for path in ["tank/k8s0-boot", "tank/k8s0-ebs", "tank/k8s0-rook"] {
            mock.add_volume(path, GIB);
        }
        mock.fail_target("pool.dataset.delete", "tank/k8s0-ebs");
        let storage = storage(&mock, VolumeLayout::new("tank"));

        let paths: Vec<String> = ["tank/k8s0-boot", "tank/k8s0-ebs", "tank/k8s0-rook"]
            .iter()
            .map(|p| (*p).to_string())
            .collect();
        let result = storage.delete_volumes(&paths).await;

        let VolumeDeletion::Partial { deleted, failed } = &result else {
            panic!("expected a partial failure, got {result:?}");
        };
        assert_eq!(deleted, &["tank/k8s0-boot", "tank/k8s0-rook"]);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].path, "tank/k8s0-ebs");
        assert_eq!(mock.dataset_paths(DatasetType::Volume), ["tank/k8s0-ebs"]);
    }

    #[tokio::test]
    async fn test_delete_of_missing_volume_counts_as_deleted() {
        let mock = truenas_mock();
        let storage = storage(&mock, VolumeLayout::new("tank"));

        let result = storage.delete_volumes(&["tank/k8s0-boot".to_string()]).await;
        assert!(matches!(result, VolumeDeletion::AllDeleted(ref d) if d.len() == 1));
    }
}
