//! Unit tests for the vSphere VM Builder

#[cfg(test)]
mod tests {
    use crate::backend::{Phase, VmBackend, VmPowerState};
    use crate::error::ProvisionError;
    use crate::test_utils::*;
    use std::time::Duration;
    use vsphere_client::{PowerState, VirtualDevice};

    #[tokio::test(start_paused = true)]
    async fn test_create_walks_every_phase_in_order() {
        let mock = vsphere_mock();
        let builder = vm_builder(&mock);

        let report = builder.create_vm(&node_config("k8s0")).await.unwrap();

        assert_eq!(report.phases, [Phase::ShellCreated, Phase::DisksAttached, Phase::Reregistered]);
        assert_eq!(
            mock.calls(),
            [
                "childEntity:k8s0",
                "CreateVM_Task:k8s0",
                "config:1",
                "ReconfigVM_Task:1",
                "config:1",
                "UnregisterVM:1",
                "RegisterVM_Task:[datastore1] k8s0/k8s0.vmx",
                "config:2",
            ]
        );
        assert_eq!(report.vm_id, "2");
        assert_eq!(
            report.volumes,
            ["[datastore1] k8s0/k8s0.vmdk", "[datastore1] k8s0/k8s0_1.vmdk"]
        );
        assert_eq!(report.device_count, 4);
        assert!(!report.powered_on);
        assert_eq!(mock.call_count("PowerOnVM_Task"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disks_land_on_the_created_controller() {
        let mock = vsphere_mock();
        let builder = vm_builder(&mock);

        builder.create_vm(&node_config("k8s0")).await.unwrap();

        let vm = mock.vm_by_name("k8s0").unwrap();
        let controller = vm.controllers().next().map(VirtualDevice::key).unwrap();
        assert!(vm.disks().all(|d| d.controller_key() == Some(controller)));
        let capacities: Vec<u64> = vm
            .disks()
            .filter_map(|d| match d {
                VirtualDevice::Disk { capacity_kb, .. } => Some(*capacity_kb),
                _ => None,
            })
            .collect();
        assert_eq!(capacities, [100 * 1024 * 1024, 800 * 1024 * 1024]);
        let units: Vec<Option<i32>> = vm
            .disks()
            .map(|d| match d {
                VirtualDevice::Disk { unit_number, .. } => *unit_number,
                _ => None,
            })
            .collect();
        assert_eq!(units, [Some(0), Some(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistration_makes_the_vm_bootable() {
        let mock = vsphere_mock();
        let builder = vm_builder(&mock);

        let report = builder.create_vm(&node_config("k8s0").powered_on(true)).await.unwrap();

        assert!(report.powered_on);
        assert!(report.reached(Phase::PoweredOn));
        assert!(!mock.is_descriptor_stale("k8s0"));
        assert_eq!(mock.call_count("PowerOnVM_Task"), 1);
        assert_eq!(mock.vm_by_name("k8s0").unwrap().power_state, PowerState::PoweredOn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_on_retries_on_fixed_schedule() {
        let mock = vsphere_mock();
        mock.fail_power_on(2);
        let builder = vm_builder(&mock);

        let report = builder.create_vm(&node_config("k8s0").powered_on(true)).await.unwrap();

        assert!(report.powered_on);
        assert_eq!(mock.call_count("PowerOnVM_Task"), 3);
        // 5s grace, then 5s and 10s between power-on attempts
        assert!(report.elapsed >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_on_exhaustion_reports_total_wait() {
        let mock = vsphere_mock();
        mock.fail_power_on(10);
        let builder = vm_builder(&mock);

        let err = builder
            .create_vm(&node_config("k8s0").powered_on(true))
            .await
            .unwrap_err();

        let ProvisionError::PowerOn { attempts, waited, .. } = &err else {
            panic!("expected a power-on failure, got {err:?}");
        };
        assert_eq!(*attempts, 4);
        assert!(*waited >= Duration::from_secs(35));
        assert_eq!(mock.call_count("PowerOnVM_Task"), 4);
        assert!(err.root_cause().to_string().contains("PowerOnVM_Task"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_install_media_is_uploaded() {
        let iso = std::env::temp_dir().join(format!("metal-{}.iso", std::process::id()));
        std::fs::write(&iso, b"iso").unwrap();
        let mock = vsphere_mock();
        let builder = vm_builder(&mock);
        let config = node_config("k8s0").with_install_media(iso.to_string_lossy());

        builder.create_vm(&config).await.unwrap();

        let expected = format!("[datastore1] iso/metal-{}.iso", std::process::id());
        assert_eq!(mock.uploads(), [(iso.clone(), expected.clone())]);
        let vm = mock.vm_by_name("k8s0").unwrap();
        let cdrom = vm.devices.iter().find_map(|d| match d {
            VirtualDevice::Cdrom { iso_path, .. } => Some(iso_path.clone()),
            _ => None,
        });
        assert_eq!(cdrom, Some(expected));
        std::fs::remove_file(iso).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_datastore_media_is_used_as_is() {
        let mock = vsphere_mock();
        let builder = vm_builder(&mock);
        let config = node_config("k8s0").with_install_media("[datastore1] iso/metal-amd64.iso");

        let report = builder.create_vm(&config).await.unwrap();

        assert!(mock.uploads().is_empty());
        assert_eq!(report.device_count, 6);
    }

    #[tokio::test]
    async fn test_missing_local_media_stops_before_the_shell() {
        let mock = vsphere_mock();
        let builder = vm_builder(&mock);
        let config = node_config("k8s0").with_install_media("/nonexistent/metal-amd64.iso");

        let err = builder.create_vm(&config).await.unwrap_err();

        assert!(matches!(&err, ProvisionError::VSphere { operation, .. } if operation == "upload"));
        assert_eq!(mock.call_count("CreateVM_Task"), 0);
    }

    #[tokio::test]
    async fn test_url_media_is_rejected_without_calls() {
        let mock = vsphere_mock();
        let builder = vm_builder(&mock);
        let config = node_config("k8s0").with_install_media("https://factory.talos.dev/image/metal-amd64.iso");

        let err = builder.create_vm(&config).await.unwrap_err();

        assert!(matches!(err, ProvisionError::Model(_)));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_existing_vm_is_rejected() {
        let mock = vsphere_mock();
        mock.add_vm("k8s0", PowerState::PoweredOff);
        let builder = vm_builder(&mock);

        let err = builder.create_vm(&node_config("k8s0")).await.unwrap_err();

        assert!(matches!(err, ProvisionError::AlreadyExists(_)));
        assert_eq!(mock.call_count("CreateVM_Task"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_powers_off_then_destroys() {
        let mock = vsphere_mock();
        let builder = vm_builder(&mock);
        builder.create_vm(&node_config("k8s0").powered_on(true)).await.unwrap();

        let report = builder.delete("k8s0", true).await.unwrap();

        assert!(report.vm_deleted);
        assert_eq!(report.volumes.deleted().len(), 2);
        let calls = mock.calls();
        let off = calls.iter().position(|c| c == "PowerOffVM_Task:2").unwrap();
        let destroy = calls.iter().position(|c| c == "Destroy_Task:2").unwrap();
        assert!(off < destroy);
        assert!(mock.vm_by_name("k8s0").is_none());
    }

    #[tokio::test]
    async fn test_delete_of_stopped_vm_skips_power_off() {
        let mock = vsphere_mock();
        mock.add_vm("k8s0", PowerState::PoweredOff);
        let builder = vm_builder(&mock);

        builder.delete("k8s0", false).await.unwrap();

        assert_eq!(mock.call_count("PowerOffVM_Task"), 0);
        assert!(matches!(builder.delete("k8s0", false).await, Err(ProvisionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_lookups_and_power_controls() {
        let mock = vsphere_mock();
        mock.add_vm("k8s1", PowerState::PoweredOn);
        mock.add_vm("k8s0", PowerState::PoweredOff);
        let builder = vm_builder(&mock);

        let states: Vec<(String, VmPowerState)> = builder
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|v| (v.name, v.power_state))
            .collect();
        assert_eq!(
            states,
            [("k8s0".to_string(), VmPowerState::Off), ("k8s1".to_string(), VmPowerState::On)]
        );

        builder.power_on("k8s1").await.unwrap();
        assert_eq!(mock.call_count("PowerOnVM_Task"), 0);

        builder.power_off("k8s1").await.unwrap();
        let summary = builder.find("k8s1").await.unwrap().unwrap();
        assert_eq!(summary.power_state, VmPowerState::Off);
        assert!(builder.find("k8s9").await.unwrap().is_none());
    }
}
