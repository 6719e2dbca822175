//! Test utilities for unit testing the backends
//!
//! Builds managers over the in-memory mocks with a fast, jitter-free retry
//! schedule.

use crate::settings::RecoverySettings;
use crate::truenas::MachineManager;
use crate::vsphere::{BuilderTimings, VmBuilder};
use recovery::{ExponentialBackoff, RecoveryManager};
use std::sync::Arc;
use std::time::Duration;
use truenas_client::{MockTrueNasClient, TrueNasClientTrait};
use vm_model::{DiskRole, DiskSpec, VmConfiguration, VolumeLayout};
use vsphere_client::{MockVSphereClient, VSphereClientTrait};

/// Three attempts, 10ms then 20ms apart
pub fn test_recovery() -> Arc<RecoveryManager> {
    let backoff = ExponentialBackoff::new(Duration::from_millis(10), 2.0, Duration::from_millis(100), 3).without_jitter();
    Arc::new(RecoveryManager::new(Arc::new(backoff)))
}

/// Default recovery settings with their circuit breaker, as the binary wires them
pub fn settings_recovery() -> Arc<RecoveryManager> {
    let settings = RecoverySettings::default();
    Arc::new(
        RecoveryManager::new(Arc::new(settings.backoff())).with_circuit_breaker(Arc::new(settings.circuit_breaker())),
    )
}

/// Mock TrueNAS with an empty `tank` pool
pub fn truenas_mock() -> MockTrueNasClient {
    let mock = MockTrueNasClient::new("nas.test");
    mock.add_pool("tank");
    mock
}

pub fn machine_manager(mock: &MockTrueNasClient) -> MachineManager {
    let client: Arc<dyn TrueNasClientTrait> = Arc::new(mock.clone());
    MachineManager::new(client, VolumeLayout::new("tank"), test_recovery())
}

pub fn vsphere_mock() -> MockVSphereClient {
    MockVSphereClient::new("esxi.test", "datastore1")
}

pub fn vm_builder(mock: &MockVSphereClient) -> VmBuilder {
    vm_builder_with(mock, test_recovery())
}

pub fn vm_builder_with(mock: &MockVSphereClient, recovery: Arc<RecoveryManager>) -> VmBuilder {
    let client: Arc<dyn VSphereClientTrait> = Arc::new(mock.clone());
    VmBuilder::new(client, recovery).with_timings(BuilderTimings::default())
}

/// Node with a 100 GiB boot disk and an 800 GiB secondary disk on `br0`
pub fn node_config(name: &str) -> VmConfiguration {
    VmConfiguration::new(name, 4, 8192, "br0")
        .with_disk(DiskSpec::new(DiskRole::Boot, 100))
        .with_disk(DiskSpec::new(DiskRole::SecondaryA, 800))
}
