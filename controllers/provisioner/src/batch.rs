//! Batch Deployment Coordinator
//!
//! Fans a list of configurations out to one backend with a bounded number
//! of creations in flight. A failed VM never cancels the others; the
//! outcome of every VM is collected before returning.
//!
//! Power-on belongs to the backend's own creation flow. The coordinator
//! never powers a VM on itself.

use crate::backend::{DeploymentReport, VmBackend};
use crate::error::ProvisionError;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use vm_model::VmConfiguration;

/// Default number of VM creations in flight
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Per-VM outcome of a batch
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<DeploymentReport>,
    /// Failed VM names with their cause, in input order
    pub failed: Vec<(String, ProvisionError)>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Err when at least one VM failed, keeping the successes alongside
    pub fn into_result(self) -> Result<BatchReport, BatchError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(BatchError {
            total: self.total(),
            succeeded: self.succeeded,
            failures: self.failed,
        })
    }
}

fn describe(failures: &[(String, ProvisionError)]) -> String {
    failures
        .iter()
        .map(|(name, error)| format!("{name}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// One or more VMs of a batch failed
#[derive(Debug, Error)]
#[error("{} of {} VM deployment(s) failed: {}", .failures.len(), .total, describe(.failures))]
pub struct BatchError {
    pub total: usize,
    pub succeeded: Vec<DeploymentReport>,
    pub failures: Vec<(String, ProvisionError)>,
}

impl BatchError {
    pub fn failed_names(&self) -> Vec<&str> {
        self.failures.iter().map(|(name, _)| name.as_str()).collect()
    }
}

/// Deploys many VMs on one backend
#[derive(Clone)]
pub struct BatchCoordinator {
    backend: Arc<dyn VmBackend>,
    concurrency: usize,
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("backend", &self.backend.kind())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl BatchCoordinator {
    /// `concurrency` is clamped to at least 1
    pub fn new(backend: Arc<dyn VmBackend>, concurrency: usize) -> Self {
        Self {
            backend,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Create every VM in `configs`, at most `concurrency` at a time.
    ///
    /// Waits for all of them. Returns the full report on success, or a
    /// [`BatchError`] naming every failed VM.
    pub async fn deploy_many(&self, configs: Vec<VmConfiguration>) -> Result<BatchReport, BatchError> {
        info!(
            "Deploying {} VM(s) on {} with concurrency {}",
            configs.len(),
            self.backend.kind(),
            self.concurrency
        );
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        let tasks: Vec<_> = configs
            .into_iter()
            .map(|config| {
                let name = config.name.clone();
                let backend = Arc::clone(&self.backend);
                let semaphore = Arc::clone(&semaphore);
                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.map_err(|e| ProvisionError::TaskFailed {
                        name: config.name.clone(),
                        reason: e.to_string(),
                    })?;
                    backend.create(&config).await
                });
                (name, handle)
            })
            .collect();

        let mut report = BatchReport::default();
        for (name, handle) in tasks {
            let outcome = handle.await.unwrap_or_else(|e| {
                Err(ProvisionError::TaskFailed {
                    name: name.clone(),
                    reason: e.to_string(),
                })
            });
            match outcome {
                Ok(deployment) => {
                    info!("Batch: {} deployed", name);
                    report.succeeded.push(deployment);
                }
                Err(error) => {
                    warn!("Batch: {} failed: {}", name, error);
                    report.failed.push((name, error));
                }
            }
        }

        info!(
            "Batch finished: {} succeeded, {} failed",
            report.succeeded.len(),
            report.failed.len()
        );
        report.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeleteReport, VmSummary};
    use crate::test_utils::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use vm_model::Backend;

    /// Backend that takes a second per creation and tracks the peak in flight
    #[derive(Default)]
    struct SlowBackend {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl VmBackend for SlowBackend {
        fn kind(&self) -> Backend {
            Backend::VSphere
        }

        async fn create(&self, config: &VmConfiguration) -> Result<DeploymentReport, ProvisionError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(DeploymentReport::start(config, Backend::VSphere))
        }

        async fn delete(&self, name: &str, _delete_volumes: bool) -> Result<DeleteReport, ProvisionError> {
            Err(ProvisionError::NotFound(name.to_string()))
        }

        async fn find(&self, _name: &str) -> Result<Option<VmSummary>, ProvisionError> {
            Ok(None)
        }

        async fn list(&self) -> Result<Vec<VmSummary>, ProvisionError> {
            Ok(Vec::new())
        }

        async fn power_on(&self, _name: &str) -> Result<(), ProvisionError> {
            Ok(())
        }

        async fn power_off(&self, _name: &str) -> Result<(), ProvisionError> {
            Ok(())
        }
    }

    fn fleet(count: usize) -> Vec<VmConfiguration> {
        (0..count).map(|i| node_config(&format!("k8s{i}"))).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let backend = Arc::new(SlowBackend::default());
        let coordinator = BatchCoordinator::new(Arc::clone(&backend) as Arc<dyn VmBackend>, 2);

        let report = coordinator.deploy_many(fleet(5)).await.unwrap();

        assert_eq!(report.succeeded.len(), 5);
        assert_eq!(backend.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_invalid_config_fails_alone() {
        let mock = vsphere_mock();
        let coordinator = BatchCoordinator::new(Arc::new(vm_builder(&mock)), DEFAULT_CONCURRENCY);
        let mut configs = fleet(4);
        configs.insert(2, node_config("bad/name"));

        let err = coordinator.deploy_many(configs).await.unwrap_err();

        assert_eq!(err.total, 5);
        assert_eq!(err.succeeded.len(), 4);
        assert_eq!(err.failed_names(), ["bad/name"]);
        assert!(matches!(err.failures[0].1, ProvisionError::Model(_)));
        assert!(err.to_string().contains("bad/name"));
        for i in 0..4 {
            assert!(mock.vm_by_name(&format!("k8s{i}")).is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_vm_is_powered_on_exactly_once() {
        let mock = vsphere_mock();
        let coordinator = BatchCoordinator::new(Arc::new(vm_builder(&mock)), DEFAULT_CONCURRENCY);
        let configs: Vec<VmConfiguration> = fleet(3).into_iter().map(|c| c.powered_on(true)).collect();

        let report = coordinator.deploy_many(configs).await.unwrap();

        assert!(report.succeeded.iter().all(|r| r.powered_on));
        assert_eq!(mock.call_count("PowerOnVM_Task"), 3);
        for i in 0..3 {
            let vm = mock.vm_by_name(&format!("k8s{i}")).unwrap();
            let target = format!("PowerOnVM_Task:{}", vm.id);
            assert_eq!(mock.calls().iter().filter(|c| **c == target).count(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_on_failures_of_one_vm_do_not_open_the_circuit_for_others() {
        let mock = vsphere_mock();
        mock.fail_power_on(6);
        let coordinator = BatchCoordinator::new(Arc::new(vm_builder_with(&mock, settings_recovery())), 3);
        let configs: Vec<VmConfiguration> = fleet(3).into_iter().map(|c| c.powered_on(true)).collect();

        let report = coordinator.deploy_many(configs).await.unwrap();

        assert_eq!(report.succeeded.len(), 3);
        assert!(report.succeeded.iter().all(|r| r.powered_on));
        assert_eq!(mock.call_count("PowerOnVM_Task"), 9);
    }

    #[tokio::test]
    async fn test_coordinator_works_for_truenas() {
        let mock = truenas_mock();
        let coordinator = BatchCoordinator::new(Arc::new(machine_manager(&mock)), 2);

        let report = coordinator.deploy_many(fleet(3)).await.unwrap();

        assert_eq!(report.total(), 3);
        assert_eq!(mock.dataset_paths(truenas_client::DatasetType::Volume).len(), 6);
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let coordinator = BatchCoordinator::new(Arc::new(SlowBackend::default()), 0);
        assert_eq!(coordinator.concurrency(), 1);
    }
}
