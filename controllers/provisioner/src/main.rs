//! Fleet Provisioner
//!
//! Deploys, deletes or lists the VMs named in the settings file on the
//! configured backend. See [`provisioner::settings`] for configuration.

use anyhow::Context;
use prometheus::{Encoder, Registry, TextEncoder};
use provisioner::settings::{Action, ProvisionerSettings};
use provisioner::{BatchCoordinator, MachineManager, VmBackend, VmBuilder};
use recovery::{RecoveryManager, RecoveryMetrics};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use truenas_client::TrueNasClient;
use vm_model::Backend;
use vsphere_client::VSphereClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Shared by the websocket and HTTPS clients
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Fleet Provisioner");
    let settings = ProvisionerSettings::load().context("loading provisioner settings")?;

    info!("Configuration:");
    info!("  Backend: {}", settings.backend);
    info!("  Action: {:?}", settings.action);
    info!("  VMs: {}", settings.vms.len());
    info!("  Concurrency: {}", settings.batch.concurrency);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling pending retries");
            on_signal.cancel();
        }
    });

    let registry = Registry::new();
    let recovery = Arc::new(
        RecoveryManager::new(Arc::new(settings.recovery.backoff()))
            .with_circuit_breaker(Arc::new(settings.recovery.circuit_breaker()))
            .with_metrics(RecoveryMetrics::new(&registry).context("registering recovery metrics")?)
            .with_cancellation(cancel),
    );

    let backend = build_backend(&settings, recovery)?;
    let outcome = run(&settings, backend).await;

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding recovery metrics")?;
    info!("Recovery metrics:\n{}", String::from_utf8_lossy(&buffer));

    outcome
}

fn build_backend(settings: &ProvisionerSettings, recovery: Arc<RecoveryManager>) -> anyhow::Result<Arc<dyn VmBackend>> {
    match settings.backend {
        Backend::TrueNas => {
            let truenas = settings.truenas.as_ref().context("truenas section missing")?;
            info!("  TrueNAS: {} (volumes under {})", truenas.host, truenas.layout().volume_root());
            let client = TrueNasClient::new(truenas.host.as_str(), truenas.api_key.as_str(), truenas.verify_tls);
            let manager = MachineManager::new(Arc::new(client), truenas.layout(), recovery)
                .with_delete_poll(truenas.delete_poll());
            Ok(Arc::new(manager))
        }
        Backend::VSphere => {
            let vsphere = settings.vsphere.as_ref().context("vsphere section missing")?;
            info!("  vSphere: {} (datastore {})", vsphere.host, vsphere.datastore);
            let client = VSphereClient::new(vsphere.client_config()).context("building vSphere client")?;
            let builder = VmBuilder::new(Arc::new(client), recovery).with_timings(settings.builder.timings());
            Ok(Arc::new(builder))
        }
    }
}

async fn run(settings: &ProvisionerSettings, backend: Arc<dyn VmBackend>) -> anyhow::Result<()> {
    match settings.action {
        Action::Deploy => {
            let coordinator = BatchCoordinator::new(backend, settings.batch.concurrency);
            let report = coordinator.deploy_many(settings.vms.clone()).await?;
            for deployment in &report.succeeded {
                info!(
                    "VM {} ready: id {}, {} device(s), {} volume(s), powered on: {}",
                    deployment.name,
                    deployment.vm_id,
                    deployment.device_count,
                    deployment.volumes.len(),
                    deployment.powered_on
                );
            }
            Ok(())
        }
        Action::Delete => {
            let mut failed = Vec::new();
            for vm in &settings.vms {
                match backend.delete(&vm.name, settings.delete_volumes).await {
                    Ok(report) => {
                        info!(
                            "VM {}: deleted: {}, volumes: {:?}",
                            report.name,
                            report.vm_deleted,
                            report.volumes.deleted()
                        );
                        for failure in report.volumes.failed() {
                            warn!("VM {}: volume {} left behind: {}", report.name, failure.path, failure.error);
                        }
                        if report.volumes.has_failures() {
                            failed.push(vm.name.clone());
                        }
                    }
                    Err(e) => {
                        error!("VM {}: delete failed: {}", vm.name, e);
                        failed.push(vm.name.clone());
                    }
                }
            }
            if failed.is_empty() {
                Ok(())
            } else {
                anyhow::bail!("deleting {} VM(s) did not complete: {}", failed.len(), failed.join(", "))
            }
        }
        Action::List => {
            for vm in backend.list().await? {
                info!(
                    "{} (id {}): {}, {} vCPU, {} MiB",
                    vm.name, vm.id, vm.power_state, vm.vcpus, vm.memory_mb
                );
            }
            Ok(())
        }
    }
}
