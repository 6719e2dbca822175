//! Provisioner settings
//!
//! Everything except secrets comes from a YAML file named by
//! `PROVISIONER_CONFIG` (default `provisioner.yaml`). Secrets and host
//! overrides come from the environment:
//!
//! - `TRUENAS_API_KEY`, `TRUENAS_HOST`
//! - `VSPHERE_PASSWORD`, `VSPHERE_USERNAME`, `VSPHERE_HOST`
//! - `PROVISIONER_ACTION`: `deploy` (default), `delete` or `list`

use crate::batch::DEFAULT_CONCURRENCY;
use crate::error::ProvisionError;
use crate::truenas::DeletePoll;
use crate::vsphere::BuilderTimings;
use recovery::{CircuitBreaker, ExponentialBackoff};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use vm_model::{Backend, VmConfiguration, VolumeLayout};
use vsphere_client::VSphereConfig;

pub const DEFAULT_CONFIG_PATH: &str = "provisioner.yaml";

/// What the binary does with the configured VMs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    Deploy,
    Delete,
    List,
}

impl FromStr for Action {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deploy" | "create" => Ok(Action::Deploy),
            "delete" | "destroy" => Ok(Action::Delete),
            "list" => Ok(Action::List),
            other => Err(ProvisionError::Settings(format!(
                "unknown action {other:?} (expected deploy, delete or list)"
            ))),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

/// TrueNAS connection and pool layout
#[derive(Debug, Clone, Deserialize)]
pub struct TrueNasSettings {
    #[serde(default)]
    pub host: String,
    #[serde(skip)]
    pub api_key: String,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    /// Pool (or dataset) volumes are created under
    pub pool: String,
    /// Place volumes under the reserved `vms` segment of the pool
    #[serde(default)]
    pub nested: bool,
    #[serde(default = "default_delete_polls")]
    pub delete_polls: u32,
}

fn default_delete_polls() -> u32 {
    DeletePoll::default().attempts
}

impl TrueNasSettings {
    /// Volume layout under the configured pool
    pub fn layout(&self) -> VolumeLayout {
        if self.nested {
            VolumeLayout::nested(self.pool.as_str())
        } else {
            VolumeLayout::new(self.pool.as_str())
        }
    }

    /// Delete-confirmation polling, at least one poll
    pub fn delete_poll(&self) -> DeletePoll {
        DeletePoll {
            attempts: self.delete_polls.max(1),
            ..DeletePoll::default()
        }
    }
}

fn default_datacenter() -> String {
    "ha-datacenter".to_string()
}

fn default_folder() -> String {
    "ha-folder-vm".to_string()
}

fn default_resource_pool() -> String {
    "ha-root-pool".to_string()
}

/// vSphere connection and placement
#[derive(Debug, Clone, Deserialize)]
pub struct VSphereSettings {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(skip)]
    pub password: String,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    #[serde(default = "default_datacenter")]
    pub datacenter: String,
    pub datastore: String,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default = "default_resource_pool")]
    pub resource_pool: String,
}

impl VSphereSettings {
    /// Client configuration for the configured host
    pub fn client_config(&self) -> VSphereConfig {
        let mut config = VSphereConfig::esxi(
            self.host.as_str(),
            self.username.as_str(),
            self.password.as_str(),
            self.datastore.as_str(),
        );
        config.verify_tls = self.verify_tls;
        config.datacenter.clone_from(&self.datacenter);
        config.folder.clone_from(&self.folder);
        config.resource_pool.clone_from(&self.resource_pool);
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BatchSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// vSphere builder waits, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BuilderSettings {
    pub reregister_grace_secs: u64,
    pub power_on_delays_secs: Vec<u64>,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        let timings = BuilderTimings::default();
        Self {
            reregister_grace_secs: timings.reregister_grace.as_secs(),
            power_on_delays_secs: timings.power_on_delays.iter().map(Duration::as_secs).collect(),
        }
    }
}

impl BuilderSettings {
    pub fn timings(&self) -> BuilderTimings {
        BuilderTimings {
            reregister_grace: Duration::from_secs(self.reregister_grace_secs),
            power_on_delays: self.power_on_delays_secs.iter().copied().map(Duration::from_secs).collect(),
        }
    }
}

/// Retry and circuit breaker tuning
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
    /// Consecutive failures that open the circuit of an operation family
    pub circuit_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_secs: 30,
            max_attempts: 3,
            circuit_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

impl RecoverySettings {
    /// Default retry schedule
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.base_delay_ms),
            self.multiplier,
            Duration::from_secs(self.max_delay_secs),
            self.max_attempts.max(1),
        )
    }

    /// Breaker shared by every operation family
    pub fn circuit_breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(
            self.circuit_threshold.max(1),
            Duration::from_secs(self.recovery_timeout_secs),
        )
    }
}

/// Root of the settings file
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionerSettings {
    pub backend: Backend,
    #[serde(default)]
    pub truenas: Option<TrueNasSettings>,
    #[serde(default)]
    pub vsphere: Option<VSphereSettings>,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub builder: BuilderSettings,
    #[serde(default)]
    pub recovery: RecoverySettings,
    /// Delete volumes along with VMs (TrueNAS)
    #[serde(default = "default_true")]
    pub delete_volumes: bool,
    #[serde(default)]
    pub vms: Vec<VmConfiguration>,
    #[serde(skip)]
    pub action: Action,
}

impl ProvisionerSettings {
    /// Load from `PROVISIONER_CONFIG` and the process environment
    pub fn load() -> Result<Self, ProvisionError> {
        let path = std::env::var("PROVISIONER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut settings = Self::from_file(&path)?;
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a YAML settings file without env overrides or validation
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProvisionError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| ProvisionError::Settings(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&yaml)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ProvisionError> {
        serde_yaml::from_str(yaml).map_err(|e| ProvisionError::Settings(e.to_string()))
    }

    /// Fill secrets and host overrides from `lookup` (an environment reader)
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ProvisionError> {
        if let Some(truenas) = &mut self.truenas {
            if let Some(host) = lookup("TRUENAS_HOST") {
                truenas.host = host;
            }
            if let Some(api_key) = lookup("TRUENAS_API_KEY") {
                truenas.api_key = api_key;
            }
        }
        if let Some(vsphere) = &mut self.vsphere {
            if let Some(host) = lookup("VSPHERE_HOST") {
                vsphere.host = host;
            }
            if let Some(username) = lookup("VSPHERE_USERNAME") {
                vsphere.username = username;
            }
            if let Some(password) = lookup("VSPHERE_PASSWORD") {
                vsphere.password = password;
            }
        }
        if let Some(action) = lookup("PROVISIONER_ACTION") {
            self.action = action.parse()?;
        }
        Ok(())
    }

    /// The selected backend has a complete connection section
    pub fn validate(&self) -> Result<(), ProvisionError> {
        let missing = |what: &str| Err(ProvisionError::Settings(format!("{what} is required for backend {}", self.backend)));
        match self.backend {
            Backend::TrueNas => {
                let Some(truenas) = &self.truenas else {
                    return missing("a truenas section");
                };
                if truenas.host.is_empty() {
                    return missing("truenas.host (or TRUENAS_HOST)");
                }
                if truenas.api_key.is_empty() {
                    return missing("TRUENAS_API_KEY");
                }
                if truenas.pool.is_empty() {
                    return missing("truenas.pool");
                }
            }
            Backend::VSphere => {
                let Some(vsphere) = &self.vsphere else {
                    return missing("a vsphere section");
                };
                if vsphere.host.is_empty() {
                    return missing("vsphere.host (or VSPHERE_HOST)");
                }
                if vsphere.username.is_empty() {
                    return missing("vsphere.username (or VSPHERE_USERNAME)");
                }
                if vsphere.password.is_empty() {
                    return missing("VSPHERE_PASSWORD");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const YAML: &str = r"
backend: truenas
truenas:
  host: nas.lab.local
  pool: tank
  nested: true
batch:
  concurrency: 5
builder:
  power_on_delays_secs: [1, 2]
recovery:
  max_attempts: 4
vms:
  - name: k8s0
    vcpus: 4
    memory_mb: 8192
    disks:
      - role: boot
        size_gb: 100
    network:
      network: br0
";

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_file_values_and_defaults() {
        let settings = ProvisionerSettings::from_yaml(YAML).unwrap();

        assert_eq!(settings.backend, Backend::TrueNas);
        assert_eq!(settings.batch.concurrency, 5);
        assert_eq!(settings.builder.reregister_grace_secs, 5);
        assert_eq!(
            settings.builder.timings().power_on_delays,
            [Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert_eq!(settings.recovery.max_attempts, 4);
        assert_eq!(settings.recovery.circuit_threshold, 5);
        assert!(settings.delete_volumes);
        assert_eq!(settings.vms.len(), 1);
        assert_eq!(settings.action, Action::Deploy);

        let truenas = settings.truenas.as_ref().unwrap();
        assert_eq!(truenas.layout().volume_root(), "tank/vms");
        assert_eq!(truenas.delete_poll().attempts, 10);
    }

    #[test]
    fn test_secrets_come_from_the_environment() {
        let mut settings = ProvisionerSettings::from_yaml(YAML).unwrap();
        assert!(settings.validate().is_err());

        settings
            .apply_env(env(&[
                ("TRUENAS_API_KEY", "1-abcdef"),
                ("TRUENAS_HOST", "nas02.lab.local"),
                ("PROVISIONER_ACTION", "delete"),
            ]))
            .unwrap();

        settings.validate().unwrap();
        let truenas = settings.truenas.as_ref().unwrap();
        assert_eq!(truenas.api_key, "1-abcdef");
        assert_eq!(truenas.host, "nas02.lab.local");
        assert_eq!(settings.action, Action::Delete);
    }

    #[test]
    fn test_api_key_in_file_is_ignored() {
        let yaml = YAML.replace("pool: tank", "pool: tank\n  api_key: leaked");
        let settings = ProvisionerSettings::from_yaml(&yaml).unwrap();
        assert!(settings.truenas.unwrap().api_key.is_empty());
    }

    #[test]
    fn test_vsphere_section_required_for_vsphere() {
        let mut settings = ProvisionerSettings::from_yaml("backend: esxi\n").unwrap();
        settings.apply_env(env(&[("VSPHERE_PASSWORD", "secret")])).unwrap();

        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("vsphere section"));
    }

    #[test]
    fn test_vsphere_client_config() {
        let yaml = "backend: vsphere\nvsphere:\n  datastore: datastore1\n  verify_tls: false\n";
        let mut settings = ProvisionerSettings::from_yaml(yaml).unwrap();
        settings
            .apply_env(env(&[
                ("VSPHERE_HOST", "esxi01.lab.local"),
                ("VSPHERE_USERNAME", "root"),
                ("VSPHERE_PASSWORD", "secret"),
            ]))
            .unwrap();
        settings.validate().unwrap();

        let config = settings.vsphere.as_ref().unwrap().client_config();
        assert_eq!(config.host, "esxi01.lab.local");
        assert_eq!(config.folder, "ha-folder-vm");
        assert!(!config.verify_tls);
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        assert!("reboot".parse::<Action>().is_err());
        assert_eq!("List".parse::<Action>().unwrap(), Action::List);
    }
}
