//! Volume naming convention
//!
//! A volume path is `{pool}/{vm}-{suffix}` where the suffix comes from the
//! disk role. Derivation is pure: creation and later orphan discovery both
//! recompute paths independently and must land on the same strings.

use crate::config::{DiskRole, DiskSpec, Provisioning};
use serde::{Deserialize, Serialize};

/// Optional sub-path some pools keep VM volumes under
pub const RESERVED_SEGMENT: &str = "vms";

/// Device path prefix the storage control plane exposes volumes under
pub const ZVOL_DEVICE_PREFIX: &str = "/dev/zvol/";

/// Derive the volume path for one disk role.
pub fn volume_path(pool: &str, vm_name: &str, role: DiskRole) -> String {
    format!("{}/{}-{}", pool.trim_end_matches('/'), vm_name, role.suffix())
}

/// Strip a trailing reserved segment, e.g. `tank/vms` -> `tank`.
pub fn strip_reserved_segment(pool: &str) -> &str {
    let pool = pool.trim_end_matches('/');
    match pool.strip_suffix(RESERVED_SEGMENT) {
        Some(rest) if rest.ends_with('/') => rest.trim_end_matches('/'),
        _ => pool,
    }
}

/// Block device path of a volume
pub fn device_path(volume_path: &str) -> String {
    format!("{ZVOL_DEVICE_PREFIX}{volume_path}")
}

/// Volume path behind a block device path, if it follows the prefix convention
pub fn volume_from_device_path(device: &str) -> Option<&str> {
    device
        .strip_prefix(ZVOL_DEVICE_PREFIX)
        .filter(|path| !path.is_empty())
}

/// Where a VM's volumes live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeLayout {
    /// Pool or parent dataset, e.g. `tank` or `tank/k8s`
    pub pool: String,
    /// Place volumes under the reserved segment (`{pool}/vms/...`)
    #[serde(default)]
    pub nested: bool,
}

impl VolumeLayout {
    pub fn new(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            nested: false,
        }
    }

    pub fn nested(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            nested: true,
        }
    }

    /// Parent path volumes are created under.
    ///
    /// A pool that already ends in the reserved segment does not get it twice.
    pub fn volume_root(&self) -> String {
        let pool = self.pool.trim_end_matches('/');
        if self.nested && strip_reserved_segment(pool) == pool {
            format!("{pool}/{RESERVED_SEGMENT}")
        } else {
            pool.to_string()
        }
    }

    pub fn path_for(&self, vm_name: &str, role: DiskRole) -> String {
        volume_path(&self.volume_root(), vm_name, role)
    }

    /// Planned volume for one disk of `vm_name`
    pub fn planned(&self, vm_name: &str, disk: &DiskSpec) -> StorageVolume {
        StorageVolume {
            path: self.path_for(vm_name, disk.role),
            role: Some(disk.role),
            size_gb: disk.size_gb,
            provisioning: disk.provisioning,
            state: VolumeState::Absent,
        }
    }
}

/// Every plausible path a volume of `vm_name` could have under `pool`.
///
/// Covers the pool with and without the reserved segment for every role, so
/// `tank` and `tank/vms` produce the same candidate set.
pub fn candidate_paths(pool: &str, vm_name: &str) -> Vec<String> {
    let base = strip_reserved_segment(pool);
    let nested = format!("{base}/{RESERVED_SEGMENT}");
    let mut paths = Vec::with_capacity(DiskRole::ALL.len() * 2);
    for root in [base, nested.as_str()] {
        for role in DiskRole::ALL {
            paths.push(volume_path(root, vm_name, role));
        }
    }
    paths
}

/// How a volume name was tied to a VM during naming-pattern discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameMatch {
    /// Path is one of [`candidate_paths`]
    Exact,
    /// Last segment ends with `-{vm}-{suffix}`
    Prefixed,
    /// Last segment contains the VM name and ends with a role suffix.
    ///
    /// Over-matches when one VM name is a substring of another
    /// (`k8s` vs `k8s_extra`).
    Flexible,
}

/// Classify `volume_path` against `vm_name` using the loose matching rules.
///
/// Exact candidate matching is done by the caller against
/// [`candidate_paths`]; this only looks at the final path segment.
pub fn match_volume_name(volume_path: &str, vm_name: &str) -> Option<NameMatch> {
    let leaf = volume_path.rsplit('/').next().unwrap_or(volume_path);
    for role in DiskRole::ALL {
        let exact_leaf = format!("{vm_name}-{}", role.suffix());
        if leaf == exact_leaf {
            return Some(NameMatch::Exact);
        }
        if leaf.ends_with(&format!("-{exact_leaf}")) {
            return Some(NameMatch::Prefixed);
        }
    }
    let has_suffix = DiskRole::ALL
        .iter()
        .any(|role| leaf.ends_with(&format!("-{}", role.suffix())));
    (has_suffix && leaf.contains(vm_name)).then_some(NameMatch::Flexible)
}

/// Existence state of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    Absent,
    Present,
}

/// A block volume backing one VM disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageVolume {
    pub path: String,
    /// Role when known; discovered volumes may not carry one
    pub role: Option<DiskRole>,
    pub size_gb: u64,
    pub provisioning: Provisioning,
    pub state: VolumeState,
}

impl StorageVolume {
    pub fn size_bytes(&self) -> u64 {
        self.size_gb * 1024 * 1024 * 1024
    }

    pub fn device_path(&self) -> String {
        device_path(&self.path)
    }
}
