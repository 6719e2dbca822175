//! Backend naming rules
//!
//! Names are validated before any remote call so a bad name never leaves
//! half-created volumes or VM shells behind.

use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum VM name length accepted by the TrueNAS middleware
const TRUENAS_MAX_NAME_LEN: usize = 63;

/// Maximum display name length accepted by vSphere
const VSPHERE_MAX_NAME_LEN: usize = 80;

/// Characters vSphere escapes in inventory paths and datastore folders
const VSPHERE_FORBIDDEN: &[char] = &['%', '/', '\\', '[', ']'];

/// Provisioning backend a configuration is aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// TrueNAS virtualization + ZFS storage control plane
    TrueNas,
    /// vSphere / ESXi hypervisor control plane
    #[serde(alias = "esxi")]
    VSphere,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::TrueNas => write!(f, "truenas"),
            Backend::VSphere => write!(f, "vsphere"),
        }
    }
}

/// Validate a VM name against the rules of `backend`.
///
/// TrueNAS only accepts alphanumerics and underscores. The `-` separator is
/// reserved because volume names are built as `{name}-{role}` and orphan
/// discovery splits on it.
pub fn validate_vm_name(name: &str, backend: Backend) -> Result<(), ModelError> {
    let invalid = |reason: &str| ModelError::InvalidName {
        name: name.to_string(),
        backend,
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(invalid("name must not contain whitespace"));
    }

    match backend {
        Backend::TrueNas => {
            if name.len() > TRUENAS_MAX_NAME_LEN {
                return Err(invalid(&format!(
                    "name must be at most {TRUENAS_MAX_NAME_LEN} characters"
                )));
            }
            if let Some(c) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_')) {
                return Err(invalid(&format!(
                    "character {c:?} is not allowed (alphanumerics and '_' only)"
                )));
            }
        }
        Backend::VSphere => {
            if name.chars().count() > VSPHERE_MAX_NAME_LEN {
                return Err(invalid(&format!(
                    "name must be at most {VSPHERE_MAX_NAME_LEN} characters"
                )));
            }
            if let Some(c) = name.chars().find(|c| VSPHERE_FORBIDDEN.contains(c)) {
                return Err(invalid(&format!("character {c:?} is not allowed")));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truenas_rejects_separator() {
        let err = validate_vm_name("k8s-0", Backend::TrueNas).unwrap_err();
        assert!(matches!(err, ModelError::InvalidName { backend: Backend::TrueNas, .. }));
        assert!(err.to_string().contains("'-'"));
    }

    #[test]
    fn test_truenas_accepts_alphanumeric_and_underscore() {
        assert!(validate_vm_name("k8s0", Backend::TrueNas).is_ok());
        assert!(validate_vm_name("k8s_worker_1", Backend::TrueNas).is_ok());
    }

    #[test]
    fn test_vsphere_accepts_dashes() {
        assert!(validate_vm_name("k8s-cp-0", Backend::VSphere).is_ok());
    }

    #[test]
    fn test_vsphere_rejects_path_characters() {
        assert!(validate_vm_name("a/b", Backend::VSphere).is_err());
        assert!(validate_vm_name("[ds1]", Backend::VSphere).is_err());
    }

    #[test]
    fn test_empty_and_whitespace_rejected_everywhere() {
        for backend in [Backend::TrueNas, Backend::VSphere] {
            assert!(validate_vm_name("", backend).is_err());
            assert!(validate_vm_name("k8s 0", backend).is_err());
        }
    }

    #[test]
    fn test_length_limits() {
        let long = "a".repeat(64);
        assert!(validate_vm_name(&long, Backend::TrueNas).is_err());
        assert!(validate_vm_name(&long, Backend::VSphere).is_ok());
        assert!(validate_vm_name(&"a".repeat(81), Backend::VSphere).is_err());
    }
}
