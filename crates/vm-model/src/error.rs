//! Configuration model errors

use crate::naming::Backend;
use thiserror::Error;

/// Errors raised while validating a VM configuration.
///
/// All of these are operator errors: nothing has been sent to a control plane
/// when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// VM name violates the backend naming rules
    #[error("invalid VM name {name:?} for {backend}: {reason}")]
    InvalidName {
        name: String,
        backend: Backend,
        reason: String,
    },

    /// Configuration is structurally invalid
    #[error("invalid configuration for VM {name}: {reason}")]
    InvalidConfig { name: String, reason: String },
}
