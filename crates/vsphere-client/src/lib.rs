//! vSphere client
//!
//! A client for the vSphere VI/JSON API covering what a VM provisioner
//! needs: creating a VM shell, adding devices by reconfiguration,
//! unregistering and re-registering a VM from its `.vmx` descriptor,
//! power control, and datastore uploads for install media.
//!
//! # Example
//!
//! ```no_run
//! use vsphere_client::{VSphereClient, VSphereClientTrait, VSphereConfig, VmSpec};
//!
//! # async fn example() -> Result<(), vsphere_client::VSphereError> {
//! let config = VSphereConfig::esxi("esxi01.lab.local", "root", "secret", "datastore1");
//! let client = VSphereClient::new(config)?;
//!
//! let vm_id = client.create_vm(&VmSpec::new("k8s0", 4, 8192)).await?;
//! let info = client.get_vm_info(&vm_id).await?;
//! println!("{} is {}", info.name, info.power_state);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Session handling**: logs in lazily and renews an expired session once
//! - **Task polling**: `*_Task` methods return when the task has finished
//! - **Error categories**: `VSphereError` maps fault names onto
//!   `recovery::ErrorCategory` for retry decisions

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod vsphere_trait;
mod wire;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::VSphereClient;
pub use error::VSphereError;
pub use models::*;
pub use vsphere_trait::VSphereClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockVSphereClient;
