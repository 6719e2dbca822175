//! TrueNAS middleware client
//!
//! A client for the TrueNAS SCALE middleware API covering the pieces a VM
//! provisioner needs: VM objects, their ordered device lists, and datasets
//! (filesystems and ZVols).
//!
//! # Example
//!
//! ```no_run
//! use truenas_client::{CreateDatasetRequest, TrueNasClient, TrueNasClientTrait};
//!
//! # async fn example() -> Result<(), truenas_client::TrueNasError> {
//! let client = TrueNasClient::new("nas.lab.local", "1-abcdef", false);
//!
//! if client.get_dataset("tank/vms/k8s0-boot").await?.is_none() {
//!     let gib = 1024 * 1024 * 1024;
//!     client
//!         .create_dataset(&CreateDatasetRequest::volume("tank/vms/k8s0-boot", 100 * gib, true))
//!         .await?;
//! }
//!
//! for vm in client.list_vms().await? {
//!     println!("{} {}", vm.name, vm.status.state);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Persistent session**: one authenticated websocket per client, serialized
//! - **Job polling**: background jobs (`vm.stop`, recursive deletes) are awaited
//! - **Error categories**: `TrueNasError` maps middleware errno names onto
//!   `recovery::ErrorCategory` for retry decisions

pub mod client;
pub mod error;
pub mod models;
mod rpc;
#[path = "trait.rs"]
pub mod truenas_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::TrueNasClient;
pub use error::TrueNasError;
pub use models::*;
pub use truenas_trait::TrueNasClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockTrueNasClient;
