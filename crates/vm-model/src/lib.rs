//! VM configuration model
//!
//! The in-memory description of a machine to be provisioned, shared by both
//! backends: compute, disk roles, network attachment, console access, install
//! media and the audit-only custom image metadata.
//!
//! Also owns the two pieces of pure logic both backends rely on:
//! - `naming`: backend naming rules, checked before any remote call
//! - `volume`: deterministic volume path derivation and candidate generation
//!
//! # Example
//!
//! ```
//! use vm_model::{Backend, DiskRole, DiskSpec, VmConfiguration, VolumeLayout};
//!
//! let config = VmConfiguration::new("k8s0", 4, 8192, "br0")
//!     .with_disk(DiskSpec::new(DiskRole::Boot, 100))
//!     .with_disk(DiskSpec::new(DiskRole::SecondaryA, 800));
//! config.validate(Backend::TrueNas).unwrap();
//!
//! let layout = VolumeLayout::new("tank");
//! assert_eq!(layout.path_for("k8s0", DiskRole::Boot), "tank/k8s0-boot");
//! ```

pub mod config;
pub mod error;
pub mod naming;
pub mod volume;

pub use config::*;
pub use error::ModelError;
pub use naming::{validate_vm_name, Backend};
pub use volume::*;
