//! vSphere backend
//!
//! - `builder.rs` - the phased VM builder
//! - `devices.rs` - shell and disk device specs

pub mod builder;
pub mod devices;
mod builder_test;

pub use builder::{BuilderTimings, VmBuilder};
