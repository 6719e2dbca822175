//! TrueNAS backend
//!
//! - `storage`: ZVol creation, verification, discovery and deletion
//! - `machine`: VM deployment and deletion over the middleware session
//! - `devices`: the ordered device list of a VM

pub mod devices;
pub mod machine;
pub mod storage;

mod storage_test;

pub use machine::{DeletePoll, MachineManager};
pub use storage::StorageVolumeManager;
