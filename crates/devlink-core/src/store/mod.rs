// ── Device storage ──
//
// The runtime reads and writes devices only through `DeviceManager`.
// Each operation is individually atomic; callers needing more than that
// synchronize externally.

mod file;
mod memory;

pub use file::FileDeviceManager;
pub use memory::MemoryDeviceManager;

use thiserror::Error;

use crate::model::Device;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("device '{id}' already exists")]
    AlreadyExists { id: String },

    #[error("device '{id}' not found")]
    NotFound { id: String },

    #[error("device store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Owner of the local device set.
pub trait DeviceManager: Send + Sync {
    /// Insert a new device. Fails if the id is taken.
    fn add(&self, device: Device) -> Result<(), StoreError>;

    /// Insert or replace a device.
    fn update(&self, device: Device) -> Result<(), StoreError>;

    /// Remove a device by id, returning it. Fails if the id is unknown.
    fn remove(&self, id: &str) -> Result<Device, StoreError>;

    fn get(&self, id: &str) -> Option<Device>;

    /// All devices, ordered by id.
    fn devices(&self) -> Vec<Device>;

    fn clear(&self) -> Result<(), StoreError>;
}
