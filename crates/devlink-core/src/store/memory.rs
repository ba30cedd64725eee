// ── In-memory device manager ──
//
// DashMap storage with push-based change notification: every mutation
// bumps a version counter and republishes a sorted snapshot.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use super::{DeviceManager, StoreError};
use crate::model::Device;

pub struct MemoryDeviceManager {
    by_id: DashMap<String, Arc<Device>>,

    /// Version counter, bumped on every mutation.
    version: watch::Sender<u64>,

    /// Full snapshot ordered by id, rebuilt on mutation.
    snapshot: watch::Sender<Arc<Vec<Arc<Device>>>>,
}

impl Default for MemoryDeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDeviceManager {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0u64);
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            by_id: DashMap::new(),
            version,
            snapshot,
        }
    }

    /// Seed the manager with `devices`, replacing duplicates.
    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let manager = Self::new();
        for device in devices {
            manager.by_id.insert(device.id().to_owned(), Arc::new(device));
        }
        manager.changed();
        manager
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<Device>>>> {
        self.snapshot.subscribe()
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn changed(&self) {
        // Collect inside `send_modify` so concurrent rebuilds publish in order.
        self.snapshot.send_modify(|snap| {
            let mut values: Vec<Arc<Device>> =
                self.by_id.iter().map(|r| Arc::clone(r.value())).collect();
            values.sort_by(|a, b| a.id().cmp(b.id()));
            *snap = Arc::new(values);
        });
        self.version.send_modify(|v| *v += 1);
    }
}

impl DeviceManager for MemoryDeviceManager {
    fn add(&self, device: Device) -> Result<(), StoreError> {
        match self.by_id.entry(device.id().to_owned()) {
            Entry::Occupied(slot) => {
                return Err(StoreError::AlreadyExists {
                    id: slot.key().clone(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(device));
            }
        }
        self.changed();
        Ok(())
    }

    fn update(&self, device: Device) -> Result<(), StoreError> {
        self.by_id.insert(device.id().to_owned(), Arc::new(device));
        self.changed();
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<Device, StoreError> {
        let (_, removed) = self
            .by_id
            .remove(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_owned() })?;
        self.changed();
        Ok(Arc::unwrap_or_clone(removed))
    }

    fn get(&self, id: &str) -> Option<Device> {
        self.by_id.get(id).map(|r| Device::clone(r.value()))
    }

    fn devices(&self) -> Vec<Device> {
        self.snapshot
            .borrow()
            .iter()
            .map(|d| Device::clone(d))
            .collect()
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.by_id.clear();
        self.changed();
        Ok(())
    }
}
