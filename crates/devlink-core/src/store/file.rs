// ── File-backed device manager ──
//
// Keeps the device set in memory and rewrites a JSON file after every
// mutation (temp file + rename). A mutation that cannot be persisted
// is rolled back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{DeviceManager, StoreError};
use crate::model::Device;

pub struct FileDeviceManager {
    path: PathBuf,
    devices: Mutex<BTreeMap<String, Device>>,
}

impl FileDeviceManager {
    /// Open (or create on first write) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let devices = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => {
                let list: Vec<Device> = serde_json::from_str(&text)?;
                list.into_iter()
                    .map(|d| (d.id().to_owned(), d))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), count = devices.len(), "Device store opened");
        Ok(Self {
            path,
            devices: Mutex::new(devices),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Device>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to a copy of the map, persist it, then commit.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, Device>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        *guard = next;
        Ok(out)
    }

    fn persist(&self, devices: &BTreeMap<String, Device>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let list: Vec<&Device> = devices.values().collect();
        let json = serde_json::to_string_pretty(&list)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl DeviceManager for FileDeviceManager {
    fn add(&self, device: Device) -> Result<(), StoreError> {
        self.mutate(|map| {
            if map.contains_key(device.id()) {
                return Err(StoreError::AlreadyExists {
                    id: device.id().to_owned(),
                });
            }
            map.insert(device.id().to_owned(), device);
            Ok(())
        })
    }

    fn update(&self, device: Device) -> Result<(), StoreError> {
        self.mutate(|map| {
            map.insert(device.id().to_owned(), device);
            Ok(())
        })
    }

    fn remove(&self, id: &str) -> Result<Device, StoreError> {
        self.mutate(|map| {
            map.remove(id)
                .ok_or_else(|| StoreError::NotFound { id: id.to_owned() })
        })
    }

    fn get(&self, id: &str) -> Option<Device> {
        self.lock().get(id).cloned()
    }

    fn devices(&self) -> Vec<Device> {
        self.lock().values().cloned().collect()
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.mutate(|map| {
            map.clear();
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn devices_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");

        let store = FileDeviceManager::open(&path).unwrap();
        store
            .add(Device::new("d1", "sensor", "kitchen").with_tag("floor", "1"))
            .unwrap();
        store.add(Device::new("d2", "switch", "hall")).unwrap();
        store.remove("d2").unwrap();
        drop(store);

        let reopened = FileDeviceManager::open(&path).unwrap();
        let devices = reopened.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id(), "d1");
        assert_eq!(devices[0].tag("floor"), Some("1"));
        assert_eq!(
            devices[0].hash(),
            Device::new("d1", "sensor", "kitchen")
                .with_tag("floor", "1")
                .hash()
        );
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDeviceManager::open(dir.path().join("nested/devices.json")).unwrap();
        assert!(store.devices().is_empty());
        store.update(Device::new("d1", "sensor", "x")).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn duplicate_add_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let store = FileDeviceManager::open(&path).unwrap();
        store.add(Device::new("d1", "sensor", "a")).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        assert!(matches!(
            store.add(Device::new("d1", "sensor", "b")),
            Err(StoreError::AlreadyExists { .. })
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
        assert_eq!(store.get("d1").unwrap().name(), "a");
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            FileDeviceManager::open(&path),
            Err(StoreError::Serialization(_))
        ));
    }
}
