// ── Device domain types ──

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// A locally owned device.
///
/// Fields are private so the hash cannot drift from the data it covers:
/// every mutator recomputes it. The hash covers id, type, name and tags
/// (in sorted tag order), never `attributes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DeviceRecord", into = "DeviceRecord")]
pub struct Device {
    id: String,
    device_type: String,
    name: String,
    tags: IndexMap<String, String>,
    attributes: serde_json::Map<String, serde_json::Value>,
    hash: String,
}

/// Wire and storage shape of a [`Device`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeviceRecord {
    id: String,
    #[serde(rename = "type")]
    device_type: String,
    name: String,
    #[serde(default)]
    tags: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    hash: String,
}

impl From<DeviceRecord> for Device {
    fn from(record: DeviceRecord) -> Self {
        // A stored hash is never trusted.
        let mut device = Self {
            id: record.id,
            device_type: record.device_type,
            name: record.name,
            tags: record.tags,
            attributes: record.attributes,
            hash: String::new(),
        };
        device.rehash();
        device
    }
}

impl From<Device> for DeviceRecord {
    fn from(device: Device) -> Self {
        Self {
            id: device.id,
            device_type: device.device_type,
            name: device.name,
            tags: device.tags,
            attributes: device.attributes,
            hash: device.hash,
        }
    }
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        device_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let mut device = Self {
            id: id.into(),
            device_type: device_type.into(),
            name: name.into(),
            tags: IndexMap::new(),
            attributes: serde_json::Map::new(),
            hash: String::new(),
        };
        device.rehash();
        device
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &IndexMap<String, String> {
        &self.tags
    }

    pub fn tag(&self, tag_id: &str) -> Option<&str> {
        self.tags.get(tag_id).map(String::as_str)
    }

    /// Application-defined extras. Not part of the hash.
    pub fn attributes(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.attributes
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    // ── Mutators ─────────────────────────────────────────────────────

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.rehash();
    }

    pub fn set_type(&mut self, device_type: impl Into<String>) {
        self.device_type = device_type.into();
        self.rehash();
    }

    /// Add a tag. Returns `false` (and changes nothing) if it already exists.
    pub fn add_tag(&mut self, tag_id: impl Into<String>, value: impl Into<String>) -> bool {
        let tag_id = tag_id.into();
        if self.tags.contains_key(&tag_id) {
            return false;
        }
        self.tags.insert(tag_id, value.into());
        self.rehash();
        true
    }

    /// Change an existing tag. Returns `false` if the tag is unknown.
    pub fn change_tag(&mut self, tag_id: &str, value: impl Into<String>) -> bool {
        let Some(slot) = self.tags.get_mut(tag_id) else {
            return false;
        };
        *slot = value.into();
        self.rehash();
        true
    }

    pub fn remove_tag(&mut self, tag_id: &str) -> Option<String> {
        let removed = self.tags.shift_remove(tag_id);
        if removed.is_some() {
            self.rehash();
        }
        removed
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(key.into(), value);
    }

    #[must_use]
    pub fn with_tag(mut self, tag_id: impl Into<String>, value: impl Into<String>) -> Self {
        let tag_id = tag_id.into();
        self.tags.insert(tag_id, value.into());
        self.rehash();
        self
    }

    // ── Derived ──────────────────────────────────────────────────────

    /// Reject devices the platform could not register.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.trim().is_empty() {
            return Err(CoreError::InvalidDevice {
                reason: "device id is empty".into(),
            });
        }
        if self.device_type.trim().is_empty() {
            return Err(CoreError::InvalidDevice {
                reason: format!("device '{}' has no type", self.id),
            });
        }
        Ok(())
    }

    /// Body of a `put_device` request.
    pub fn registration_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "type": self.device_type,
            "name": self.name,
            "tags": self.tags,
            "hash": self.hash,
        })
    }

    fn rehash(&mut self) {
        self.hash = compute_hash(&self.id, &self.device_type, &self.name, &self.tags);
    }
}

/// SHA-256 over the identifying fields, hex encoded.
///
/// Every field is written as its byte length (u64 little-endian)
/// followed by its bytes, so no two distinct devices share an encoding.
/// Tags are sorted by id, so the result is independent of insertion order.
fn compute_hash(id: &str, device_type: &str, name: &str, tags: &IndexMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for field in [id, device_type, name] {
        update_field(&mut hasher, field);
    }
    let mut sorted: Vec<(&String, &String)> = tags.iter().collect();
    sorted.sort_unstable();
    hasher.update(u64::try_from(sorted.len()).unwrap_or(u64::MAX).to_le_bytes());
    for (tag_id, value) in sorted {
        update_field(&mut hasher, tag_id);
        update_field(&mut hasher, value);
    }
    format!("{:x}", hasher.finalize())
}

fn update_field(hasher: &mut Sha256, field: &str) {
    let len = u64::try_from(field.len()).unwrap_or(u64::MAX);
    hasher.update(len.to_le_bytes());
    hasher.update(field.as_bytes());
}

// ── DeviceRef ────────────────────────────────────────────────────────

/// Either a device id or a device instance, for operations that accept both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRef {
    Id(String),
    Instance(Device),
}

impl DeviceRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Instance(device) => device.id(),
        }
    }
}

impl From<&str> for DeviceRef {
    fn from(id: &str) -> Self {
        Self::Id(id.to_owned())
    }
}

impl From<String> for DeviceRef {
    fn from(id: String) -> Self {
        Self::Id(id)
    }
}

impl From<Device> for DeviceRef {
    fn from(device: Device) -> Self {
        Self::Instance(device)
    }
}

impl From<&Device> for DeviceRef {
    fn from(device: &Device) -> Self {
        Self::Instance(device.clone())
    }
}
