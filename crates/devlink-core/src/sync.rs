// ── Device synchronization ──
//
// Runs once per transition into Connected. Pending removals go first,
// then every local device is compared with its last known registration:
// never registered → register, same hash → skip, different hash →
// re-register. Devices the platform knows but the manager does not are
// left alone. Failures stay recorded and are retried at the next run.
// With a hub configured, the hub's device list is then aligned with the
// local device set, keyed by an aggregate hash.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use devlink_api::Method;

use crate::call::PendingCall;
use crate::client::{Admission, ClientInner};
use crate::error::CoreError;
use crate::model::Device;

/// Last known platform-side state of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRecord {
    /// Registered with the device as it hashed at the time.
    Registered { hash: String },
    NotRegistered,
    /// A `disconnect_device` has not been confirmed yet.
    DisconnectPending,
    /// A `delete_device` has not been confirmed yet.
    DeletePending,
}

impl SyncRecord {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::DisconnectPending | Self::DeletePending)
    }
}

/// What one synchronization run did, by device id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub registered: Vec<String>,
    pub skipped: Vec<String>,
    /// Pending disconnects and deletes that were confirmed.
    pub removed: Vec<String>,
    pub failed: Vec<String>,
    pub hub: HubSyncStatus,
}

/// Outcome of the hub device-list step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HubSyncStatus {
    /// No hub configured, or no hub id known yet.
    #[default]
    NotConfigured,
    Unchanged,
    Updated,
    Failed(String),
}

/// What to do with a local device given its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Register,
    Skip,
}

fn plan(device: &Device, record: Option<&SyncRecord>) -> Plan {
    match record {
        Some(SyncRecord::Registered { hash }) if hash == device.hash() => Plan::Skip,
        _ => Plan::Register,
    }
}

pub(crate) async fn synchronize(inner: &Arc<ClientInner>) -> SyncReport {
    let mut report = SyncReport::default();
    let timeout = inner.config.request_timeout;

    // ── Pending removals ──
    let pending: Vec<(String, Method)> = inner
        .sync_records
        .iter()
        .filter_map(|r| match r.value() {
            SyncRecord::DisconnectPending => Some((r.key().clone(), Method::DisconnectDevice)),
            SyncRecord::DeletePending => Some((r.key().clone(), Method::DeleteDevice)),
            _ => None,
        })
        .collect();

    let removals = pending.into_iter().map(|(id, method)| {
        let call = inner.remove_remote(&id, method, timeout, Admission::Internal);
        settle(id, call)
    });
    for (id, ok) in join_all(removals).await {
        if ok {
            report.removed.push(id);
        } else {
            report.failed.push(id);
        }
    }

    // ── Registrations ──
    let devices = inner.devices.devices();
    let mut registrations = Vec::new();
    for device in &devices {
        let record = inner.sync_records.get(device.id()).map(|r| r.value().clone());
        if record.as_ref().is_some_and(SyncRecord::is_pending) {
            // Removal still unconfirmed; registering now would undo it.
            continue;
        }
        match plan(device, record.as_ref()) {
            Plan::Skip => report.skipped.push(device.id().to_owned()),
            Plan::Register => {
                let call = inner.put_device(device, timeout, Admission::Internal);
                registrations.push(settle(device.id().to_owned(), call));
            }
        }
    }
    for (id, ok) in join_all(registrations).await {
        if ok {
            report.registered.push(id);
        } else {
            report.failed.push(id);
        }
    }

    // ── Prune records of devices gone from the manager ──
    let local: HashSet<&str> = devices.iter().map(Device::id).collect();
    inner
        .sync_records
        .retain(|id, record| record.is_pending() || local.contains(id.as_str()));

    report.hub = sync_hub(inner, &devices).await;

    debug!(?report, "Synchronization report");
    report
}

// ── Hub device list ──

async fn sync_hub(inner: &ClientInner, devices: &[Device]) -> HubSyncStatus {
    let Some(api) = &inner.hub_api else {
        return HubSyncStatus::NotConfigured;
    };
    let Some(hub_id) = inner.hub_id.load_full() else {
        return HubSyncStatus::NotConfigured;
    };
    let name = inner
        .hub_name
        .load_full()
        .map(|n| n.as_ref().clone())
        .unwrap_or_default();

    let listed: Vec<(String, &str)> = devices
        .iter()
        .map(|d| (inner.hub_device_id(d.id()), d.name()))
        .collect();
    let ids: Vec<String> = listed.iter().map(|(id, _)| id.clone()).collect();
    let hash = hash_device_list(&listed);

    match api.sync_devices(&hub_id, &name, &ids, &hash).await {
        Ok(sync) => {
            if sync.name != name {
                info!(hub_id = %hub_id, name = %sync.name, "Adopted hub name from platform");
                inner.hub_name.store(Some(Arc::new(sync.name)));
            }
            if sync.updated {
                HubSyncStatus::Updated
            } else {
                HubSyncStatus::Unchanged
            }
        }
        Err(devlink_api::Error::HubNotFound { id }) => {
            warn!(hub_id = %id, "Hub vanished, a new one is created on reconnect");
            inner.hub_id.store(None);
            HubSyncStatus::Failed(format!("hub '{id}' not found"))
        }
        Err(e) => {
            warn!(hub_id = %hub_id, error = %e, "Hub device list update failed");
            HubSyncStatus::Failed(e.to_string())
        }
    }
}

/// Order-independent hash of `(hub device id, name)` pairs, hex encoded.
fn hash_device_list(devices: &[(String, &str)]) -> String {
    let mut entries: Vec<String> = devices
        .iter()
        .map(|(id, name)| {
            let mut hasher = Sha256::new();
            for field in [id.as_str(), name] {
                hasher.update(u64::try_from(field.len()).unwrap_or(u64::MAX).to_le_bytes());
                hasher.update(field.as_bytes());
            }
            format!("{:x}", hasher.finalize())
        })
        .collect();
    entries.sort_unstable();
    let mut hasher = Sha256::new();
    for entry in &entries {
        hasher.update(entry.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

async fn settle(id: String, call: Result<PendingCall, CoreError>) -> (String, bool) {
    match call {
        Ok(call) => {
            let outcome = call.wait().await;
            if !outcome.is_success() {
                debug!(device_id = %id, ?outcome, "Synchronization call failed");
            }
            (id, outcome.is_success())
        }
        Err(e) => {
            warn!(device_id = %id, error = %e, "Synchronization call rejected");
            (id, false)
        }
    }
}
