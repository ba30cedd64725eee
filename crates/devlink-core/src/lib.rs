// devlink-core: connector runtime
//
// Sits between the transport layer (devlink-api) and the application.
// Owns the connection lifecycle, correlates requests with responses,
// exposes awaitable and callback-driven calls, and keeps the local
// device set registered with the platform across reconnects.

pub mod call;
pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod instance;
pub mod model;
pub mod store;
pub mod supervisor;
pub mod sync;

// ── Primary re-exports ──────────────────────────────────────────────
pub use call::{CallState, DeviceCall, DeviceOutcome, Outcome, PendingCall};
pub use client::{Client, Notification};
pub use config::{ClientConfig, HubConfig, ReconnectConfig};
pub use correlation::{CorrelationTable, Resolution};
pub use error::CoreError;
pub use instance::InstanceGuard;
pub use store::{DeviceManager, FileDeviceManager, MemoryDeviceManager, StoreError};
pub use supervisor::ConnectionState;
pub use sync::{HubSyncStatus, SyncRecord, SyncReport};

// ── Model re-exports ────────────────────────────────────────────────
pub use model::{Device, DeviceRef};

// ── Transport re-exports ────────────────────────────────────────────
pub use devlink_api::{ContentType, Credentials, Message, MessageKind, Method, RetryPolicy, TlsMode};
