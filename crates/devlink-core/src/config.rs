// ── Runtime client configuration ──
//
// These types describe how to reach the platform and how hard to try.
// They carry credential data and tuning, but never touch disk.
// devlink-config builds a `ClientConfig` from the TOML file and hands it in.

use std::time::Duration;

use devlink_api::{Credentials, RetryPolicy, TlsMode};
use sha2::{Digest, Sha256};
use url::Url;

/// Exponential backoff between connection attempts. Retries never stop;
/// only `Client::shutdown` ends the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Growth per attempt. Default: 2.0.
    pub factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

/// Hub registration settings. Absent means no hub is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Base URL of the platform REST API (e.g. `https://platform/api`).
    pub api_url: Url,
    /// Previously assigned hub id, if any.
    pub id: Option<String>,
    /// Name used when a new hub has to be created.
    pub name: String,
    /// Prefix of the device ids listed on the hub (`{prefix}-{id}`).
    /// Derived from the credentials when absent.
    pub device_id_prefix: Option<String>,
}

impl HubConfig {
    pub fn new(api_url: Url, name: impl Into<String>) -> Self {
        Self {
            api_url,
            id: None,
            name: name.into(),
            device_id_prefix: None,
        }
    }
}

/// Stable per-connector device id prefix: the first 16 hex digits of
/// SHA-256 over the length-prefixed user and group id.
pub(crate) fn derive_device_id_prefix(credentials: &Credentials) -> String {
    let mut hasher = Sha256::new();
    for field in [credentials.user.as_str(), credentials.gid.as_str()] {
        hasher.update(u64::try_from(field.len()).unwrap_or(u64::MAX).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(16);
    hex
}

/// Configuration for one client.
///
/// Built by devlink-config (or by hand), passed to [`Client::new`](crate::Client::new).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint (e.g. `wss://platform:443/connector`).
    pub url: Url,
    pub credentials: Credentials,
    /// Bound on connect + auth handshake.
    pub handshake_timeout: Duration,
    /// Default timeout for calls issued internally (device sync).
    pub request_timeout: Duration,
    pub reconnect: ReconnectConfig,
    pub hub: Option<HubConfig>,
    /// Retry policy for hub registration HTTP calls.
    pub http: RetryPolicy,
    /// TLS mode for hub registration HTTP calls.
    pub tls: TlsMode,
    /// How often the correlation table is swept for expired entries.
    pub sweep_interval: Duration,
}

impl ClientConfig {
    pub fn new(url: Url, credentials: Credentials) -> Self {
        Self {
            url,
            credentials,
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            hub: None,
            http: RetryPolicy::default(),
            tls: TlsMode::default(),
            sweep_interval: Duration::from_millis(250),
        }
    }
}
