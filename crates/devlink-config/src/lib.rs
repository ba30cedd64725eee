//! Configuration for devlink connectors.
//!
//! One TOML file (defaults written on first run), `DEVLINK_` environment
//! overrides, password resolution, and translation to
//! `devlink_core::ClientConfig`. Also owns the tracing setup in [`logging`].

pub mod logging;

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use devlink_core::{
    ClientConfig, Credentials, HubConfig, ReconnectConfig, RetryPolicy, TlsMode,
};

pub use logging::LoggerSettings;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub connector: ConnectorSettings,

    #[serde(default)]
    pub credentials: CredentialSettings,

    #[serde(default)]
    pub logger: LoggerSettings,

    #[serde(default)]
    pub hub: HubSettings,

    #[serde(default)]
    pub http: HttpSettings,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// `ws://`
    #[default]
    Plain,
    /// `wss://`
    Secure,
}

impl Protocol {
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Plain => "ws",
            Self::Secure => "wss",
        }
    }
}

/// Where the platform lives and how patient to be with it. Durations are
/// in seconds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ConnectorSettings {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub path: String,

    pub handshake_timeout: f64,
    pub request_timeout: f64,

    pub reconnect_delay_min: f64,
    pub reconnect_delay_max: f64,
    pub reconnect_delay_factor: f64,

    /// Accept any TLS certificate for hub registration calls.
    pub insecure: bool,

    /// Extra CA certificate (PEM) for hub registration calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            protocol: Protocol::Plain,
            host: "localhost".into(),
            port: 8080,
            path: "/connector".into(),
            handshake_timeout: 10.0,
            request_timeout: 10.0,
            reconnect_delay_min: 1.0,
            reconnect_delay_max: 30.0,
            reconnect_delay_factor: 2.0,
            insecure: false,
            ca_cert: None,
        }
    }
}

impl ConnectorSettings {
    /// `{protocol}://{host}:{port}{path}`
    pub fn url(&self) -> Result<Url, ConfigError> {
        if self.host.trim().is_empty() {
            return Err(invalid("connector.host", "must not be empty"));
        }
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        let raw = format!(
            "{}://{}:{}{}",
            self.protocol.scheme(),
            self.host,
            self.port,
            path
        );
        Url::parse(&raw).map_err(|e| invalid("connector.host", format!("{raw}: {e}")))
    }
}

/// Connector credentials.
#[derive(Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CredentialSettings {
    pub user: String,

    /// Password (plaintext; prefer `password_env`).
    pub password: String,

    /// Environment variable name containing the password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Group id.
    pub gid: String,
}

impl std::fmt::Debug for CredentialSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSettings")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("password_env", &self.password_env)
            .field("gid", &self.gid)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HubSettings {
    /// Platform REST API base URL. Hub registration is off when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub name: String,

    /// Prefix for device ids listed on the hub. Derived from the
    /// credentials when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id_prefix: Option<String>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            api_url: None,
            id: None,
            name: "devlink".into(),
            device_id_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HttpSettings {
    pub retries: u32,
    /// Seconds between attempts.
    pub retry_delay: f64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: 1.0,
        }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "devlink", "devlink").map_or_else(
        || PathBuf::from(".devlink").join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Default directory for rotated log files.
pub fn default_log_dir() -> PathBuf {
    ProjectDirs::from("com", "devlink", "devlink").map_or_else(
        || PathBuf::from("logs"),
        |dirs| dirs.data_local_dir().join("logs"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Defaults, then the TOML file at `path` (if present), then `DEVLINK_*`
/// environment variables (`DEVLINK_CONNECTOR__HOST` → `connector.host`).
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("DEVLINK_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Like [`load_config`], but writes a defaults file first when `path`
/// does not exist yet.
pub fn load_or_init(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "Writing default configuration");
        save_config(&Config::default(), path)?;
    }
    load_config(path)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

fn seconds(field: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| invalid(field, format!("expected a non-negative number of seconds, got {value}")))
}

impl CredentialSettings {
    /// The password from `password_env` if that variable is set, else the
    /// plaintext value.
    pub fn resolve_password(&self) -> SecretString {
        let password = self
            .password_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_else(|| self.password.clone());
        SecretString::from(password)
    }
}

impl Config {
    /// Validate and build the runtime configuration.
    pub fn to_client_config(&self) -> Result<ClientConfig, ConfigError> {
        let c = &self.connector;
        let url = c.url()?;

        if self.credentials.user.trim().is_empty() {
            return Err(invalid("credentials.user", "must not be empty"));
        }
        let credentials = Credentials::with_secret(
            self.credentials.user.clone(),
            self.credentials.resolve_password(),
            self.credentials.gid.clone(),
        );

        let handshake_timeout = seconds("connector.handshake_timeout", c.handshake_timeout)?;
        let request_timeout = seconds("connector.request_timeout", c.request_timeout)?;
        if request_timeout.is_zero() {
            return Err(invalid("connector.request_timeout", "must be greater than zero"));
        }

        let initial_delay = seconds("connector.reconnect_delay_min", c.reconnect_delay_min)?;
        let max_delay = seconds("connector.reconnect_delay_max", c.reconnect_delay_max)?;
        if max_delay < initial_delay {
            return Err(invalid(
                "connector.reconnect_delay_max",
                "must not be smaller than reconnect_delay_min",
            ));
        }
        if !c.reconnect_delay_factor.is_finite() || c.reconnect_delay_factor < 1.0 {
            return Err(invalid(
                "connector.reconnect_delay_factor",
                format!("must be at least 1.0, got {}", c.reconnect_delay_factor),
            ));
        }

        let hub = match &self.hub.api_url {
            Some(raw) => Some(HubConfig {
                api_url: raw
                    .parse()
                    .map_err(|_| invalid("hub.api_url", format!("invalid URL: {raw}")))?,
                id: self.hub.id.clone().filter(|id| !id.trim().is_empty()),
                name: self.hub.name.clone(),
                device_id_prefix: self.hub.device_id_prefix.clone().filter(|p| !p.trim().is_empty()),
            }),
            None => None,
        };

        let tls = if c.insecure {
            TlsMode::DangerAcceptInvalid
        } else if let Some(ref ca_path) = c.ca_cert {
            TlsMode::CustomCa(ca_path.clone())
        } else {
            TlsMode::System
        };

        let mut config = ClientConfig::new(url, credentials);
        config.handshake_timeout = handshake_timeout;
        config.request_timeout = request_timeout;
        config.reconnect = ReconnectConfig {
            initial_delay,
            max_delay,
            factor: c.reconnect_delay_factor,
        };
        config.hub = hub;
        config.http = RetryPolicy {
            retries: self.http.retries,
            retry_delay: seconds("http.retry_delay", self.http.retry_delay)?,
        };
        config.tls = tls;
        Ok(config)
    }
}
