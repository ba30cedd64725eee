use thiserror::Error;

/// Top-level error type for the `devlink-api` crate.
///
/// Covers every failure mode of the transport layer: authentication
/// handshake, WebSocket session, HTTP helper, and envelope decoding.
/// `devlink-core` maps these into domain-level errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The platform rejected the handshake credentials.
    #[error("Authentication failed (status {status}): {message}")]
    Authentication { status: u16, message: String },

    /// No handshake answer arrived within the configured window.
    #[error("Handshake timed out after {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS setup or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP request kept failing after all retry attempts.
    #[error("HTTP request to {url} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        reason: String,
    },

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed before the operation could complete.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// The session is gone; nothing can be sent on it.
    #[error("Session is not connected")]
    NotConnected,

    // ── Hub ─────────────────────────────────────────────────────────
    /// The stored hub id is unknown to the platform.
    #[error("Hub '{id}' not found on platform")]
    HubNotFound { id: String },

    /// The platform refused the hub's device list (HTTP 400).
    #[error("Hub '{id}' rejected device list: {body}")]
    HubDevicesRejected { id: String, body: String },

    /// Hub API answered with an unexpected status.
    #[error("Hub API error (HTTP {status}): {body}")]
    Hub { status: u16, body: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON decoding failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// JSON encoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` if this error indicates the credentials were refused.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::HandshakeTimeout { .. }
            | Self::WebSocketConnect(_)
            | Self::WebSocketClosed { .. }
            | Self::NotConnected
            | Self::RetriesExhausted { .. } => true,
            Self::Hub { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_is_not_transient() {
        let err = Error::Authentication {
            status: 401,
            message: "bad password".into(),
        };
        assert!(err.is_auth_failure());
        assert!(!err.is_transient());
    }

    #[test]
    fn hub_server_errors_are_transient() {
        assert!(
            Error::Hub {
                status: 503,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !Error::Hub {
                status: 400,
                body: String::new()
            }
            .is_transient()
        );
    }
}
