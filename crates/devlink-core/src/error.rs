// ── Core error types ──
//
// Errors returned by the devlink-core public API. Transport failures
// during normal operation never surface here: the supervisor recovers
// from them and reports through connection state. What remains are
// programmer errors, storage failures, and the `From<devlink_api::Error>`
// translation used at the edges.

use thiserror::Error;

use crate::store::StoreError;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Client is not connected")]
    NotConnected,

    #[error("Another devlink client is already running in this process")]
    AlreadyRunning,

    #[error("No Tokio runtime available; construct the client inside a runtime")]
    NoRuntime,

    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to platform at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    // ── Call errors ──────────────────────────────────────────────────
    #[error("Correlation id already in flight: {id}")]
    DuplicateCorrelation { id: String },

    #[error("Invalid device: {reason}")]
    InvalidDevice { reason: String },

    #[error("Device not found: {id}")]
    DeviceNotFound { id: String },

    // ── Storage errors ───────────────────────────────────────────────
    #[error(transparent)]
    Store(#[from] StoreError),

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<devlink_api::Error> for CoreError {
    fn from(err: devlink_api::Error) -> Self {
        match err {
            devlink_api::Error::Authentication { status, message } => {
                CoreError::AuthenticationFailed {
                    message: format!("{message} (status {status})"),
                }
            }
            devlink_api::Error::NotConnected | devlink_api::Error::WebSocketClosed { .. } => {
                CoreError::NotConnected
            }
            devlink_api::Error::HandshakeTimeout { timeout_ms } => CoreError::ConnectionFailed {
                url: "<platform>".into(),
                reason: format!("handshake timed out after {timeout_ms}ms"),
            },
            devlink_api::Error::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                url: "<platform>".into(),
                reason,
            },
            devlink_api::Error::Transport(ref e) => CoreError::ConnectionFailed {
                url: e
                    .url()
                    .map_or_else(|| "<unknown>".into(), ToString::to_string),
                reason: e.to_string(),
            },
            devlink_api::Error::RetriesExhausted {
                url,
                attempts,
                reason,
            } => CoreError::ConnectionFailed {
                url,
                reason: format!("{reason} (after {attempts} attempts)"),
            },
            devlink_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("invalid URL: {e}"),
            },
            devlink_api::Error::Tls(message) => CoreError::Config {
                message: format!("TLS: {message}"),
            },
            other => CoreError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_rejection_maps_to_authentication_failed() {
        let err: CoreError = devlink_api::Error::Authentication {
            status: 401,
            message: "bad credentials".into(),
        }
        .into();
        assert!(matches!(err, CoreError::AuthenticationFailed { .. }));
        assert!(err.to_string().contains("401"));
    }

    #[test]
    fn closed_session_maps_to_not_connected() {
        let err: CoreError = devlink_api::Error::NotConnected.into();
        assert!(matches!(err, CoreError::NotConnected));
    }

    #[test]
    fn exhausted_retries_keep_url() {
        let err: CoreError = devlink_api::Error::RetriesExhausted {
            url: "http://hub/api".into(),
            attempts: 3,
            reason: "refused".into(),
        }
        .into();
        match err {
            CoreError::ConnectionFailed { url, reason } => {
                assert_eq!(url, "http://hub/api");
                assert!(reason.contains("3 attempts"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
