//! Platform message envelope.
//!
//! Every frame on the wire is one JSON-encoded [`Message`]. Only the
//! fields needed for correlation are mandatory (`id`, `kind`); the rest
//! are omitted when absent so the platform can evolve its envelope
//! without breaking older connectors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ── Discriminators ───────────────────────────────────────────────────

/// What a message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Connector-initiated call that expects a correlated response.
    Request,
    /// Answer to a request, or the connector's reply to a task.
    Response,
    /// Device event pushed to the platform; acknowledged with a response.
    Event,
    /// Platform-initiated command for a device.
    Task,
}

/// Operation carried by a [`MessageKind::Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Auth,
    PutDevice,
    DisconnectDevice,
    DeleteDevice,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::PutDevice => "put_device",
            Self::DisconnectDevice => "disconnect_device",
            Self::DeleteDevice => "delete_device",
        }
    }
}

/// Payload encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContentType {
    #[default]
    #[serde(rename = "application/json")]
    Json,
    #[serde(rename = "text/plain")]
    Text,
}

// ── Message ──────────────────────────────────────────────────────────

/// A unit of platform communication.
///
/// `id` is the correlation key: a response carries the id of the request
/// (or task) it answers. Ids are never reused across calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,

    pub kind: MessageKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Present on responses; 2xx is success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(default)]
    pub content_type: ContentType,

    #[serde(default)]
    pub payload: String,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(kind: MessageKind, id: String) -> Self {
        Self {
            id,
            kind,
            method: None,
            device_id: None,
            service: None,
            status: None,
            content_type: ContentType::default(),
            payload: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Fresh correlation id (UUID v4).
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// A request for `method` with a fresh correlation id.
    pub fn request(method: Method, payload: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageKind::Request, Self::new_id());
        msg.method = Some(method);
        msg.payload = payload.into();
        msg
    }

    /// A device event for `service` with a fresh correlation id.
    pub fn event(
        device_id: impl Into<String>,
        service: impl Into<String>,
        payload: impl Into<String>,
        content_type: ContentType,
    ) -> Self {
        let mut msg = Self::new(MessageKind::Event, Self::new_id());
        msg.device_id = Some(device_id.into());
        msg.service = Some(service.into());
        msg.content_type = content_type;
        msg.payload = payload.into();
        msg
    }

    /// A platform task addressed to a device service.
    pub fn task(
        device_id: impl Into<String>,
        service: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(MessageKind::Task, Self::new_id());
        msg.device_id = Some(device_id.into());
        msg.service = Some(service.into());
        msg.payload = payload.into();
        msg
    }

    /// A response correlated with `to`: same id, device and service.
    pub fn response(to: &Message, status: u16, payload: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageKind::Response, to.id.clone());
        msg.device_id.clone_from(&to.device_id);
        msg.service.clone_from(&to.service);
        msg.status = Some(status);
        msg.payload = payload.into();
        msg
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    /// `true` for a response whose status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        matches!(self.status, Some(200..=299))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: text.to_owned(),
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────
