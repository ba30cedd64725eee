//! Authenticated WebSocket session with the platform.
//!
//! A [`Session`] is one physical connection: WebSocket connect, the `auth`
//! handshake, then two background tasks. The writer drains an outbound
//! queue into the socket; the reader parses inbound frames and forwards
//! them as [`SessionEvent`]s. The reader emits exactly one
//! [`SessionEvent::Closed`] when the connection ends for any reason and
//! nothing after it.
//!
//! Sessions never reconnect on their own. Reconnection belongs to the
//! supervisor in `devlink-core`.
//!
//! ```rust,ignore
//! let (session, mut events) = Session::open(config).await?;
//! session.send(&Message::request(Method::PutDevice, payload))?;
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::Message(msg) => handle(msg),
//!         SessionEvent::Closed(reason) => break,
//!     }
//! }
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::message::{Message, MessageKind, Method};
use crate::transport::TlsMode;

type WsFrame = tungstenite::Message;
type WsResult = Result<WsFrame, tungstenite::Error>;

/// Close code reported when the stream ends without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

// ── Configuration ────────────────────────────────────────────────────

/// Credentials presented in the `auth` handshake.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: SecretString,
    /// Group id the connector belongs to.
    pub gid: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>, gid: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: SecretString::from(password.into()),
            gid: gid.into(),
        }
    }

    /// Like [`new`](Self::new), for a password that is already wrapped.
    pub fn with_secret(user: impl Into<String>, password: SecretString, gid: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password,
            gid: gid.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"[redacted]")
            .field("gid", &self.gid)
            .finish()
    }
}

/// Everything needed to open one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: Url,
    pub credentials: Credentials,
    /// Hub id obtained from hub registration, sent along with the credentials.
    pub hub_id: Option<String>,
    /// Upper bound on connect + handshake.
    pub handshake_timeout: Duration,
    /// Certificate verification for `wss://` URLs.
    pub tls: TlsMode,
}

// ── Events ───────────────────────────────────────────────────────────

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called (or the session was dropped).
    Local,
    /// The platform sent a close frame.
    Remote { code: u16, reason: String },
    /// The stream ended without a close frame.
    Ended,
    /// Read or write failed.
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("closed locally"),
            Self::Remote { code, reason } => write!(f, "closed by platform ({code}): {reason}"),
            Self::Ended => f.write_str("stream ended"),
            Self::Error(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// Output of the session's receive loop.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Message(Message),
    Closed(CloseReason),
}

// ── Session ──────────────────────────────────────────────────────────

/// Handle to an open, authenticated session.
///
/// Dropping the handle closes the connection.
#[derive(Debug)]
pub struct Session {
    url: Url,
    outbound: mpsc::UnboundedSender<WsFrame>,
    cancel: CancellationToken,
}

impl Session {
    /// Connect, authenticate and start the background reader and writer.
    ///
    /// The whole sequence is bounded by `config.handshake_timeout`. No
    /// retry happens here: a refused connection or rejected credentials
    /// come straight back as an error.
    pub async fn open(
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), Error> {
        let timeout_ms = u64::try_from(config.handshake_timeout.as_millis()).unwrap_or(u64::MAX);

        tracing::info!(url = %config.url, user = %config.credentials.user, "Opening session");

        let connector = config.tls.websocket_connector()?;
        let (ws_stream, early) = tokio::time::timeout(config.handshake_timeout, async {
            let (mut ws_stream, _response) = tokio_tungstenite::connect_async_tls_with_config(
                config.url.as_str(),
                None,
                false,
                connector,
            )
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

            let auth = auth_request(&config)?;
            ws_stream
                .send(WsFrame::Text(auth.to_json()?.into()))
                .await
                .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

            let mut early = Vec::new();
            let reply = await_reply(&mut ws_stream, &auth.id, &mut early).await?;
            if !reply.is_success() {
                return Err(Error::Authentication {
                    status: reply.status.unwrap_or_default(),
                    message: reply.payload,
                });
            }
            Ok::<_, Error>((ws_stream, early))
        })
        .await
        .map_err(|_| Error::HandshakeTimeout { timeout_ms })??;

        tracing::info!(url = %config.url, "Session authenticated");

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsFrame>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        // Anything the platform pushed before acknowledging auth.
        for msg in early {
            let _ = event_tx.send(SessionEvent::Message(msg));
        }

        // Set by the writer before it cancels, so the reader can report
        // the write error instead of a local close.
        let write_failure = Arc::new(OnceLock::new());

        let writer_cancel = cancel.clone();
        let writer_failure = Arc::clone(&write_failure);
        tokio::spawn(async move {
            write_loop(&mut write, &mut out_rx, &writer_cancel, &writer_failure).await;
        });

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let reason = read_loop(&mut read, &event_tx, &reader_cancel).await;
            let reason = attribute_close(reason, &write_failure);
            tracing::info!(%reason, "Session closed");
            reader_cancel.cancel();
            let _ = event_tx.send(SessionEvent::Closed(reason));
        });

        Ok((
            Self {
                url: config.url,
                outbound: out_tx,
                cancel,
            },
            event_rx,
        ))
    }

    /// Queue a message for sending.
    ///
    /// Fails with [`Error::NotConnected`] once the session has closed.
    pub fn send(&self, msg: &Message) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::NotConnected);
        }
        let text = msg.to_json()?;
        tracing::trace!(correlation_id = %msg.id, kind = ?msg.kind, "Sending frame");
        self.outbound
            .send(WsFrame::Text(text.into()))
            .map_err(|_| Error::NotConnected)
    }

    /// Tear the connection down. Safe to call more than once.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Handshake ────────────────────────────────────────────────────────

fn auth_request(config: &SessionConfig) -> Result<Message, Error> {
    let mut payload = serde_json::json!({
        "user": config.credentials.user,
        "password": config.credentials.password.expose_secret(),
        "gid": config.credentials.gid,
    });
    if let Some(ref hub_id) = config.hub_id {
        payload["hub_id"] = serde_json::Value::String(hub_id.clone());
    }
    Ok(Message::request(Method::Auth, serde_json::to_string(&payload)?))
}

/// Read until the response carrying `id` arrives. Other parseable
/// messages are collected into `early` so they are not lost.
async fn await_reply<S>(stream: &mut S, id: &str, early: &mut Vec<Message>) -> Result<Message, Error>
where
    S: Stream<Item = WsResult> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsFrame::Text(text)) => match Message::from_json(text.as_str()) {
                Ok(msg) if msg.kind == MessageKind::Response && msg.id == id => return Ok(msg),
                Ok(msg) => early.push(msg),
                Err(e) => tracing::debug!(error = %e, "Dropping unparseable frame during handshake"),
            },
            Ok(WsFrame::Close(frame)) => {
                let (code, reason) = frame
                    .map(|cf| (u16::from(cf.code), cf.reason.to_string()))
                    .unwrap_or((ABNORMAL_CLOSURE, String::new()));
                return Err(Error::WebSocketClosed { code, reason });
            }
            Ok(_) => {}
            Err(e) => return Err(Error::WebSocketConnect(e.to_string())),
        }
    }
    Err(Error::WebSocketClosed {
        code: ABNORMAL_CLOSURE,
        reason: "stream ended during handshake".into(),
    })
}

// ── Send loop ────────────────────────────────────────────────────────

/// Drain `outbound` into the socket until cancelled or the queue closes.
/// A failed write records the error in `failure` and cancels the session.
async fn write_loop<S>(
    write: &mut S,
    outbound: &mut mpsc::UnboundedReceiver<WsFrame>,
    cancel: &CancellationToken,
    failure: &OnceLock<String>,
) where
    S: Sink<WsFrame, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write.send(frame).await {
                    tracing::warn!(error = %e, "Session write failed");
                    let _ = failure.set(e.to_string());
                    cancel.cancel();
                    return;
                }
            }
        }
    }
    let _ = write.send(WsFrame::Close(None)).await;
    let _ = write.close().await;
}

/// A cancel caused by a failed write is a transport error, not a local close.
fn attribute_close(reason: CloseReason, write_failure: &OnceLock<String>) -> CloseReason {
    match (reason, write_failure.get()) {
        (CloseReason::Local, Some(e)) => CloseReason::Error(e.clone()),
        (reason, _) => reason,
    }
}

// ── Receive loop ─────────────────────────────────────────────────────

async fn read_loop<S>(
    read: &mut S,
    event_tx: &mpsc::UnboundedSender<SessionEvent>,
    cancel: &CancellationToken,
) -> CloseReason
where
    S: Stream<Item = WsResult> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return CloseReason::Local,
            frame = read.next() => {
                match frame {
                    Some(Ok(WsFrame::Text(text))) => {
                        if let Some(msg) = parse_frame(text.as_str()) {
                            // Receiver gone means nobody cares any more.
                            if event_tx.send(SessionEvent::Message(msg)).is_err() {
                                return CloseReason::Local;
                            }
                        }
                    }
                    Some(Ok(WsFrame::Ping(_))) => {
                        // tungstenite answers pings itself
                        tracing::trace!("Session ping");
                    }
                    Some(Ok(WsFrame::Close(frame))) => {
                        return match frame {
                            Some(cf) => CloseReason::Remote {
                                code: u16::from(cf.code),
                                reason: cf.reason.to_string(),
                            },
                            None => CloseReason::Remote {
                                code: ABNORMAL_CLOSURE,
                                reason: String::new(),
                            },
                        };
                    }
                    Some(Err(e)) => return CloseReason::Error(e.to_string()),
                    None => return CloseReason::Ended,
                    // Binary, Pong, raw frames
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Decode one text frame. Malformed frames are logged and dropped.
fn parse_frame(text: &str) -> Option<Message> {
    match Message::from_json(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::debug!(error = %e, "Dropping unparseable frame");
            None
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials::new("alice", "hunter2", "g1");
        let printed = format!("{creds:?}");
        assert!(printed.contains("alice"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn auth_payload_carries_hub_id() {
        let config = SessionConfig {
            url: Url::parse("ws://127.0.0.1:1/connector").unwrap(),
            credentials: Credentials::new("u", "p", "g"),
            hub_id: Some("hub-7".into()),
            handshake_timeout: Duration::from_secs(1),
            tls: TlsMode::default(),
        };
        let msg = auth_request(&config).unwrap();
        assert_eq!(msg.method, Some(Method::Auth));
        let payload: serde_json::Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(payload["user"], "u");
        assert_eq!(payload["password"], "p");
        assert_eq!(payload["gid"], "g");
        assert_eq!(payload["hub_id"], "hub-7");
    }

    #[test]
    fn parse_frame_drops_garbage() {
        assert!(parse_frame("{\"nope\":1}").is_none());
        assert!(parse_frame(r#"{"id":"x","kind":"task","payload":"p"}"#).is_some());
    }

    #[tokio::test]
    async fn read_loop_reports_remote_close() {
        let frames: Vec<WsResult> = vec![
            Ok(WsFrame::Text(r#"{"id":"t1","kind":"task"}"#.into())),
            Ok(WsFrame::Text("garbage".into())),
            Ok(WsFrame::Close(None)),
        ];
        let mut stream = futures_util::stream::iter(frames);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let reason = read_loop(&mut stream, &tx, &cancel).await;
        assert!(matches!(reason, CloseReason::Remote { code: ABNORMAL_CLOSURE, .. }));

        match rx.try_recv().unwrap() {
            SessionEvent::Message(msg) => assert_eq!(msg.id, "t1"),
            SessionEvent::Closed(_) => panic!("read_loop must not emit Closed itself"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_loop_stops_on_cancel() {
        let mut stream = futures_util::stream::pending::<WsResult>();
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(read_loop(&mut stream, &tx, &cancel).await, CloseReason::Local);
    }

    #[tokio::test]
    async fn failed_write_is_reported_as_transport_error() {
        let broken = futures_util::sink::unfold((), |(), _frame: WsFrame| async {
            Err::<(), _>(tungstenite::Error::ConnectionClosed)
        });
        let mut broken = std::pin::pin!(broken);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let failure = OnceLock::new();

        out_tx.send(WsFrame::Text("hello".into())).unwrap();
        write_loop(&mut broken, &mut out_rx, &cancel, &failure).await;
        assert!(cancel.is_cancelled());

        // The reader sees only the cancel.
        let mut stream = futures_util::stream::pending::<WsResult>();
        let (tx, _rx) = mpsc::unbounded_channel();
        let reason = attribute_close(read_loop(&mut stream, &tx, &cancel).await, &failure);
        assert!(
            matches!(reason, CloseReason::Error(ref e) if !e.is_empty()),
            "expected transport error, got {reason:?}"
        );
    }

    #[test]
    fn local_close_without_write_failure_stays_local() {
        let failure = OnceLock::new();
        assert_eq!(attribute_close(CloseReason::Local, &failure), CloseReason::Local);
        let _ = failure.set("broken pipe".to_owned());
        assert_eq!(attribute_close(CloseReason::Ended, &failure), CloseReason::Ended);
    }

    #[tokio::test]
    async fn await_reply_keeps_early_messages() {
        let frames: Vec<WsResult> = vec![
            Ok(WsFrame::Text(r#"{"id":"t1","kind":"task"}"#.into())),
            Ok(WsFrame::Text(r#"{"id":"auth-1","kind":"response","status":200}"#.into())),
        ];
        let mut stream = futures_util::stream::iter(frames);
        let mut early = Vec::new();
        let reply = await_reply(&mut stream, "auth-1", &mut early).await.unwrap();
        assert!(reply.is_success());
        assert_eq!(early.len(), 1);
        assert_eq!(early[0].id, "t1");
    }
}
