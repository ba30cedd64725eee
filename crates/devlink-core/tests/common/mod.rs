// Shared helpers for devlink-core integration tests: an in-process
// WebSocket platform and a client factory.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use url::Url;

use devlink_core::{ClientConfig, Credentials, Message, MessageKind, Method, ReconnectConfig};

// ── Test serialization ──────────────────────────────────────────────

static SERIAL: Mutex<()> = Mutex::new(());

/// Only one client may exist per process, so client tests run one at a time.
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Mock platform ───────────────────────────────────────────────────

enum Control {
    Send(Message),
    Kick,
}

#[derive(Default)]
struct Behavior {
    silent_methods: HashSet<Method>,
    failing_methods: HashSet<Method>,
    silent_services: HashSet<String>,
    delayed_services: HashMap<String, Duration>,
    silent_responses: bool,
}

struct PlatformState {
    accept_auth: AtomicBool,
    handshakes: AtomicUsize,
    received: Mutex<Vec<Message>>,
    behavior: Mutex<Behavior>,
    control: Mutex<Option<mpsc::UnboundedSender<Control>>>,
}

/// A platform that speaks the connector protocol on 127.0.0.1.
///
/// Answers auth, acknowledges requests and events with 200 unless told
/// otherwise, and records everything it receives after the handshake.
#[derive(Clone)]
pub struct MockPlatform {
    pub url: Url,
    state: Arc<PlatformState>,
}

impl MockPlatform {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(PlatformState {
            accept_auth: AtomicBool::new(true),
            handshakes: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            behavior: Mutex::new(Behavior::default()),
            control: Mutex::new(None),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn_state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        serve_connection(ws, conn_state).await;
                    }
                });
            }
        });

        Self {
            url: Url::parse(&format!("ws://{addr}/connector")).unwrap(),
            state,
        }
    }

    // ── Behavior ────────────────────────────────────────────────────

    pub fn reject_auth(&self, reject: bool) {
        self.state.accept_auth.store(!reject, Ordering::SeqCst);
    }

    pub fn silence_method(&self, method: Method, silent: bool) {
        let mut b = self.behavior();
        if silent {
            b.silent_methods.insert(method);
        } else {
            b.silent_methods.remove(&method);
        }
    }

    pub fn fail_method(&self, method: Method) {
        self.behavior().failing_methods.insert(method);
    }

    pub fn silence_service(&self, service: &str) {
        self.behavior().silent_services.insert(service.to_owned());
    }

    pub fn delay_service(&self, service: &str, delay: Duration) {
        self.behavior()
            .delayed_services
            .insert(service.to_owned(), delay);
    }

    /// Stop acknowledging task responses from the client.
    pub fn silence_responses(&self, silent: bool) {
        self.behavior().silent_responses = silent;
    }

    fn behavior(&self) -> MutexGuard<'_, Behavior> {
        self.state
            .behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ── Control ─────────────────────────────────────────────────────

    /// Push a task to the connected client.
    pub fn push_task(&self, task: Message) {
        self.control(Control::Send(task));
    }

    /// Drop the current connection.
    pub fn kick(&self) {
        self.control(Control::Kick);
    }

    fn control(&self, ctl: Control) {
        let guard = self
            .state
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().expect("no connection to control");
        let _ = tx.send(ctl);
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Message> {
        self.state
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_received(&self) {
        self.state
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Device ids carried by received requests with `method`, in order.
    pub fn device_ids(&self, method: Method) -> Vec<String> {
        self.received()
            .iter()
            .filter(|m| m.kind == MessageKind::Request && m.method == Some(method))
            .map(|m| {
                let payload: serde_json::Value = serde_json::from_str(&m.payload).unwrap();
                payload["id"].as_str().unwrap().to_owned()
            })
            .collect()
    }

    pub fn auth_payloads(&self) -> Vec<serde_json::Value> {
        self.received()
            .iter()
            .filter(|m| m.method == Some(Method::Auth))
            .map(|m| serde_json::from_str(&m.payload).unwrap())
            .collect()
    }
}

async fn serve_connection(
    mut ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    state: Arc<PlatformState>,
) {
    // Handshake
    let Some(Ok(WsFrame::Text(text))) = ws.next().await else {
        return;
    };
    let auth = Message::from_json(text.as_str()).unwrap();
    state.handshakes.fetch_add(1, Ordering::SeqCst);
    state
        .received
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(auth.clone());
    if !state.accept_auth.load(Ordering::SeqCst) {
        let reply = Message::response(&auth, 401, "invalid credentials");
        let _ = ws.send(frame(&reply)).await;
        let _ = ws.close(None).await;
        return;
    }
    if ws.send(frame(&Message::response(&auth, 200, ""))).await.is_err() {
        return;
    }

    let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel();
    *state.control.lock().unwrap_or_else(PoisonError::into_inner) = Some(ctl_tx.clone());

    loop {
        tokio::select! {
            incoming = ws.next() => {
                let Some(Ok(WsFrame::Text(text))) = incoming else { break };
                let msg = Message::from_json(text.as_str()).unwrap();
                state
                    .received
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(msg.clone());
                if let Some((reply, delay)) = answer(&state, &msg) {
                    if delay.is_zero() {
                        if ws.send(frame(&reply)).await.is_err() {
                            break;
                        }
                    } else {
                        let tx = ctl_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(Control::Send(reply));
                        });
                    }
                }
            }
            ctl = ctl_rx.recv() => match ctl {
                Some(Control::Send(msg)) => {
                    if ws.send(frame(&msg)).await.is_err() {
                        break;
                    }
                }
                Some(Control::Kick) | None => {
                    let _ = ws.close(None).await;
                    break;
                }
            }
        }
    }
}

/// The platform's reply to `msg`, if any, and how long to hold it.
fn answer(state: &PlatformState, msg: &Message) -> Option<(Message, Duration)> {
    let behavior = state
        .behavior
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    match msg.kind {
        MessageKind::Request => {
            let method = msg.method?;
            if behavior.silent_methods.contains(&method) {
                return None;
            }
            let status = if behavior.failing_methods.contains(&method) {
                500
            } else {
                200
            };
            Some((Message::response(msg, status, ""), Duration::ZERO))
        }
        MessageKind::Event => {
            let service = msg.service.clone().unwrap_or_default();
            if behavior.silent_services.contains(&service) {
                return None;
            }
            let delay = behavior
                .delayed_services
                .get(&service)
                .copied()
                .unwrap_or_default();
            Some((Message::response(msg, 200, "ack"), delay))
        }
        MessageKind::Response if behavior.silent_responses => None,
        MessageKind::Response => Some((Message::response(msg, 200, "ack"), Duration::ZERO)),
        MessageKind::Task => None,
    }
}

fn frame(msg: &Message) -> WsFrame {
    WsFrame::Text(msg.to_json().unwrap().into())
}

// ── Client helpers ──────────────────────────────────────────────────

pub fn client_config(url: Url) -> ClientConfig {
    let mut config = ClientConfig::new(url, Credentials::new("tester", "secret", "group-1"));
    config.handshake_timeout = Duration::from_secs(2);
    config.request_timeout = Duration::from_secs(1);
    config.sweep_interval = Duration::from_millis(20);
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        factor: 2.0,
    };
    config
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
