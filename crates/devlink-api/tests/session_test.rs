#![allow(clippy::unwrap_used)]
// Integration tests for `Session` against an in-process WebSocket platform.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use url::Url;

use devlink_api::{
    CloseReason, Credentials, Error, Message, MessageKind, Method, Session, SessionConfig,
    SessionEvent, TlsMode,
};

// ── Helpers ─────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Behavior {
    /// Accept auth, push one task, then answer every request with 200.
    Serve,
    /// Answer auth with 401.
    Reject,
    /// Never answer auth.
    Silent,
    /// Accept auth, then close the socket.
    CloseAfterAuth,
}

/// Start a one-connection platform. Returns its URL and the frames it received.
async fn platform(behavior: Behavior) -> (Url, mpsc::UnboundedReceiver<Message>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let Some(Ok(WsFrame::Text(text))) = ws.next().await else {
            return;
        };
        let auth = Message::from_json(text.as_str()).unwrap();
        let _ = seen_tx.send(auth.clone());

        let status = match behavior {
            Behavior::Silent => {
                tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
            Behavior::Reject => 401,
            Behavior::Serve | Behavior::CloseAfterAuth => 200,
        };
        let reply = Message::response(&auth, status, "");
        ws.send(WsFrame::Text(reply.to_json().unwrap().into()))
            .await
            .unwrap();

        match behavior {
            Behavior::CloseAfterAuth => {
                let _ = ws.close(None).await;
                return;
            }
            Behavior::Reject | Behavior::Silent => return,
            Behavior::Serve => {}
        }

        let task = Message::task("d1", "switch", "on");
        ws.send(WsFrame::Text(task.to_json().unwrap().into()))
            .await
            .unwrap();

        while let Some(Ok(frame)) = ws.next().await {
            if let WsFrame::Text(text) = frame {
                let msg = Message::from_json(text.as_str()).unwrap();
                let _ = seen_tx.send(msg.clone());
                if msg.kind == MessageKind::Request {
                    let ack = Message::response(&msg, 200, "ack");
                    ws.send(WsFrame::Text(ack.to_json().unwrap().into()))
                        .await
                        .unwrap();
                }
            }
        }
    });

    let url = Url::parse(&format!("ws://{addr}/connector")).unwrap();
    (url, seen_rx)
}

fn config(url: Url) -> SessionConfig {
    SessionConfig {
        url,
        credentials: Credentials::new("alice", "secret", "group-1"),
        hub_id: None,
        handshake_timeout: Duration::from_millis(500),
        tls: TlsMode::default(),
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

// ── Handshake tests ─────────────────────────────────────────────────

#[tokio::test]
async fn test_open_sends_credentials() {
    let (url, mut seen) = platform(Behavior::Serve).await;
    let (_session, _events) = Session::open(config(url)).await.unwrap();

    let auth = seen.recv().await.unwrap();
    assert_eq!(auth.method, Some(Method::Auth));
    let payload: serde_json::Value = serde_json::from_str(&auth.payload).unwrap();
    assert_eq!(payload["user"], "alice");
    assert_eq!(payload["password"], "secret");
    assert_eq!(payload["gid"], "group-1");
}

#[tokio::test]
async fn test_session_honours_tls_mode() {
    let (url, _seen) = platform(Behavior::Serve).await;

    // An unreadable CA file fails before any connection attempt.
    let mut bad_ca = config(url.clone());
    bad_ca.tls = TlsMode::CustomCa("/nonexistent/devlink-ca.pem".into());
    let result = Session::open(bad_ca).await;
    assert!(
        matches!(result, Err(Error::Tls(_))),
        "expected Tls error, got: {:?}",
        result.err()
    );

    // A rustls connector is harmless on plain ws://.
    let mut lenient = config(url);
    lenient.tls = TlsMode::DangerAcceptInvalid;
    let (session, _events) = Session::open(lenient).await.unwrap();
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_rejected_credentials_fail_open() {
    let (url, _seen) = platform(Behavior::Reject).await;
    let result = Session::open(config(url)).await;
    assert!(
        matches!(result, Err(Error::Authentication { status: 401, .. })),
        "expected Authentication error, got: {:?}",
        result.err()
    );
}

#[tokio::test]
async fn test_silent_platform_times_out() {
    let (url, _seen) = platform(Behavior::Silent).await;
    let result = Session::open(config(url)).await;
    assert!(
        matches!(result, Err(Error::HandshakeTimeout { timeout_ms: 500 })),
        "expected HandshakeTimeout, got: {:?}",
        result.err()
    );
}

#[tokio::test]
async fn test_refused_connection_fails_open() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let url = Url::parse(&format!("ws://127.0.0.1:{port}/connector")).unwrap();

    let result = Session::open(config(url)).await;
    assert!(
        matches!(result, Err(Error::WebSocketConnect(_))),
        "expected WebSocketConnect, got: {:?}",
        result.err()
    );
}

// ── Traffic tests ───────────────────────────────────────────────────

#[tokio::test]
async fn test_tasks_and_responses_flow() {
    let (url, mut seen) = platform(Behavior::Serve).await;
    let (session, mut events) = Session::open(config(url)).await.unwrap();
    let _auth = seen.recv().await.unwrap();

    match next_event(&mut events).await {
        SessionEvent::Message(task) => {
            assert_eq!(task.kind, MessageKind::Task);
            assert_eq!(task.device_id.as_deref(), Some("d1"));
        }
        SessionEvent::Closed(reason) => panic!("unexpected close: {reason}"),
    }

    let request = Message::request(Method::PutDevice, "{}");
    session.send(&request).unwrap();

    assert_eq!(seen.recv().await.unwrap().id, request.id);
    match next_event(&mut events).await {
        SessionEvent::Message(reply) => {
            assert_eq!(reply.id, request.id);
            assert!(reply.is_success());
        }
        SessionEvent::Closed(reason) => panic!("unexpected close: {reason}"),
    }
}

#[tokio::test]
async fn test_remote_close_is_reported_once() {
    let (url, _seen) = platform(Behavior::CloseAfterAuth).await;
    let (session, mut events) = Session::open(config(url)).await.unwrap();

    match next_event(&mut events).await {
        SessionEvent::Closed(CloseReason::Remote { .. } | CloseReason::Ended) => {}
        other => panic!("expected remote close, got: {other:?}"),
    }
    // The reader task is gone; the channel ends right after the close.
    assert!(events.recv().await.is_none());
    assert!(session.is_closed());
    assert!(matches!(
        session.send(&Message::request(Method::PutDevice, "")),
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn test_local_close_is_idempotent() {
    let (url, _seen) = platform(Behavior::Serve).await;
    let (session, mut events) = Session::open(config(url)).await.unwrap();

    session.close();
    session.close();

    loop {
        match next_event(&mut events).await {
            SessionEvent::Message(_) => {}
            SessionEvent::Closed(reason) => {
                assert_eq!(reason, CloseReason::Local);
                break;
            }
        }
    }
    assert!(events.recv().await.is_none());
    assert!(matches!(
        session.send(&Message::request(Method::PutDevice, "")),
        Err(Error::NotConnected)
    ));
}
