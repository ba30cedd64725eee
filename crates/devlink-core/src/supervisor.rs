// ── Connection supervisor ──
//
// Drives Disconnected → Connecting → Connected → (lost) → Reconnecting
// → Connecting … until shutdown. Each session gets a router task (the
// receive loop context) that resolves responses and queues platform
// tasks. Device synchronization runs before the state becomes
// Connected, so application calls are admitted only after it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use devlink_api::{MessageKind, Session, SessionConfig, SessionEvent};

use crate::client::ClientInner;
use crate::config::ReconnectConfig;
use crate::correlation::Resolution;
use crate::error::CoreError;
use crate::sync;

// ── ConnectionState ──────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

// ── Supervisor loop ──────────────────────────────────────────────

/// How a connected session ended.
enum SessionEnd {
    Lost,
    Shutdown,
}

pub(crate) async fn run(inner: Arc<ClientInner>) {
    let cancel = inner.cancel.clone();
    let mut attempt: u32 = 0;

    loop {
        inner.set_state(ConnectionState::Connecting);

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = open_session(&inner) => result,
        };

        match opened {
            Ok((session, events)) => {
                attempt = 0;
                match serve(&inner, session, events).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost => {}
                }
            }
            Err(e) => {
                warn!(error = %e, attempt, "Connection attempt failed");
            }
        }

        attempt = attempt.saturating_add(1);
        inner.set_state(ConnectionState::Reconnecting { attempt });

        let delay = calculate_backoff(attempt - 1, &inner.config.reconnect);
        info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt,
            "Waiting before reconnect"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    if let Some(session) = inner.session.swap(None) {
        session.close();
    }
    inner.set_state(ConnectionState::Disconnected);
    debug!("Supervisor exiting");
}

/// Hub registration (if configured) followed by `Session::open`.
async fn open_session(
    inner: &ClientInner,
) -> Result<(Session, mpsc::UnboundedReceiver<SessionEvent>), CoreError> {
    let config = &inner.config;

    let hub_id = match &inner.hub_api {
        Some(api) => {
            let known = inner.hub_id.load_full();
            let name = inner.hub_name.load_full().map(|n| n.as_ref().clone()).unwrap_or_default();
            let id = api.ensure_hub(known.as_deref().map(String::as_str), &name).await?;
            if known.as_deref() != Some(&id) {
                info!(hub_id = %id, "Using hub");
                inner.hub_id.store(Some(Arc::new(id.clone())));
            }
            Some(id)
        }
        _ => None,
    };

    let session_config = SessionConfig {
        url: config.url.clone(),
        credentials: config.credentials.clone(),
        hub_id,
        handshake_timeout: config.handshake_timeout,
        tls: config.tls.clone(),
    };
    Ok(Session::open(session_config).await?)
}

/// Run one session from synchronization until it is lost or shut down.
async fn serve(
    inner: &Arc<ClientInner>,
    session: Session,
    events: mpsc::UnboundedReceiver<SessionEvent>,
) -> SessionEnd {
    let cancel = inner.cancel.clone();
    let session = Arc::new(session);
    inner.session.store(Some(Arc::clone(&session)));

    let (lost_tx, mut lost_rx) = oneshot::channel();
    inner
        .runtime
        .spawn(route(Arc::clone(inner), events, lost_tx));

    // Synchronize before admitting application traffic.
    let synced = tokio::select! {
        biased;
        () = cancel.cancelled() => return SessionEnd::Shutdown,
        _ = &mut lost_rx => false,
        report = sync::synchronize(inner) => {
            info!(
                registered = report.registered.len(),
                skipped = report.skipped.len(),
                removed = report.removed.len(),
                failed = report.failed.len(),
                hub = ?report.hub,
                "Device synchronization finished"
            );
            true
        }
    };

    if synced {
        inner.set_state(ConnectionState::Connected);
        info!(url = %session.url(), "Connected");
        inner.notify_connect();

        tokio::select! {
            biased;
            () = cancel.cancelled() => return SessionEnd::Shutdown,
            _ = &mut lost_rx => {}
        }
    }

    warn!("Connection lost");
    inner.session.store(None);
    session.close();
    if synced {
        inner.notify_disconnect();
    }
    SessionEnd::Lost
}

// ── Receive loop context ─────────────────────────────────────────

/// Sole resolver of the correlation table and sole producer of the
/// task queue for one session. Signals `lost` when the session ends.
async fn route(
    inner: Arc<ClientInner>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    lost: oneshot::Sender<()>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Message(msg) => match msg.kind {
                MessageKind::Response => {
                    let id = msg.id.clone();
                    if inner.table.resolve(msg) == Resolution::Unmatched {
                        debug!(correlation_id = %id, "Dropping unmatched response");
                    }
                }
                MessageKind::Task => {
                    debug!(correlation_id = %msg.id, device_id = ?msg.device_id, "Task received");
                    inner.enqueue_task(msg);
                }
                MessageKind::Request | MessageKind::Event => {
                    debug!(correlation_id = %msg.id, kind = ?msg.kind, "Ignoring unexpected message");
                }
            },
            SessionEvent::Closed(reason) => {
                info!(%reason, "Session ended");
                break;
            }
        }
    }
    let _ = lost.send(());
}

// ── Timeout sweeper ──────────────────────────────────────────────

/// Expire overdue correlation entries so callbacks fire even when
/// nobody awaits the handle.
pub(crate) async fn sweep(inner: Arc<ClientInner>) {
    let mut ticker = tokio::time::interval(inner.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let expired = inner.table.expire(Instant::now());
                if !expired.is_empty() {
                    debug!(count = expired.len(), "Expired pending calls");
                }
            }
        }
    }
}

// ── Backoff calculation ──────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * factor^attempt, max) + jitter`
///
/// Jitter is +-25% to spread out reconnection storms from many connectors.
pub(crate) fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base = config.initial_delay.as_secs_f64() * config.factor.max(1.0).powi(exp);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic "jitter" seeded from the attempt number.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}
