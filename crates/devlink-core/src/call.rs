// ── Pending calls ──
//
// Handles returned by every call-bridge operation. A `PendingCall` is
// completed exactly once: by the matching response, by its deadline, or
// immediately when the request could not be sent. It can be awaited,
// waited on from a plain thread, or handed a completion callback.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;

use devlink_api::Message;

use crate::correlation::CorrelationTable;
use crate::store::StoreError;

// ── Outcome ──────────────────────────────────────────────────────────

/// Final state of a call's network portion.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The platform answered. The status may still be a failure.
    Response(Arc<Message>),
    /// No answer arrived before the deadline.
    TimedOut,
    /// The request never left: client not connected or session gone.
    NotSent(String),
}

impl Outcome {
    /// `true` for a response with a 2xx status.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Response(msg) if msg.is_success())
    }

    pub fn response(&self) -> Option<&Message> {
        match self {
            Self::Response(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    pub fn is_not_sent(&self) -> bool {
        matches!(self, Self::NotSent(_))
    }
}

/// Observable completion state of a [`PendingCall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Resolved,
    TimedOut,
    NotSent,
}

impl From<&Outcome> for CallState {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Response(_) => Self::Resolved,
            Outcome::TimedOut => Self::TimedOut,
            Outcome::NotSent(_) => Self::NotSent,
        }
    }
}

// ── PendingCall ──────────────────────────────────────────────────────

enum Inner {
    Settled(Outcome),
    /// Registered in the correlation table.
    Waiting {
        rx: oneshot::Receiver<Outcome>,
        deadline: Instant,
        table: Arc<CorrelationTable>,
    },
    /// Completed by a relay task that post-processes another call.
    Relayed { rx: oneshot::Receiver<Outcome> },
}

/// Handle to one in-flight call.
pub struct PendingCall {
    id: String,
    handle: Handle,
    inner: Inner,
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl PendingCall {
    pub(crate) fn settled(id: String, outcome: Outcome, handle: Handle) -> Self {
        Self {
            id,
            handle,
            inner: Inner::Settled(outcome),
        }
    }

    pub(crate) fn waiting(
        id: String,
        rx: oneshot::Receiver<Outcome>,
        deadline: Instant,
        table: Arc<CorrelationTable>,
        handle: Handle,
    ) -> Self {
        Self {
            id,
            handle,
            inner: Inner::Waiting {
                rx,
                deadline,
                table,
            },
        }
    }

    pub(crate) fn relayed(id: String, rx: oneshot::Receiver<Outcome>, handle: Handle) -> Self {
        Self {
            id,
            handle,
            inner: Inner::Relayed { rx },
        }
    }

    /// Correlation id of the request.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the outcome. Returns no later than the deadline
    /// (plus scheduling latency).
    pub async fn wait(self) -> Outcome {
        match self.inner {
            Inner::Settled(outcome) => outcome,
            Inner::Waiting {
                mut rx,
                deadline,
                table,
            } => match tokio::time::timeout_at(deadline, &mut rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Outcome::NotSent("call abandoned".into()),
                Err(_) => {
                    if table.expire_one(&self.id) {
                        Outcome::TimedOut
                    } else {
                        // Lost the race to the receive loop or the sweeper;
                        // the winner has already sent.
                        rx.await.unwrap_or(Outcome::TimedOut)
                    }
                }
            },
            Inner::Relayed { rx } => rx
                .await
                .unwrap_or_else(|_| Outcome::NotSent("call abandoned".into())),
        }
    }

    /// Block the current thread until the outcome is known.
    ///
    /// Meant for application threads outside the runtime. Calling it on
    /// a runtime worker blocks that worker.
    pub fn wait_blocking(self) -> Outcome {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        let handle = self.handle.clone();
        handle.spawn(async move {
            let _ = tx.send(self.wait().await);
        });
        rx.recv()
            .unwrap_or_else(|_| Outcome::NotSent("runtime shut down".into()))
    }

    /// Run `callback` exactly once with the outcome, then return immediately.
    ///
    /// The callback runs on the blocking pool, never on the receive loop,
    /// so it may block. Extra arguments are captured by the closure.
    pub fn on_complete<F>(self, callback: F)
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        let handle = self.handle.clone();
        let id = self.id.clone();
        handle.spawn(async move {
            let outcome = self.wait().await;
            if let Err(e) = tokio::task::spawn_blocking(move || callback(outcome)).await {
                tracing::warn!(correlation_id = %id, error = %e, "Completion callback panicked");
            }
        });
    }

    /// Non-blocking check. Once `Some`, the outcome is cached.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        let next = match &mut self.inner {
            Inner::Settled(outcome) => return Some(outcome.clone()),
            Inner::Waiting {
                rx,
                deadline,
                table,
            } => match rx.try_recv() {
                Ok(outcome) => outcome,
                Err(oneshot::error::TryRecvError::Empty) => {
                    if Instant::now() < *deadline {
                        return None;
                    }
                    if table.expire_one(&self.id) {
                        Outcome::TimedOut
                    } else {
                        // Another completer won and is about to send.
                        match rx.try_recv() {
                            Ok(outcome) => outcome,
                            Err(oneshot::error::TryRecvError::Empty) => return None,
                            Err(oneshot::error::TryRecvError::Closed) => Outcome::TimedOut,
                        }
                    }
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    Outcome::NotSent("call abandoned".into())
                }
            },
            Inner::Relayed { rx } => match rx.try_recv() {
                Ok(outcome) => outcome,
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    Outcome::NotSent("call abandoned".into())
                }
            },
        };
        self.inner = Inner::Settled(next.clone());
        Some(next)
    }

    pub fn state(&mut self) -> CallState {
        self.try_outcome()
            .as_ref()
            .map_or(CallState::Pending, CallState::from)
    }
}

// ── Device calls ─────────────────────────────────────────────────────

/// Result of a device operation: the local store mutation and the
/// platform's answer, reported independently.
#[derive(Debug)]
pub struct DeviceOutcome {
    pub local: Result<(), StoreError>,
    pub remote: Outcome,
}

impl DeviceOutcome {
    pub fn local_ok(&self) -> bool {
        self.local.is_ok()
    }

    /// Whether the platform accepted the operation. Ignores the local side.
    pub fn remote_ok(&self) -> bool {
        self.remote.is_success()
    }
}

/// Handle returned by `add`, `update`, `disconnect` and `delete`.
///
/// The local mutation has already happened when this is returned.
#[derive(Debug)]
pub struct DeviceCall {
    local: Result<(), StoreError>,
    remote: PendingCall,
}

impl DeviceCall {
    pub(crate) fn new(local: Result<(), StoreError>, remote: PendingCall) -> Self {
        Self { local, remote }
    }

    pub fn id(&self) -> &str {
        self.remote.id()
    }

    pub fn local(&self) -> &Result<(), StoreError> {
        &self.local
    }

    pub async fn wait(self) -> DeviceOutcome {
        DeviceOutcome {
            local: self.local,
            remote: self.remote.wait().await,
        }
    }

    pub fn wait_blocking(self) -> DeviceOutcome {
        DeviceOutcome {
            local: self.local,
            remote: self.remote.wait_blocking(),
        }
    }

    /// Callback flavor of [`wait`](Self::wait); same dispatch rules as
    /// [`PendingCall::on_complete`].
    pub fn on_complete<F>(self, callback: F)
    where
        F: FnOnce(DeviceOutcome) + Send + 'static,
    {
        let local = self.local;
        self.remote
            .on_complete(move |remote| callback(DeviceOutcome { local, remote }));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use devlink_api::Method;

    fn ok_response(id: &str) -> Message {
        let mut req = Message::request(Method::PutDevice, "");
        req.id = id.to_owned();
        Message::response(&req, 200, "")
    }

    fn waiting(table: &Arc<CorrelationTable>, id: &str, after: Duration) -> PendingCall {
        let deadline = Instant::now() + after;
        let rx = table.register(id, deadline).unwrap();
        PendingCall::waiting(id.into(), rx, deadline, Arc::clone(table), Handle::current())
    }

    #[tokio::test]
    async fn settled_call_returns_immediately() {
        let call = PendingCall::settled(
            "x".into(),
            Outcome::NotSent("offline".into()),
            Handle::current(),
        );
        assert!(call.wait().await.is_not_sent());
    }

    #[tokio::test]
    async fn response_before_deadline_wins() {
        let table = Arc::new(CorrelationTable::new());
        let call = waiting(&table, "a", Duration::from_secs(5));
        table.resolve(ok_response("a"));
        assert!(call.wait().await.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_produces_timeout_and_clears_entry() {
        let table = Arc::new(CorrelationTable::new());
        let call = waiting(&table, "a", Duration::from_millis(100));
        let started = Instant::now();

        assert!(call.wait().await.is_timed_out());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_millis(150));
        assert!(!table.contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn try_outcome_expires_past_deadline() {
        let table = Arc::new(CorrelationTable::new());
        let mut call = waiting(&table, "a", Duration::from_millis(50));
        assert_eq!(call.state(), CallState::Pending);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(call.state(), CallState::TimedOut);
        // Cached: a late response changes nothing.
        assert_eq!(
            table.resolve(ok_response("a")),
            crate::correlation::Resolution::Unmatched
        );
        assert_eq!(call.state(), CallState::TimedOut);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn on_complete_runs_callback_once_off_runtime_worker() {
        let table = Arc::new(CorrelationTable::new());
        let call = waiting(&table, "a", Duration::from_secs(5));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tag = String::from("extra-arg");

        call.on_complete(move |outcome| {
            // Blocking pool threads may block without stalling the runtime.
            std::thread::sleep(Duration::from_millis(10));
            let _ = tx.send((outcome.is_success(), tag));
        });

        table.resolve(ok_response("a"));
        let (ok, tag) = rx.await.unwrap();
        assert!(ok);
        assert_eq!(tag, "extra-arg");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_blocking_from_plain_thread() {
        let table = Arc::new(CorrelationTable::new());
        let call = waiting(&table, "a", Duration::from_secs(5));

        let waiter = std::thread::spawn(move || call.wait_blocking());
        tokio::time::sleep(Duration::from_millis(20)).await;
        table.resolve(ok_response("a"));

        let outcome = tokio::task::spawn_blocking(move || waiter.join().unwrap())
            .await
            .unwrap();
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn device_outcome_separates_local_and_remote() {
        let call = DeviceCall::new(
            Err(StoreError::NotFound { id: "d1".into() }),
            PendingCall::settled("x".into(), Outcome::TimedOut, Handle::current()),
        );
        assert!(call.local().is_err());
        let outcome = call.wait().await;
        assert!(!outcome.local_ok());
        assert!(!outcome.remote_ok());
    }
}
