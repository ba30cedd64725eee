// ── Client facade ──
//
// The single public entry point. Owns the configuration, the device
// manager, the correlation table and the background tasks (supervisor
// and sweeper). Every call-bridge operation returns a handle right away;
// the network portion completes through the correlation table.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devlink_api::{
    ContentType, HttpClient, HubApi, Message, Method, Session, TransportConfig,
};

use crate::call::{DeviceCall, Outcome, PendingCall};
use crate::config::{ClientConfig, derive_device_id_prefix};
use crate::correlation::CorrelationTable;
use crate::error::CoreError;
use crate::instance::InstanceGuard;
use crate::model::{Device, DeviceRef};
use crate::store::DeviceManager;
use crate::supervisor::{self, ConnectionState};
use crate::sync::SyncRecord;

/// Queued-task depth at which (and at each multiple of which) a warning
/// is logged. The queue itself is unbounded: the router also resolves
/// call responses and must never wait on a slow consumer.
const TASK_QUEUE_WARN: usize = 1024;

/// Connect / disconnect notification.
pub type Notification = Arc<dyn Fn() + Send + Sync>;

/// Who is sending: application calls need a Connected client, the
/// synchronization run goes out before the state flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Application,
    Internal,
}

// ── Client ───────────────────────────────────────────────────────

/// Root object of the runtime. One per process.
///
/// Construct inside a Tokio runtime, call [`start`](Self::start), and
/// share it behind an `Arc` if several threads need it. Dropping the
/// client stops the background tasks and frees the instance slot.
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) devices: Arc<dyn DeviceManager>,
    pub(crate) table: Arc<CorrelationTable>,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) session: ArcSwapOption<Session>,
    pub(crate) hub_api: Option<HubApi>,
    pub(crate) hub_id: ArcSwapOption<String>,
    pub(crate) hub_name: ArcSwapOption<String>,
    pub(crate) device_id_prefix: String,
    tasks_tx: mpsc::UnboundedSender<Message>,
    tasks_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    queued_tasks: AtomicUsize,
    on_connect: RwLock<Option<Notification>>,
    on_disconnect: RwLock<Option<Notification>>,
    pub(crate) sync_records: DashMap<String, SyncRecord>,
    pub(crate) cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    guard: Mutex<Option<InstanceGuard>>,
    pub(crate) runtime: Handle,
}

impl Client {
    /// Create a client. Does NOT connect; call [`start`](Self::start).
    ///
    /// Fails with [`CoreError::AlreadyRunning`] while another client is
    /// alive in this process, and with [`CoreError::NoRuntime`] outside a
    /// Tokio runtime.
    pub fn new(config: ClientConfig, devices: Arc<dyn DeviceManager>) -> Result<Self, CoreError> {
        let runtime = Handle::try_current().map_err(|_| CoreError::NoRuntime)?;

        let hub_api = match &config.hub {
            Some(hub) => {
                let transport = TransportConfig {
                    tls: config.tls.clone(),
                    timeout: config.request_timeout,
                };
                let http = HttpClient::new(&transport, config.http)?;
                Some(HubApi::new(http, hub.api_url.clone()))
            }
            None => None,
        };
        let hub_id = config.hub.as_ref().and_then(|h| h.id.clone()).map(Arc::new);
        let hub_name = config.hub.as_ref().map(|h| Arc::new(h.name.clone()));
        let device_id_prefix = config
            .hub
            .as_ref()
            .and_then(|h| h.device_id_prefix.clone())
            .unwrap_or_else(|| derive_device_id_prefix(&config.credentials));

        let guard = InstanceGuard::acquire()?;

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                devices,
                table: Arc::new(CorrelationTable::new()),
                state,
                session: ArcSwapOption::empty(),
                hub_api,
                hub_id: ArcSwapOption::new(hub_id),
                hub_name: ArcSwapOption::new(hub_name),
                device_id_prefix,
                tasks_tx,
                tasks_rx: tokio::sync::Mutex::new(tasks_rx),
                queued_tasks: AtomicUsize::new(0),
                on_connect: RwLock::new(None),
                on_disconnect: RwLock::new(None),
                sync_records: DashMap::new(),
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
                guard: Mutex::new(Some(guard)),
                runtime,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The device manager this client synchronizes.
    pub fn devices(&self) -> &Arc<dyn DeviceManager> {
        &self.inner.devices
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Spawn the connection supervisor and the timeout sweeper.
    ///
    /// Returns immediately; watch [`connection_state`](Self::connection_state)
    /// or use [`wait_connected`](Self::wait_connected). Calling it again is
    /// a no-op.
    pub fn start(&self) -> Result<(), CoreError> {
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::Internal("client has been shut down".into()));
        }
        let mut handles = self
            .inner
            .task_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !handles.is_empty() {
            return Ok(());
        }

        info!(url = %self.inner.config.url, "Starting client");
        let sup = Arc::clone(&self.inner);
        handles.push(self.inner.runtime.spawn(supervisor::run(sup)));
        let sweep = Arc::clone(&self.inner);
        handles.push(self.inner.runtime.spawn(supervisor::sweep(sweep)));
        Ok(())
    }

    /// Stop all background work, close the session and release the
    /// instance slot. The final state is `Disconnected`.
    ///
    /// Calls still pending complete at their deadline.
    pub async fn shutdown(&self) {
        info!("Shutting down client");
        self.inner.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .task_handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        if let Some(session) = self.inner.session.swap(None) {
            session.close();
        }
        self.inner.state.send_replace(ConnectionState::Disconnected);
        self.inner.release_guard();
    }

    // ── State ────────────────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Observe connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Wait until the client is Connected. Returns `false` on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, ConnectionState::Connected)),
        )
        .await
        .is_ok_and(|r| r.is_ok())
    }

    /// Hub id in use (configured, or assigned by the platform on connect).
    pub fn hub_id(&self) -> Option<String> {
        self.inner.hub_id.load_full().map(|id| id.as_ref().clone())
    }

    /// Hub name, as last reported by the platform.
    pub fn hub_name(&self) -> Option<String> {
        self.inner.hub_name.load_full().map(|name| name.as_ref().clone())
    }

    /// Id under which `device_id` is listed on the hub.
    pub fn hub_device_id(&self, device_id: &str) -> String {
        self.inner.hub_device_id(device_id)
    }

    /// Last known registration outcome for a device.
    pub fn sync_record(&self, device_id: &str) -> Option<SyncRecord> {
        self.inner
            .sync_records
            .get(device_id)
            .map(|r| r.value().clone())
    }

    // ── Notifications ────────────────────────────────────────────

    /// Called (on the blocking pool) each time the client becomes Connected.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self
            .inner
            .on_connect
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Called (on the blocking pool) each time a Connected session is lost.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self
            .inner
            .on_disconnect
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    // ── Platform tasks ───────────────────────────────────────────

    /// Next platform task, in arrival order. `None` once shut down.
    pub async fn receive(&self) -> Option<Message> {
        let mut rx = self.inner.tasks_rx.lock().await;
        let msg = tokio::select! {
            biased;
            msg = rx.recv() => msg,
            () = self.inner.cancel.cancelled() => None,
        };
        self.inner.dequeued(msg)
    }

    /// A queued task, if one is ready right now.
    pub fn try_receive(&self) -> Option<Message> {
        let msg = self.inner.tasks_rx.try_lock().ok()?.try_recv().ok();
        self.inner.dequeued(msg)
    }

    /// Platform tasks waiting to be received.
    pub fn queued_tasks(&self) -> usize {
        self.inner.queued_tasks.load(Ordering::Acquire)
    }

    pub async fn receive_timeout(&self, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .ok()
            .flatten()
    }

    // ── Calls ────────────────────────────────────────────────────

    /// Answer a platform task and wait for the platform's acknowledgement.
    pub fn response(
        &self,
        task: &Message,
        payload: impl Into<String>,
        timeout: Duration,
    ) -> Result<PendingCall, CoreError> {
        let reply = Message::response(task, 200, payload);
        self.inner.call(reply, timeout, Admission::Application)
    }

    /// Push a device event for `service`.
    ///
    /// Fails with [`CoreError::DeviceNotFound`] if the device manager does
    /// not know the device.
    pub fn event(
        &self,
        device: impl Into<DeviceRef>,
        service: impl Into<String>,
        payload: impl Into<String>,
        timeout: Duration,
    ) -> Result<PendingCall, CoreError> {
        self.event_with(device, service, payload, ContentType::Json, timeout)
    }

    /// [`event`](Self::event) with an explicit payload content type.
    pub fn event_with(
        &self,
        device: impl Into<DeviceRef>,
        service: impl Into<String>,
        payload: impl Into<String>,
        content_type: ContentType,
        timeout: Duration,
    ) -> Result<PendingCall, CoreError> {
        let device = device.into();
        let id = device.id();
        if self.inner.devices.get(id).is_none() {
            return Err(CoreError::DeviceNotFound { id: id.to_owned() });
        }
        let msg = Message::event(id, service, payload, content_type);
        self.inner.call(msg, timeout, Admission::Application)
    }

    // ── Device operations ────────────────────────────────────────

    /// Add `device` locally and register it with the platform.
    pub fn add(&self, device: Device, timeout: Duration) -> Result<DeviceCall, CoreError> {
        device.validate()?;
        let local = self.inner.devices.add(device.clone());
        let remote = self
            .inner
            .put_device(&device, timeout, Admission::Application)?;
        Ok(DeviceCall::new(local, remote))
    }

    /// Store `device` locally (insert or replace) and re-register it.
    pub fn update(&self, device: Device, timeout: Duration) -> Result<DeviceCall, CoreError> {
        device.validate()?;
        let local = self.inner.devices.update(device.clone());
        let remote = self
            .inner
            .put_device(&device, timeout, Admission::Application)?;
        Ok(DeviceCall::new(local, remote))
    }

    /// Remove a device locally and mark it disconnected on the platform.
    pub fn disconnect(
        &self,
        device: impl Into<DeviceRef>,
        timeout: Duration,
    ) -> Result<DeviceCall, CoreError> {
        self.remove_device(device.into(), Method::DisconnectDevice, timeout)
    }

    /// Remove a device locally and delete it on the platform.
    pub fn delete(
        &self,
        device: impl Into<DeviceRef>,
        timeout: Duration,
    ) -> Result<DeviceCall, CoreError> {
        self.remove_device(device.into(), Method::DeleteDevice, timeout)
    }

    fn remove_device(
        &self,
        device: DeviceRef,
        method: Method,
        timeout: Duration,
    ) -> Result<DeviceCall, CoreError> {
        let id = device.id().to_owned();
        if id.trim().is_empty() {
            return Err(CoreError::InvalidDevice {
                reason: "device id is empty".into(),
            });
        }
        let local = self.inner.devices.remove(&id).map(|_| ());
        let remote = self
            .inner
            .remove_remote(&id, method, timeout, Admission::Application)?;
        Ok(DeviceCall::new(local, remote))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        if let Some(session) = self.inner.session.swap(None) {
            session.close();
        }
        self.inner.release_guard();
    }
}

// ── Internals shared with the supervisor and sync ────────────────

impl ClientInner {
    /// Queue a platform task for [`Client::receive`].
    pub(crate) fn enqueue_task(&self, msg: Message) {
        let depth = self.queued_tasks.fetch_add(1, Ordering::AcqRel) + 1;
        if self.tasks_tx.send(msg).is_err() {
            self.queued_tasks.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        if at_high_water(depth) {
            warn!(depth, "Platform tasks are piling up, is the application receiving them?");
        }
    }

    fn dequeued(&self, msg: Option<Message>) -> Option<Message> {
        if msg.is_some() {
            self.queued_tasks.fetch_sub(1, Ordering::AcqRel);
        }
        msg
    }

    pub(crate) fn hub_device_id(&self, device_id: &str) -> String {
        format!("{}-{device_id}", self.device_id_prefix)
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Connected)
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next.clone());
        if prev != next {
            debug!(from = ?prev, to = ?next, "Connection state changed");
        }
    }

    fn release_guard(&self) {
        self.guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Dispatch a notification on the blocking pool, fire-and-forget.
    pub(crate) fn notify_connect(&self) {
        self.notify(&self.on_connect, "connect");
    }

    pub(crate) fn notify_disconnect(&self) {
        self.notify(&self.on_disconnect, "disconnect");
    }

    fn notify(&self, slot: &RwLock<Option<Notification>>, which: &'static str) {
        let callback = slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            debug!(which, "Dispatching notification");
            drop(self.runtime.spawn_blocking(move || callback()));
        }
    }

    /// Register `msg` in the correlation table and hand it to the session.
    pub(crate) fn call(
        &self,
        msg: Message,
        timeout: Duration,
        admission: Admission,
    ) -> Result<PendingCall, CoreError> {
        let id = msg.id.clone();
        let not_sent =
            |reason: &str| PendingCall::settled(id.clone(), Outcome::NotSent(reason.into()), self.runtime.clone());

        if admission == Admission::Application && !self.is_connected() {
            debug!(correlation_id = %id, "Not connected, call not sent");
            return Ok(not_sent("not connected"));
        }
        let Some(session) = self.session.load_full() else {
            return Ok(not_sent("no session"));
        };

        let deadline = Instant::now() + timeout;
        let rx = self.table.register(&id, deadline)?;

        if let Err(e) = session.send(&msg) {
            debug!(correlation_id = %id, error = %e, "Send failed");
            self.table.cancel(&id, &e.to_string());
            return Ok(not_sent(&e.to_string()));
        }

        Ok(PendingCall::waiting(
            id,
            rx,
            deadline,
            Arc::clone(&self.table),
            self.runtime.clone(),
        ))
    }

    /// Wrap `call` so `after` sees the outcome before the caller does.
    fn relay<F>(&self, call: PendingCall, after: F) -> PendingCall
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = call.id().to_owned();
        self.runtime.spawn(async move {
            let outcome = call.wait().await;
            after(&outcome);
            let _ = tx.send(outcome);
        });
        PendingCall::relayed(id, rx, self.runtime.clone())
    }

    /// `put_device` for `device`, recording the result in the sync records.
    pub(crate) fn put_device(
        self: &Arc<Self>,
        device: &Device,
        timeout: Duration,
        admission: Admission,
    ) -> Result<PendingCall, CoreError> {
        let payload = serde_json::to_string(&device.registration_payload())
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        let msg = Message::request(Method::PutDevice, payload);
        let call = self.call(msg, timeout, admission)?;

        let inner = Arc::clone(self);
        let device_id = device.id().to_owned();
        let hash = device.hash().to_owned();
        Ok(self.relay(call, move |outcome| {
            if outcome.is_success() {
                inner
                    .sync_records
                    .insert(device_id, SyncRecord::Registered { hash });
            } else {
                debug!(device_id = %device_id, "Registration not confirmed");
                inner
                    .sync_records
                    .entry(device_id)
                    .or_insert(SyncRecord::NotRegistered);
            }
        }))
    }

    /// `disconnect_device` / `delete_device` for `device_id`. A failure
    /// leaves a pending record that the next synchronization retries.
    pub(crate) fn remove_remote(
        self: &Arc<Self>,
        device_id: &str,
        method: Method,
        timeout: Duration,
        admission: Admission,
    ) -> Result<PendingCall, CoreError> {
        let payload = serde_json::json!({ "id": device_id }).to_string();
        let msg = Message::request(method, payload);
        let call = self.call(msg, timeout, admission)?;

        let inner = Arc::clone(self);
        let device_id = device_id.to_owned();
        Ok(self.relay(call, move |outcome| {
            if outcome.is_success() {
                inner.sync_records.remove(&device_id);
            } else {
                let pending = if method == Method::DeleteDevice {
                    SyncRecord::DeletePending
                } else {
                    SyncRecord::DisconnectPending
                };
                debug!(device_id = %device_id, record = ?pending, "Removal not confirmed");
                inner.sync_records.insert(device_id, pending);
            }
        }))
    }
}

fn at_high_water(depth: usize) -> bool {
    depth > 0 && depth % TASK_QUEUE_WARN == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_queue_warns_at_each_high_water_mark() {
        assert!(!at_high_water(0));
        assert!(!at_high_water(TASK_QUEUE_WARN - 1));
        assert!(at_high_water(TASK_QUEUE_WARN));
        assert!(!at_high_water(TASK_QUEUE_WARN + 1));
        assert!(at_high_water(TASK_QUEUE_WARN * 3));
    }
}
