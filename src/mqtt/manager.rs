//! Connection manager: owns the single broker session
//!
//! `Disconnected -> Connecting -> Connected`, back to `Disconnected` on any
//! failure or explicit disconnect. Once connected, link loss is reported only
//! through the status callback; when the transport restores the link the
//! active subscription is re-issued before the next inbound event is read.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config;
use crate::error::{ConnectError, PublishError, SubscribeError};

use super::session::{EventSource, SessionEvent, SessionHandle, SessionOptions, Transport};

/// Re-subscribe attempts per link restore before waiting for the next one
const RESUBSCRIBE_ATTEMPTS: u32 = 3;

/// First re-subscribe retry delay; doubles with each attempt
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

/// Time the delivery task gets to flush a disconnect before it is aborted
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Bounded waits for the blocking operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub subscribe: Duration,
    pub publish: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(20),
            subscribe: Duration::from_secs(10),
            publish: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type MessageCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
type StatusCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Whoever asked for a pending SubAck
enum AckWaiter {
    Caller(oneshot::Sender<bool>),
    Resubscribe { epoch: u64 },
}

struct PendingAck {
    id: u64,
    waiter: AckWaiter,
}

/// Withdraws a queued waiter unless its request actually went out
struct QueuedAck<'a> {
    shared: &'a Shared,
    id: u64,
    sent: bool,
}

impl Drop for QueuedAck<'_> {
    fn drop(&mut self) {
        if !self.sent {
            let id = self.id;
            self.shared.pending_acks.lock().retain(|p| p.id != id);
        }
    }
}

/// State shared between the manager and its delivery task
struct Shared {
    state: watch::Sender<ConnectionState>,
    handle: RwLock<Option<Arc<dyn SessionHandle>>>,
    /// Filter to re-issue after a reconnect
    subscription: RwLock<Option<String>>,
    /// SubAck waiters in request order; the broker answers in that order
    pending_acks: Mutex<VecDeque<PendingAck>>,
    next_ack_id: AtomicU64,
    /// Held from queuing a waiter until its request is handed to the session
    subscribe_order: tokio::sync::Mutex<()>,
    on_message: RwLock<Option<MessageCallback>>,
    on_status: RwLock<Option<StatusCallback>>,
    /// Bumped on every connect/teardown; stale tasks compare and bail out
    generation: AtomicU64,
    /// Bumped on every ConnAck; re-subscribe retries belong to one link
    link_epoch: AtomicU64,
    resubscribe_failures: AtomicU32,
    /// Pending re-subscribe retry of the current link
    retry: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn is_link_current(&self, epoch: u64) -> bool {
        self.link_epoch.load(Ordering::SeqCst) == epoch
    }

    /// Queue `waiter` for the next unanswered SubAck and send the request
    async fn request_subscribe(
        &self,
        handle: &dyn SessionHandle,
        filter: &str,
        waiter: AckWaiter,
    ) -> Result<(), SubscribeError> {
        let _order = self.subscribe_order.lock().await;
        let id = self.next_ack_id.fetch_add(1, Ordering::SeqCst);
        self.pending_acks.lock().push_back(PendingAck { id, waiter });
        let mut queued = QueuedAck {
            shared: self,
            id,
            sent: false,
        };

        handle.subscribe(filter).await?;
        queued.sent = true;
        Ok(())
    }

    fn next_ack_waiter(&self) -> Option<AckWaiter> {
        self.pending_acks.lock().pop_front().map(|p| p.waiter)
    }

    /// A dead link never answers; dropping a caller's sender fails its wait
    fn drop_ack_waiters(&self) {
        self.pending_acks.lock().clear();
    }

    fn take_retry(&self) -> Option<JoinHandle<()>> {
        self.retry.lock().take()
    }

    /// Update the state and fire the status callback when the connected flag flips
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        let was_connected = previous == ConnectionState::Connected;
        let connected = next == ConnectionState::Connected;
        if was_connected == connected {
            return;
        }

        let callback = self.on_status.read().clone();
        if let Some(callback) = callback {
            callback(connected);
        }
    }
}

/// Owns one MQTT session at a time
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    timeouts: Timeouts,
    shared: Arc<Shared>,
    /// Delivery task of the live session; the lock also serializes
    /// connect/disconnect
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, timeouts: Timeouts) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            timeouts,
            shared: Arc::new(Shared {
                state,
                handle: RwLock::new(None),
                subscription: RwLock::new(None),
                pending_acks: Mutex::new(VecDeque::new()),
                next_ack_id: AtomicU64::new(0),
                subscribe_order: tokio::sync::Mutex::new(()),
                on_message: RwLock::new(None),
                on_status: RwLock::new(None),
                generation: AtomicU64::new(0),
                link_epoch: AtomicU64::new(0),
                resubscribe_failures: AtomicU32::new(0),
                retry: Mutex::new(None),
            }),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    /// Register the inbound message callback, replacing any previous one.
    ///
    /// Runs on the delivery task; a slow callback delays further delivery.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        *self.shared.on_message.write() = Some(Arc::new(callback));
    }

    /// Register the connection status callback, replacing any previous one
    pub fn on_status<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        *self.shared.on_status.write() = Some(Arc::new(callback));
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Open a new session and wait for the broker to accept it.
    ///
    /// Any previous session is released first. On failure the manager is
    /// left Disconnected with no session.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        client_id_hint: &str,
    ) -> Result<(), ConnectError> {
        let mut worker = self.worker.lock().await;
        *self.shared.subscription.write() = None;
        self.teardown(&mut worker).await;

        let options = SessionOptions {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
            client_id: config::client_id(client_id_hint),
        };
        info!(
            "Connecting to MQTT broker at {}:{} as {}",
            host, port, options.client_id
        );
        let session = self.transport.open(&options)?;

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.set_state(ConnectionState::Connecting);
        *self.shared.handle.write() = Some(Arc::clone(&session.handle));

        let (ready_tx, ready_rx) = oneshot::channel();
        *worker = Some(tokio::spawn(run_delivery(
            Arc::clone(&self.shared),
            session.handle,
            session.events,
            ready_tx,
            generation,
        )));

        let outcome = match timeout(self.timeouts.connect, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectError::Unreachable(
                "session ended before acknowledgement".to_string(),
            )),
            Err(_) => Err(ConnectError::Timeout),
        };

        if let Err(e) = &outcome {
            warn!("Connection to {}:{} failed: {}", host, port, e);
            self.teardown(&mut worker).await;
        }
        outcome
    }

    /// Subscribe and wait for the broker's acknowledgement.
    ///
    /// Once granted, the filter becomes the active subscription re-issued
    /// after reconnects; a failed call leaves the previous one in place.
    pub async fn subscribe(&self, filter: &str) -> Result<(), SubscribeError> {
        if !self.is_connected() {
            return Err(SubscribeError::NotConnected);
        }
        let handle = self
            .shared
            .handle
            .read()
            .clone()
            .ok_or(SubscribeError::NotConnected)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        info!("Subscribing to {}", filter);

        let shared = &self.shared;
        let outcome = timeout(self.timeouts.subscribe, async move {
            shared
                .request_subscribe(handle.as_ref(), filter, AckWaiter::Caller(ack_tx))
                .await?;
            match ack_rx.await {
                Ok(true) => Ok(()),
                Ok(false) => Err(SubscribeError::Rejected(filter.to_string())),
                Err(_) => Err(SubscribeError::NotConnected),
            }
        })
        .await
        .unwrap_or(Err(SubscribeError::Timeout));

        if outcome.is_ok() {
            *self.shared.subscription.write() = Some(filter.to_string());
        }
        outcome
    }

    /// Publish immediately; nothing is queued while disconnected.
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        let handle = self
            .shared
            .handle
            .read()
            .clone()
            .ok_or(PublishError::NotConnected)?;

        timeout(self.timeouts.publish, handle.publish(topic, payload))
            .await
            .unwrap_or(Err(PublishError::Timeout))
    }

    /// Release the session. Safe to call in any state.
    pub async fn disconnect(&self) {
        let mut worker = self.worker.lock().await;
        *self.shared.subscription.write() = None;
        let had_session = worker.is_some();
        self.teardown(&mut worker).await;
        if had_session {
            info!("Disconnected from MQTT broker");
        }
    }

    /// Close the session and stop its delivery task; ends Disconnected
    async fn teardown(&self, worker: &mut Option<JoinHandle<()>>) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.drop_ack_waiters();

        if let Some(retry) = self.shared.take_retry() {
            retry.abort();
            let _ = retry.await;
        }

        let handle = self.shared.handle.write().take();
        if let Some(handle) = handle {
            handle.close().await;
        }

        if let Some(mut task) = worker.take() {
            if timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
                let _ = task.await;
            }
        }

        self.shared.set_state(ConnectionState::Disconnected);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.worker.get_mut().take() {
            task.abort();
        }
        if let Some(retry) = self.shared.take_retry() {
            retry.abort();
        }
    }
}

/// Delivery task: drives the session's events in arrival order
async fn run_delivery(
    shared: Arc<Shared>,
    handle: Arc<dyn SessionHandle>,
    mut events: Box<dyn EventSource>,
    ready: oneshot::Sender<Result<(), ConnectError>>,
    generation: u64,
) {
    let mut ready = Some(ready);

    loop {
        let event = events.next_event().await;
        if !shared.is_current(generation) {
            debug!("Session superseded, stopping delivery");
            return;
        }

        match event {
            SessionEvent::Connected => {
                let epoch = shared.link_epoch.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(retry) = shared.take_retry() {
                    retry.abort();
                }
                shared.drop_ack_waiters();
                shared.resubscribe_failures.store(0, Ordering::SeqCst);
                shared.set_state(ConnectionState::Connected);
                match ready.take() {
                    Some(ready) => {
                        info!("Connected to MQTT broker");
                        let _ = ready.send(Ok(()));
                    }
                    None => {
                        info!("Reconnected to MQTT broker");
                        resubscribe(&shared, &handle, epoch).await;
                    }
                }
            }
            SessionEvent::Refused(reason) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(reason));
                    return;
                }
                warn!("Broker refused reconnection: {}", reason);
                shared.set_state(ConnectionState::Disconnected);
            }
            SessionEvent::LinkLost(reason) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(ConnectError::Unreachable(reason)));
                    return;
                }
                if shared.state() == ConnectionState::Connected {
                    warn!("Lost connection to MQTT broker: {}", reason);
                } else {
                    debug!("Reconnect attempt failed: {}", reason);
                }
                shared.drop_ack_waiters();
                shared.set_state(ConnectionState::Disconnected);
            }
            SessionEvent::SubAck { granted } => match shared.next_ack_waiter() {
                Some(AckWaiter::Caller(waiter)) => {
                    let _ = waiter.send(granted);
                }
                Some(AckWaiter::Resubscribe { .. }) if granted => {
                    debug!("Re-subscription acknowledged")
                }
                Some(AckWaiter::Resubscribe { epoch }) => {
                    warn!("Broker refused re-subscription");
                    schedule_resubscribe(&shared, &handle, epoch);
                }
                None => debug!("Ignoring unsolicited SubAck"),
            },
            SessionEvent::Message { topic, payload } => {
                if shared.state() != ConnectionState::Connected {
                    debug!("Dropping message on {} received while not connected", topic);
                    continue;
                }
                debug!("Received message on {}: {}", topic, payload);
                let callback = shared.on_message.read().clone();
                if let Some(callback) = callback {
                    callback(&topic, &payload);
                }
            }
        }
    }
}

/// Re-issue the active subscription after the link came back
async fn resubscribe(shared: &Arc<Shared>, handle: &Arc<dyn SessionHandle>, epoch: u64) {
    let filter = shared.subscription.read().clone();
    let Some(filter) = filter else {
        return;
    };

    info!("Re-subscribing to {}", filter);
    if let Err(e) = shared
        .request_subscribe(handle.as_ref(), &filter, AckWaiter::Resubscribe { epoch })
        .await
    {
        warn!("Re-subscribe to {} failed: {}", filter, e);
        schedule_resubscribe(shared, handle, epoch);
    }
}

/// Retry the re-subscription later with exponential backoff, up to
/// [`RESUBSCRIBE_ATTEMPTS`] times per link restore. The retry is dropped once
/// the link restarts or the session is torn down.
fn schedule_resubscribe(shared: &Arc<Shared>, handle: &Arc<dyn SessionHandle>, epoch: u64) {
    if !shared.is_link_current(epoch) {
        return;
    }
    let attempt = shared.resubscribe_failures.fetch_add(1, Ordering::SeqCst) + 1;
    if attempt > RESUBSCRIBE_ATTEMPTS {
        error!(
            "Re-subscription failed {} times, waiting for the next reconnect",
            RESUBSCRIBE_ATTEMPTS
        );
        return;
    }

    let delay = RESUBSCRIBE_BACKOFF * 2u32.pow(attempt - 1);
    let task = {
        let shared = Arc::clone(shared);
        let handle = Arc::clone(handle);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !shared.is_link_current(epoch) || shared.state() != ConnectionState::Connected {
                return;
            }
            let filter = shared.subscription.read().clone();
            let Some(filter) = filter else {
                return;
            };

            info!("Re-subscribing to {} (attempt {})", filter, attempt + 1);
            if let Err(e) = shared
                .request_subscribe(handle.as_ref(), &filter, AckWaiter::Resubscribe { epoch })
                .await
            {
                warn!("Re-subscribe to {} failed: {}", filter, e);
                schedule_resubscribe(&shared, &handle, epoch);
            }
        })
    };
    // Any earlier retry of this link has already sent its request
    *shared.retry.lock() = Some(task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::mock::MockTransport;
    use tokio::sync::mpsc;

    const FILTER: &str = "power/#";

    fn manager(mock: &MockTransport) -> ConnectionManager {
        ConnectionManager::new(Arc::new(mock.clone()), Timeouts::default())
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for callback")
            .expect("callback channel closed")
    }

    fn status_probe(manager: &ConnectionManager) -> mpsc::UnboundedReceiver<bool> {
        let (tx, rx) = mpsc::unbounded_channel();
        manager.on_status(move |connected| {
            let _ = tx.send(connected);
        });
        rx
    }

    fn message_probe(
        manager: &ConnectionManager,
        mock: &MockTransport,
    ) -> mpsc::UnboundedReceiver<(String, String)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let journal = mock.clone();
        manager.on_message(move |topic, payload| {
            journal.record(format!("message:{}={}", topic, payload));
            let _ = tx.send((topic.to_string(), payload.to_string()));
        });
        rx
    }

    async fn connected(mock: &MockTransport) -> ConnectionManager {
        let manager = manager(mock);
        manager
            .connect("broker.local", 1883, "alice", "pw", "test")
            .await
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn test_connect_reports_status() {
        let mock = MockTransport::new();
        let manager = manager(&mock);
        let mut status = status_probe(&manager);

        manager
            .connect("broker.local", 1883, "alice", "pw", "test")
            .await
            .unwrap();

        assert!(manager.is_connected());
        assert!(recv(&mut status).await);
        let opened = mock.opened().unwrap();
        assert_eq!(opened.host, "broker.local");
        assert_eq!(opened.username, "alice");
        assert!(opened.client_id.starts_with("test-"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_leaves_disconnected() {
        let mock = MockTransport::new();
        mock.configure(|b| b.on_open = None);
        let manager = manager(&mock);

        let result = manager.connect("broker.local", 1883, "alice", "pw", "test").await;

        assert_eq!(result, Err(ConnectError::Timeout));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(mock.journal().contains(&"close".to_string()));
    }

    #[tokio::test]
    async fn test_connect_auth_failure() {
        let mock = MockTransport::new();
        mock.configure(|b| {
            b.on_open = Some(SessionEvent::Refused(ConnectError::AuthFailed(
                "BadUserNamePassword".into(),
            )))
        });
        let manager = manager(&mock);

        let result = manager.connect("broker.local", 1883, "alice", "bad", "test").await;

        assert!(matches!(result, Err(ConnectError::AuthFailed(_))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let mock = MockTransport::new();
        mock.configure(|b| b.on_open = Some(SessionEvent::LinkLost("connection refused".into())));
        let manager = manager(&mock);

        let result = manager.connect("nowhere", 1883, "alice", "pw", "test").await;

        assert_eq!(
            result,
            Err(ConnectError::Unreachable("connection refused".into()))
        );
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_publish_and_subscribe_require_connection() {
        let mock = MockTransport::new();
        let manager = manager(&mock);

        assert_eq!(
            manager.publish("power/a/outlets/1/set", "1").await,
            Err(PublishError::NotConnected)
        );
        assert_eq!(
            manager.subscribe(FILTER).await,
            Err(SubscribeError::NotConnected)
        );
        assert!(mock.journal().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let mock = MockTransport::new();
        let manager = connected(&mock).await;

        manager.subscribe(FILTER).await.unwrap();
        manager
            .publish("power/office-strip/outlets/1/set", "0")
            .await
            .unwrap();

        let journal = mock.journal();
        assert!(journal.contains(&format!("subscribe:{}", FILTER)));
        assert!(journal.contains(&"publish:power/office-strip/outlets/1/set=0".to_string()));
    }

    #[tokio::test]
    async fn test_subscribe_rejected() {
        let mock = MockTransport::new();
        mock.configure(|b| b.suback = Some(false));
        let manager = connected(&mock).await;

        assert_eq!(
            manager.subscribe(FILTER).await,
            Err(SubscribeError::Rejected(FILTER.to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_timeout() {
        let mock = MockTransport::new();
        mock.configure(|b| b.suback = None);
        let manager = connected(&mock).await;

        assert_eq!(manager.subscribe(FILTER).await, Err(SubscribeError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_timeout() {
        let mock = MockTransport::new();
        mock.configure(|b| b.stall_publish = true);
        let manager = connected(&mock).await;

        assert_eq!(
            manager.publish("power/a/outlets/1/set", "1").await,
            Err(PublishError::Timeout)
        );
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_before_next_message() {
        let mock = MockTransport::new();
        let manager = manager(&mock);
        let mut status = status_probe(&manager);
        let mut messages = message_probe(&manager, &mock);

        manager
            .connect("broker.local", 1883, "alice", "pw", "test")
            .await
            .unwrap();
        manager.subscribe(FILTER).await.unwrap();
        assert!(recv(&mut status).await);

        mock.emit(SessionEvent::LinkLost("broker restarted".into()));
        assert!(!recv(&mut status).await);
        assert!(!manager.is_connected());

        mock.emit(SessionEvent::Connected);
        mock.emit(SessionEvent::Message {
            topic: "power/office-strip/outlets/1".into(),
            payload: "1".into(),
        });
        assert!(recv(&mut status).await);
        recv(&mut messages).await;

        let journal = mock.journal();
        let subscribes: Vec<usize> = journal
            .iter()
            .enumerate()
            .filter(|(_, e)| *e == &format!("subscribe:{}", FILTER))
            .map(|(i, _)| i)
            .collect();
        let message = journal
            .iter()
            .position(|e| e.starts_with("message:"))
            .unwrap();
        assert_eq!(subscribes.len(), 2);
        assert!(subscribes[1] < message);
    }

    #[tokio::test]
    async fn test_messages_dropped_while_link_down() {
        let mock = MockTransport::new();
        let manager = connected(&mock).await;
        let mut messages = message_probe(&manager, &mock);
        let mut state = manager.watch_state();

        mock.emit(SessionEvent::LinkLost("gone".into()));
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        mock.emit(SessionEvent::Message {
            topic: "power/a/outlets/1".into(),
            payload: "stale".into(),
        });
        mock.emit(SessionEvent::Connected);
        mock.emit(SessionEvent::Message {
            topic: "power/a/outlets/1".into(),
            payload: "fresh".into(),
        });

        let (_, payload) = recv(&mut messages).await;
        assert_eq!(payload, "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_resubscribe_retries_with_backoff() {
        let mock = MockTransport::new();
        let manager = connected(&mock).await;
        manager.subscribe(FILTER).await.unwrap();
        let mut state = manager.watch_state();

        mock.configure(|b| b.subscribe_failures = 2);
        mock.emit(SessionEvent::LinkLost("gone".into()));
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        mock.emit(SessionEvent::Connected);
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        // 1s + 2s of backoff
        tokio::time::sleep(Duration::from_secs(4)).await;

        let journal = mock.journal();
        let failed = journal
            .iter()
            .filter(|e| e.starts_with("subscribe-failed:"))
            .count();
        let succeeded = journal
            .iter()
            .filter(|e| *e == &format!("subscribe:{}", FILTER))
            .count();
        assert_eq!(failed, 2);
        assert_eq!(succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_gives_up_after_bounded_attempts() {
        let mock = MockTransport::new();
        let manager = connected(&mock).await;
        manager.subscribe(FILTER).await.unwrap();
        let mut state = manager.watch_state();

        mock.configure(|b| b.subscribe_failures = 100);
        mock.emit(SessionEvent::LinkLost("gone".into()));
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        mock.emit(SessionEvent::Connected);
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;

        let failed = mock
            .journal()
            .iter()
            .filter(|e| e.starts_with("subscribe-failed:"))
            .count();
        assert_eq!(failed, 1 + RESUBSCRIBE_ATTEMPTS as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_retry_does_not_fire_after_next_restore() {
        let mock = MockTransport::new();
        let manager = connected(&mock).await;
        manager.subscribe(FILTER).await.unwrap();
        let mut state = manager.watch_state();

        // First restore fails its re-subscribe and schedules a retry at 1s
        mock.configure(|b| b.subscribe_failures = 1);
        mock.emit(SessionEvent::LinkLost("gone".into()));
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        mock.emit(SessionEvent::Connected);
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        // Second restore lands before the retry is due
        mock.emit(SessionEvent::LinkLost("gone again".into()));
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        mock.emit(SessionEvent::Connected);
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;

        let journal = mock.journal();
        let subscribes = journal.iter().filter(|e| e.starts_with("subscribe:")).count();
        let failed = journal
            .iter()
            .filter(|e| e.starts_with("subscribe-failed:"))
            .count();
        assert_eq!(subscribes, 2);
        assert_eq!(failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let mock = MockTransport::new();
        let manager = connected(&mock).await;
        manager.subscribe(FILTER).await.unwrap();
        let mut state = manager.watch_state();

        mock.configure(|b| b.subscribe_failures = 1);
        mock.emit(SessionEvent::LinkLost("gone".into()));
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        mock.emit(SessionEvent::Connected);
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        manager.disconnect().await;

        tokio::time::sleep(Duration::from_secs(10)).await;

        let journal = mock.journal();
        let close = journal.iter().position(|e| e == "close").unwrap();
        assert!(journal[close..].iter().all(|e| !e.starts_with("subscribe")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_subscribe_keeps_previous_filter() {
        let mock = MockTransport::new();
        let manager = connected(&mock).await;
        manager.subscribe(FILTER).await.unwrap();

        mock.configure(|b| b.suback = Some(false));
        assert_eq!(
            manager.subscribe("other/#").await,
            Err(SubscribeError::Rejected("other/#".to_string()))
        );
        mock.configure(|b| b.suback = Some(true));

        let mut state = manager.watch_state();
        mock.emit(SessionEvent::LinkLost("gone".into()));
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        mock.emit(SessionEvent::Connected);
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let journal = mock.journal();
        let last = journal
            .iter()
            .rev()
            .find(|e| e.starts_with("subscribe:"))
            .unwrap();
        assert_eq!(last, &format!("subscribe:{}", FILTER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suback_goes_to_the_request_it_answers() {
        let mock = MockTransport::new();
        let manager = Arc::new(connected(&mock).await);
        manager.subscribe(FILTER).await.unwrap();
        let mut state = manager.watch_state();

        // Acks are now sent by hand, in request order
        mock.configure(|b| b.suback = None);
        mock.emit(SessionEvent::LinkLost("gone".into()));
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        mock.emit(SessionEvent::Connected);
        let resubscribe = format!("subscribe:{}", FILTER);
        while mock.journal().iter().filter(|e| **e == resubscribe).count() < 2 {
            tokio::task::yield_now().await;
        }

        let caller = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.subscribe("other/#").await })
        };
        while !mock.journal().contains(&"subscribe:other/#".to_string()) {
            tokio::task::yield_now().await;
        }

        mock.emit(SessionEvent::SubAck { granted: true });
        mock.emit(SessionEvent::SubAck { granted: false });

        assert_eq!(
            caller.await.unwrap(),
            Err(SubscribeError::Rejected("other/#".to_string()))
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mock = MockTransport::new();
        let manager = manager(&mock);
        manager.disconnect().await;

        let mut status = status_probe(&manager);
        manager
            .connect("broker.local", 1883, "alice", "pw", "test")
            .await
            .unwrap();
        assert!(recv(&mut status).await);

        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!recv(&mut status).await);
        assert!(status.try_recv().is_err());
        assert_eq!(
            manager.publish("power/a/outlets/1/set", "1").await,
            Err(PublishError::NotConnected)
        );
        assert_eq!(
            mock.journal().iter().filter(|e| *e == "close").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_disconnect_forgets_subscription() {
        let mock = MockTransport::new();
        let manager = connected(&mock).await;
        manager.subscribe(FILTER).await.unwrap();
        manager.disconnect().await;

        manager
            .connect("broker.local", 1883, "alice", "pw", "test")
            .await
            .unwrap();
        let mut state = manager.watch_state();
        mock.emit(SessionEvent::LinkLost("gone".into()));
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        mock.emit(SessionEvent::Connected);
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        let subscribes = mock
            .journal()
            .iter()
            .filter(|e| e.starts_with("subscribe:"))
            .count();
        assert_eq!(subscribes, 1);
    }

    #[tokio::test]
    async fn test_last_callback_registration_wins() {
        let mock = MockTransport::new();
        let manager = manager(&mock);
        let mut first = status_probe(&manager);
        let mut second = status_probe(&manager);

        manager
            .connect("broker.local", 1883, "alice", "pw", "test")
            .await
            .unwrap();

        assert!(recv(&mut second).await);
        assert!(first.try_recv().is_err());
    }
}
