use std::collections::{HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use futures::Stream;
use session_runtime_error::RuntimeError;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::SseEvent;
use crate::config::{CloseBehavior, HubConfig};

/// Runs once a subscriber is registered; can queue a welcome event with
/// [`SubscriberHandle::try_emit`].
pub type ConnectHook = Arc<dyn Fn(&SubscriberHandle) + Send + Sync>;
/// Runs exactly once per subscriber, whichever path closed it.
pub type DisconnectHook = Arc<dyn Fn(&SubscriberHandle, CloseReason) + Send + Sync>;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the server, or replaced by a newer connection with the same
    /// client id.
    Server,
    /// The client dropped its stream.
    Client,
    /// A write timed out.
    WriteFailure,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
            Self::WriteFailure => "write_failure",
        }
    }
}

struct Subscriber {
    client_id: String,
    session_id: Option<String>,
    state: AtomicU8,
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
    heartbeat: CancellationToken,
    hub: Weak<HubInner>,
    write_timeout: Duration,
    close_behavior: CloseBehavior,
}

/// Shared handle to one registered subscriber.
#[derive(Clone)]
pub struct SubscriberHandle {
    subscriber: Arc<Subscriber>,
}

impl fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberHandle")
            .field("client_id", &self.subscriber.client_id)
            .field("session_id", &self.subscriber.session_id)
            .field("state", &self.state())
            .finish()
    }
}

impl SubscriberHandle {
    pub fn client_id(&self) -> &str {
        &self.subscriber.client_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.subscriber.session_id.as_deref()
    }

    pub fn state(&self) -> SubscriberState {
        match self.subscriber.state.load(Ordering::Acquire) {
            OPEN => SubscriberState::Open,
            CLOSING => SubscriberState::Closing,
            _ => SubscriberState::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() != SubscriberState::Open
    }

    /// Queues `event`, waiting at most the hub's write timeout for buffer
    /// space. A timed-out write closes the subscriber.
    pub async fn emit(&self, event: &SseEvent) -> Result<(), RuntimeError> {
        let sender = self.open_sender()?;
        let permit =
            match tokio::time::timeout(self.subscriber.write_timeout, sender.reserve()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    self.close_with(CloseReason::Client);
                    return Err(closed_error());
                }
                Err(_) => {
                    tracing::warn!(
                        client_id = %self.client_id(),
                        "stream write timed out; closing subscriber"
                    );
                    self.close_with(CloseReason::WriteFailure);
                    return Err(RuntimeError::timeout(format!(
                        "write to stream client {} timed out",
                        self.client_id()
                    )));
                }
            };

        // Close takes this lock before dropping the sender, so nothing is
        // written once it has run.
        let slot = self
            .subscriber
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            return Err(closed_error());
        }
        permit.send(event.to_bytes());
        Ok(())
    }

    pub async fn emit_data(&self, data: impl Into<String>) -> Result<(), RuntimeError> {
        self.emit(&SseEvent::data(data)).await
    }

    pub async fn emit_event(
        &self,
        event_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        self.emit(&SseEvent::typed(event_type, data)).await
    }

    /// Non-blocking emit; a full buffer is reported as a timeout without
    /// closing the subscriber.
    pub fn try_emit(&self, event: &SseEvent) -> Result<(), RuntimeError> {
        let slot = self
            .subscriber
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = slot.as_ref() else {
            return Err(closed_error());
        };
        match sender.try_send(event.to_bytes()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RuntimeError::timeout(format!(
                "stream client {} buffer full",
                self.client_id()
            ))),
            Err(TrySendError::Closed(_)) => {
                drop(slot);
                self.close_with(CloseReason::Client);
                Err(closed_error())
            }
        }
    }

    /// Idempotent.
    pub fn close(&self) {
        self.close_with(CloseReason::Server);
    }

    fn open_sender(&self) -> Result<mpsc::Sender<Bytes>, RuntimeError> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.subscriber
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(closed_error)
    }

    fn close_with(&self, reason: CloseReason) {
        let subscriber = &self.subscriber;
        if subscriber
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        subscriber.heartbeat.cancel();

        let sender = subscriber
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            if reason == CloseReason::Server && subscriber.close_behavior == CloseBehavior::Signal {
                if sender.try_send(SseEvent::close(reason.as_str()).to_bytes()).is_err() {
                    tracing::debug!(client_id = %subscriber.client_id, "close event dropped");
                }
            }
        }
        subscriber.state.store(CLOSED, Ordering::Release);

        tracing::info!(
            client_id = %subscriber.client_id,
            session_id = ?subscriber.session_id,
            reason = ?reason,
            "stream subscriber disconnected"
        );
        if let Some(hub) = subscriber.hub.upgrade() {
            hub.unregister(subscriber);
            let hook = hub
                .on_disconnect
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(hook) = hook {
                hook(self, reason);
            }
        }
    }
}

fn closed_error() -> RuntimeError {
    RuntimeError::closed("stream connection")
}

/// Framed outbound events for one subscriber. Dropping it closes the
/// subscriber.
pub struct SubscriberStream {
    inner: ReceiverStream<Bytes>,
    handle: SubscriberHandle,
}

impl SubscriberStream {
    pub fn handle(&self) -> &SubscriberHandle {
        &self.handle
    }
}

impl fmt::Debug for SubscriberStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberStream")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Stream for SubscriberStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for SubscriberStream {
    fn drop(&mut self) {
        self.handle.close_with(CloseReason::Client);
    }
}

#[derive(Default)]
struct Registry {
    clients: HashMap<String, Arc<Subscriber>>,
    sessions: HashMap<String, HashSet<String>>,
}

impl Registry {
    fn unindex(&mut self, session_id: Option<&str>, client_id: &str) {
        let Some(session_id) = session_id else {
            return;
        };
        let now_empty = match self.sessions.get_mut(session_id) {
            Some(clients) => {
                clients.remove(client_id);
                clients.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.sessions.remove(session_id);
        }
    }
}

struct HubInner {
    config: HubConfig,
    registry: RwLock<Registry>,
    on_connect: RwLock<Option<ConnectHook>>,
    on_disconnect: RwLock<Option<DisconnectHook>>,
    closed: AtomicBool,
    next_client: AtomicU64,
}

impl HubInner {
    fn registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes `subscriber` unless a newer connection already took its id.
    fn unregister(&self, subscriber: &Arc<Subscriber>) {
        let mut registry = self.registry_mut();
        let is_current = registry
            .clients
            .get(&subscriber.client_id)
            .is_some_and(|current| Arc::ptr_eq(current, subscriber));
        if is_current {
            registry.clients.remove(&subscriber.client_id);
            registry.unindex(subscriber.session_id.as_deref(), &subscriber.client_id);
        }
    }
}

/// Registry of live subscribers, indexed by client id and by session.
#[derive(Clone)]
pub struct StreamHub {
    inner: Arc<HubInner>,
}

impl fmt::Debug for StreamHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHub")
            .field("clients", &self.client_count())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl StreamHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                registry: RwLock::new(Registry::default()),
                on_connect: RwLock::new(None),
                on_disconnect: RwLock::new(None),
                closed: AtomicBool::new(false),
                next_client: AtomicU64::new(1),
            }),
        }
    }

    pub fn set_on_connect(&self, hook: ConnectHook) {
        *self
            .inner
            .on_connect
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn set_on_disconnect(&self, hook: DisconnectHook) {
        *self
            .inner
            .on_disconnect
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Registers a subscriber, optionally bound to a session. An existing
    /// subscriber with the same client id is closed and replaced. A missing
    /// client id gets a generated one.
    pub fn connect(
        &self,
        client_id: Option<String>,
        session_id: Option<String>,
    ) -> Result<(SubscriberHandle, SubscriberStream), RuntimeError> {
        if self.is_closed() {
            return Err(RuntimeError::closed("stream hub"));
        }
        let config = &self.inner.config;
        let client_id = client_id.filter(|id| !id.is_empty()).unwrap_or_else(|| {
            format!(
                "client-{}",
                self.inner.next_client.fetch_add(1, Ordering::Relaxed)
            )
        });
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let heartbeat = CancellationToken::new();
        let handle = SubscriberHandle {
            subscriber: Arc::new(Subscriber {
                client_id: client_id.clone(),
                session_id: session_id.clone(),
                state: AtomicU8::new(OPEN),
                sender: Mutex::new(Some(tx)),
                heartbeat: heartbeat.clone(),
                hub: Arc::downgrade(&self.inner),
                write_timeout: config.write_timeout,
                close_behavior: config.close_behavior,
            }),
        };

        let replaced = {
            let mut registry = self.inner.registry_mut();
            let replaced = registry
                .clients
                .insert(client_id.clone(), handle.subscriber.clone());
            if let Some(old) = &replaced {
                registry.unindex(old.session_id.as_deref(), &old.client_id);
            }
            if let Some(session_id) = &session_id {
                registry
                    .sessions
                    .entry(session_id.clone())
                    .or_default()
                    .insert(client_id.clone());
            }
            replaced
        };
        if let Some(old) = replaced {
            tracing::info!(client_id = %client_id, "replacing existing stream subscriber");
            SubscriberHandle { subscriber: old }.close();
        }

        if !config.heartbeat_interval.is_zero() {
            spawn_heartbeat(
                Arc::downgrade(&handle.subscriber),
                config.heartbeat_interval,
                heartbeat,
            );
        }
        tracing::info!(
            client_id = %client_id,
            session_id = ?session_id,
            "stream subscriber connected"
        );

        let hook = self
            .inner
            .on_connect
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(&handle);
        }

        let stream = SubscriberStream {
            inner: ReceiverStream::new(rx),
            handle: handle.clone(),
        };
        // Lost a race with `close`.
        if self.is_closed() {
            handle.close();
        }
        Ok((handle, stream))
    }

    pub fn client(&self, client_id: &str) -> Option<SubscriberHandle> {
        self.inner
            .registry()
            .clients
            .get(client_id)
            .cloned()
            .map(|subscriber| SubscriberHandle { subscriber })
    }

    pub async fn send_to_client(
        &self,
        client_id: &str,
        event: &SseEvent,
    ) -> Result<(), RuntimeError> {
        let handle = self
            .client(client_id)
            .ok_or_else(|| RuntimeError::ClientNotFound {
                client_id: client_id.to_string(),
            })?;
        handle.emit(event).await
    }

    /// Returns how many subscribers accepted the event.
    pub async fn broadcast_to_session(&self, session_id: &str, event: &SseEvent) -> usize {
        let targets = {
            let registry = self.inner.registry();
            registry
                .sessions
                .get(session_id)
                .map(|clients| {
                    clients
                        .iter()
                        .filter_map(|client_id| registry.clients.get(client_id).cloned())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };
        deliver(targets, event).await
    }

    pub async fn broadcast(&self, event: &SseEvent) -> usize {
        let targets = self
            .inner
            .registry()
            .clients
            .values()
            .cloned()
            .collect::<Vec<_>>();
        deliver(targets, event).await
    }

    pub fn client_count(&self) -> usize {
        self.inner.registry().clients.len()
    }

    pub fn session_client_count(&self, session_id: &str) -> usize {
        self.inner
            .registry()
            .sessions
            .get(session_id)
            .map_or(0, HashSet::len)
    }

    pub fn disconnect(&self, client_id: &str) -> Result<(), RuntimeError> {
        let handle = self
            .client(client_id)
            .ok_or_else(|| RuntimeError::ClientNotFound {
                client_id: client_id.to_string(),
            })?;
        handle.close();
        Ok(())
    }

    /// Closes every subscriber; the hub keeps accepting connections.
    pub fn close_all(&self) -> usize {
        let subscribers = self
            .inner
            .registry()
            .clients
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let count = subscribers.len();
        for subscriber in subscribers {
            SubscriberHandle { subscriber }.close();
        }
        count
    }

    /// Closes every subscriber and rejects further connections. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let closed = self.close_all();
        tracing::info!(closed, "stream hub closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

async fn deliver(targets: Vec<Arc<Subscriber>>, event: &SseEvent) -> usize {
    let results = join_all(
        targets
            .into_iter()
            .map(|subscriber| async move { SubscriberHandle { subscriber }.emit(event).await }),
    )
    .await;
    results.iter().filter(|result| result.is_ok()).count()
}

fn spawn_heartbeat(subscriber: Weak<Subscriber>, period: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(subscriber) = subscriber.upgrade() else {
                        break;
                    };
                    let handle = SubscriberHandle { subscriber };
                    if let Err(err) = handle.emit(&SseEvent::ping()).await {
                        tracing::warn!(
                            client_id = %handle.client_id(),
                            error = %err,
                            "heartbeat failed"
                        );
                        break;
                    }
                }
            }
        }
    });
}
