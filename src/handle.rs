//! The shared live connection: one bidirectional transport plus at most one
//! server-push stream.

use crate::error::ConnectionError;
use dashmap::DashMap;
use livecore::ClientEvent;
use livecore::framing;
use livecore::net::{PushStreamFactory, StreamCloser, Transport, TransportEvent, TransportFactory};
use log::{debug, info, trace, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

/// Raw handler for one server event name.
pub(crate) type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Runs after each successful connect with the new connection epoch.
pub(crate) type ConnectHook = Arc<dyn Fn(u64) + Send + Sync>;

type ConnectWaiter = oneshot::Sender<Result<(), ConnectionError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

enum Phase {
    Idle,
    Connecting(Vec<ConnectWaiter>),
    Connected {
        transport: Arc<dyn Transport>,
        epoch: u64,
    },
    Closed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to an open push stream. Closing it is idempotent. Whoever drains
/// the event receiver closes it once the receiver reports the end, so the
/// transport handle stops counting the stream as open.
#[derive(Clone)]
pub struct StreamHandle {
    closer: Arc<dyn StreamCloser>,
    closed: Arc<AtomicBool>,
}

impl StreamHandle {
    fn new(closer: Arc<dyn StreamCloser>) -> Self {
        Self {
            closer,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closer.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Explicitly constructed live connection, shared by `Arc` between the
/// registry, the router and the client facade.
pub struct TransportHandle {
    factory: Arc<dyn TransportFactory>,
    stream_factory: Arc<dyn PushStreamFactory>,
    phase: Mutex<Phase>,
    epoch: AtomicU64,

    handlers: DashMap<String, EventHandler>,
    registrations: AtomicUsize,
    connect_hooks: Mutex<Vec<ConnectHook>>,

    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    tasks: Mutex<Vec<AbortHandle>>,

    stream: Mutex<Option<StreamHandle>>,
}

impl TransportHandle {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        stream_factory: Arc<dyn PushStreamFactory>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            factory,
            stream_factory,
            phase: Mutex::new(Phase::Idle),
            epoch: AtomicU64::new(0),
            handlers: DashMap::new(),
            registrations: AtomicUsize::new(0),
            connect_hooks: Mutex::new(Vec::new()),
            outbound_tx,
            outbound_rx: Arc::new(tokio::sync::Mutex::new(outbound_rx)),
            tasks: Mutex::new(Vec::new()),
            stream: Mutex::new(None),
        })
    }

    pub fn state(&self) -> HandleState {
        match &*lock(&self.phase) {
            Phase::Idle => HandleState::Idle,
            Phase::Connecting(_) => HandleState::Connecting,
            Phase::Connected { .. } => HandleState::Connected,
            Phase::Closed => HandleState::Closed,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == HandleState::Connected
    }

    /// Epoch of the live connection. Every successful connect gets a new one.
    pub fn connected_epoch(&self) -> Option<u64> {
        match &*lock(&self.phase) {
            Phase::Connected { epoch, .. } => Some(*epoch),
            _ => None,
        }
    }

    /// Registers a hook run after every successful connect, before the
    /// connect callers are woken.
    pub(crate) fn on_connected(&self, hook: ConnectHook) {
        lock(&self.connect_hooks).push(hook);
    }

    /// Connects with a bearer credential. Calls made while an attempt is in
    /// flight wait for that attempt instead of starting another one.
    pub async fn connect(self: &Arc<Self>, credential: &str) -> Result<(), ConnectionError> {
        if credential.trim().is_empty() {
            return Err(ConnectionError::MissingCredential);
        }

        let waiter = {
            let mut phase = lock(&self.phase);
            match &mut *phase {
                Phase::Connected { .. } => return Ok(()),
                Phase::Closed => return Err(ConnectionError::Closed),
                Phase::Connecting(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                Phase::Idle => {
                    *phase = Phase::Connecting(Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            debug!(target: "Sync/Handle", "Joining in-flight connection attempt");
            return rx.await.unwrap_or_else(|_| {
                Err(ConnectionError::Network(
                    "connection attempt was abandoned".to_string(),
                ))
            });
        }

        // Dropping this future mid-attempt must not leave the phase stuck.
        let guard = scopeguard::guard(self.clone(), |handle| {
            let mut phase = lock(&handle.phase);
            if matches!(*phase, Phase::Connecting(_)) {
                *phase = Phase::Idle;
            }
        });

        info!(target: "Sync/Handle", "Connecting transport");
        let result = self.factory.create_transport(credential).await;
        scopeguard::ScopeGuard::into_inner(guard);

        match result {
            Ok((transport, events)) => self.finish_connect(transport, events).await,
            Err(e) => {
                let err = ConnectionError::Network(e.to_string());
                warn!(target: "Sync/Handle", "Connection attempt failed: {err}");
                let waiters = {
                    let mut phase = lock(&self.phase);
                    match std::mem::replace(&mut *phase, Phase::Idle) {
                        Phase::Connecting(waiters) => waiters,
                        other => {
                            *phase = other;
                            Vec::new()
                        }
                    }
                };
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                Err(err)
            }
        }
    }

    async fn finish_connect(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Result<(), ConnectionError> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let waiters = {
            let mut phase = lock(&self.phase);
            match std::mem::replace(&mut *phase, Phase::Idle) {
                Phase::Connecting(waiters) => {
                    *phase = Phase::Connected {
                        transport: transport.clone(),
                        epoch,
                    };
                    Some(waiters)
                }
                other => {
                    *phase = other;
                    None
                }
            }
        };

        let Some(waiters) = waiters else {
            debug!(target: "Sync/Handle", "Handle closed during connect, dropping new transport");
            transport.disconnect().await;
            return Err(ConnectionError::Closed);
        };

        self.spawn_io(transport, events, epoch);
        info!(target: "Sync/Handle", "Transport connected (epoch {epoch})");
        let hooks = lock(&self.connect_hooks).clone();
        for hook in hooks {
            hook(epoch);
        }
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        Ok(())
    }

    fn spawn_io(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        mut events: mpsc::Receiver<TransportEvent>,
        epoch: u64,
    ) {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let outbound = self.outbound_rx.clone();
        let writer_transport = transport.clone();
        let writer = tokio::spawn(async move {
            let mut queue = outbound.lock().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    frame = queue.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = writer_transport.send(&frame).await {
                                warn!(target: "Sync/Handle", "Failed to send frame: {e}");
                            }
                        }
                        None => break,
                    },
                }
            }
            trace!(target: "Sync/Handle", "Writer task stopped");
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            // Stops the writer when the reader exits.
            let _stop_writer = stop_tx;
            while let Some(event) = events.recv().await {
                let Some(handle) = weak.upgrade() else { break };
                match event {
                    TransportEvent::Connected => {
                        debug!(target: "Sync/Handle", "Transport reported connected");
                    }
                    TransportEvent::FrameReceived(text) => handle.dispatch(&text),
                    TransportEvent::Disconnected => break,
                }
            }
            if let Some(handle) = weak.upgrade() {
                handle.mark_disconnected(epoch);
            }
        });

        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(writer.abort_handle());
        tasks.push(reader.abort_handle());
    }

    fn mark_disconnected(&self, epoch: u64) {
        let mut phase = lock(&self.phase);
        if let Phase::Connected { epoch: current, .. } = &*phase {
            if *current == epoch {
                info!(target: "Sync/Handle", "Transport disconnected");
                *phase = Phase::Idle;
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let (event, payload) = match framing::decode_frame(text) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(target: "Sync/Handle", "Dropping malformed frame: {e}");
                return;
            }
        };
        // Cloned out so a handler may call on/off without deadlocking the map.
        let handler = self.handlers.get(&event).map(|h| h.value().clone());
        match handler {
            Some(handler) => handler(payload),
            None => debug!(target: "Sync/Handle", "No handler for '{event}', dropping"),
        }
    }

    /// Queues an event for the server. Frames emitted before the connection
    /// is up are flushed in order once it is.
    pub fn emit(&self, event: &ClientEvent) -> Result<(), ConnectionError> {
        if matches!(*lock(&self.phase), Phase::Closed) {
            return Err(ConnectionError::Closed);
        }
        trace!(target: "Sync/Handle", "Queueing '{}'", event.name());
        self.outbound_tx
            .send(event.to_frame())
            .map_err(|_| ConnectionError::Closed)
    }

    /// Registers the handler for `event`, replacing any previous one.
    pub(crate) fn on(&self, event: &str, handler: EventHandler) {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        if self.handlers.insert(event.to_string(), handler).is_some() {
            debug!(target: "Sync/Handle", "Replaced handler for '{event}'");
        }
    }

    /// Removes the handler for `event` and nothing else.
    pub(crate) fn off(&self, event: &str) -> bool {
        self.handlers.remove(event).is_some()
    }

    pub fn has_handler(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    /// Total number of `on` calls over the handle's life.
    pub fn registration_count(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Opens the one-way push stream. Only one stream may be open at a time.
    pub async fn open_stream(
        &self,
        url: &str,
        token: &str,
    ) -> Result<(StreamHandle, mpsc::Receiver<String>), ConnectionError> {
        if token.trim().is_empty() {
            return Err(ConnectionError::MissingCredential);
        }
        if matches!(*lock(&self.phase), Phase::Closed) {
            return Err(ConnectionError::Closed);
        }
        if self.is_stream_open() {
            return Err(ConnectionError::StreamAlreadyOpen);
        }

        let (closer, events) = self
            .stream_factory
            .open_stream(url, token)
            .await
            .map_err(|e| ConnectionError::Network(e.to_string()))?;
        let stream = StreamHandle::new(closer);

        let mut slot = lock(&self.stream);
        if slot.as_ref().is_some_and(|s| !s.is_closed()) {
            stream.close();
            return Err(ConnectionError::StreamAlreadyOpen);
        }
        *slot = Some(stream.clone());
        info!(target: "Sync/Handle", "Push stream opened");
        Ok((stream, events))
    }

    pub fn is_stream_open(&self) -> bool {
        lock(&self.stream).as_ref().is_some_and(|s| !s.is_closed())
    }

    pub fn close_stream(&self) {
        if let Some(stream) = lock(&self.stream).take() {
            stream.close();
        }
    }

    /// Closes the transport and the push stream. Later emits and connects
    /// fail with `ConnectionError::Closed`.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *lock(&self.phase), Phase::Closed);
        match previous {
            Phase::Closed => return,
            Phase::Connecting(waiters) => {
                for waiter in waiters {
                    let _ = waiter.send(Err(ConnectionError::Closed));
                }
            }
            Phase::Connected { transport, .. } => transport.disconnect().await,
            Phase::Idle => {}
        }

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.close_stream();
        info!(target: "Sync/Handle", "Transport handle closed");
    }
}
