//! Connection manager - runtime shell around [`ConnectionMachine`]
//!
//! Public calls are applied immediately on the caller's thread. Transport
//! events and timer fires are queued on a channel and applied one at a time by
//! a driver task, so every mutation goes through the same lock in order.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::ManagerConfig;
use crate::core::{
    ConnectionId, ConnectionMachine, ConnectionState, Effect, Input, Payload, Purpose, TimerId,
};
use crate::transcript::Transcript;
use crate::transport::{EventSink, Transport, TransportError, TransportHandle};
use crate::ws_state::Phase;

/// What happened to a `send_message` call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the transport
    Sent,
    /// Not connected; nothing was sent
    NotConnected,
    /// The transport rejected the frame; see `error_message`
    Failed,
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] TryCurrentError),
}

/// Owns one logical WebSocket connection
///
/// Cheap to clone; all clones drive the same connection. The connection is
/// closed when the last clone is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    transcript: Arc<dyn Transcript>,
    runtime: Handle,
    inputs: mpsc::UnboundedSender<Input>,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
}

struct Shared {
    machine: ConnectionMachine,
    handle: Option<(ConnectionId, Box<dyn TransportHandle>)>,
    timers: HashMap<TimerId, JoinHandle<()>>,
}

impl Shared {
    fn take_handle(&mut self, id: ConnectionId) -> Option<Box<dyn TransportHandle>> {
        if self.handle.as_ref().is_some_and(|(current, _)| *current == id) {
            self.handle.take().map(|(_, handle)| handle)
        } else {
            None
        }
    }
}

/// Work that runs after the state lock is released
#[derive(Default)]
struct Deferred {
    close: Vec<Box<dyn TransportHandle>>,
    release: Vec<Box<dyn TransportHandle>>,
    append: Vec<(String, bool)>,
}

impl ConnectionManager {
    /// Create a manager at rest (disconnected, no handle) on the current runtime
    ///
    /// Fails when called outside a tokio runtime; use
    /// [`with_runtime`](Self::with_runtime) from other threads.
    pub fn new(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        transcript: Arc<dyn Transcript>,
    ) -> Result<Self, ManagerError> {
        let runtime = Handle::try_current()?;
        Ok(Self::with_runtime(config, transport, transcript, runtime))
    }

    /// Create a manager whose driver and timer tasks run on `runtime`
    pub fn with_runtime(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        transcript: Arc<dyn Transcript>,
        runtime: Handle,
    ) -> Self {
        let (inputs, mut rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::default());
        let machine = ConnectionMachine::new(config.timing());

        let inner = Arc::new(Inner {
            config,
            transport,
            transcript,
            runtime: runtime.clone(),
            inputs,
            shared: Mutex::new(Shared {
                machine,
                handle: None,
                timers: HashMap::new(),
            }),
            state_tx,
        });

        let weak = Arc::downgrade(&inner);
        runtime.spawn(async move {
            while let Some(input) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.dispatch(input);
            }
            debug!("Connection driver stopped");
        });

        Self { inner }
    }

    /// Open a new connection, closing any existing one first
    ///
    /// `initial` is serialized and sent as soon as the connection opens, and
    /// again after every automatic reconnect.
    pub fn connect(&self, initial: Option<Value>) {
        self.inner.dispatch(Input::Connect { initial });
    }

    /// Close the connection and cancel any pending reconnect
    pub fn disconnect(&self) {
        self.inner.dispatch(Input::Disconnect);
    }

    /// Disconnect, then connect again after the restart delay
    pub fn reconnect(&self, initial: Option<Value>) {
        self.inner.dispatch(Input::Reconnect { initial });
    }

    /// Send a text or structured payload
    ///
    /// Never fails loudly: when not connected nothing is sent, and transport
    /// failures are recorded in `error_message`.
    pub fn send_message(&self, payload: impl Into<Payload>) -> SendOutcome {
        self.inner
            .dispatch(Input::Send(payload.into()))
            .unwrap_or(SendOutcome::NotConnected)
    }

    /// Snapshot of the current state
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().machine.state().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.shared.lock().machine.state().is_connected
    }

    pub fn is_sending_message(&self) -> bool {
        self.inner.shared.lock().machine.state().is_sending_message
    }

    pub fn connection_status(&self) -> Phase {
        self.inner.shared.lock().machine.state().connection_status
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.shared.lock().machine.state().error_message.clone()
    }

    pub fn last_connected_time(&self) -> Option<DateTime<Utc>> {
        self.inner.shared.lock().machine.state().last_connected_time
    }

    /// Watch state changes; the receiver sees every distinct snapshot
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }
}

impl Inner {
    /// Apply one input and execute its effects under the lock
    fn dispatch(&self, input: Input) -> Option<SendOutcome> {
        let mut deferred = Deferred::default();

        let outcome = {
            let mut shared = self.shared.lock();

            if let Input::TimerFired(timer) = &input {
                shared.timers.remove(timer);
            }

            let effects = shared.machine.apply(input);
            let outcome = self.execute(&mut shared, effects, &mut deferred);
            self.publish(&shared);
            outcome
        };

        // Handles and the transcript may call back into the manager
        for handle in deferred.close {
            handle.close();
        }
        drop(deferred.release);
        for (content, from_user) in deferred.append {
            self.transcript.append(&content, from_user);
        }

        outcome
    }

    fn execute(
        &self,
        shared: &mut Shared,
        effects: Vec<Effect>,
        deferred: &mut Deferred,
    ) -> Option<SendOutcome> {
        let mut queue = VecDeque::from(effects);
        let mut outcome = None;

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Open(id) => {
                    if let Some((stale, handle)) = shared.handle.take() {
                        warn!(%stale, "Closing handle left open");
                        deferred.close.push(handle);
                    }

                    let sink = EventSink::new(id, self.inputs.clone());
                    let opened = self
                        .config
                        .endpoint
                        .url()
                        .map_err(TransportError::from)
                        .and_then(|url| {
                            debug!(%id, url = %url, "Opening transport");
                            self.transport.open(&url, sink)
                        });

                    match opened {
                        Ok(handle) => shared.handle = Some((id, handle)),
                        Err(e) => queue.extend(shared.machine.apply(Input::OpenFailed {
                            id,
                            detail: e.to_string(),
                        })),
                    }
                }
                Effect::Close(id) => {
                    if let Some(handle) = shared.take_handle(id) {
                        deferred.close.push(handle);
                    }
                }
                Effect::Release(id) => {
                    if let Some(handle) = shared.take_handle(id) {
                        deferred.release.push(handle);
                    }
                }
                Effect::Transmit { id, text, purpose } => {
                    let result = match &shared.handle {
                        Some((current, handle)) if *current == id => handle.send(&text),
                        _ => Err(TransportError::Send("no active connection".to_string())),
                    };

                    match (result, purpose) {
                        (Ok(()), Purpose::Initial) => debug!(%id, "Initial payload sent"),
                        (Err(e), Purpose::Initial) => {
                            error!(%id, error = %e, "Failed to send initial payload");
                        }
                        (Ok(()), Purpose::User { echo }) => {
                            if echo {
                                deferred.append.push((text, true));
                            }
                            outcome = Some(SendOutcome::Sent);
                        }
                        (Err(e), Purpose::User { .. }) => {
                            queue.extend(shared.machine.apply(Input::SendFailed {
                                id,
                                detail: e.to_string(),
                            }));
                            outcome = Some(SendOutcome::Failed);
                        }
                    }
                }
                Effect::Append { content, from_user } => {
                    deferred.append.push((content, from_user));
                }
                Effect::Schedule { timer, delay } => {
                    let inputs = self.inputs.clone();
                    let task = self.runtime.spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = inputs.send(Input::TimerFired(timer));
                    });
                    if let Some(old) = shared.timers.insert(timer, task) {
                        old.abort();
                    }
                }
                Effect::Cancel(timer) => {
                    if let Some(task) = shared.timers.remove(&timer) {
                        task.abort();
                    }
                }
            }
        }

        outcome
    }

    fn publish(&self, shared: &Shared) {
        let snapshot = shared.machine.state();
        self.state_tx.send_if_modified(|current| {
            if *current == *snapshot {
                false
            } else {
                *current = snapshot.clone();
                true
            }
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut();
        for (_, task) in shared.timers.drain() {
            task.abort();
        }
        if let Some((id, handle)) = shared.handle.take() {
            debug!(%id, "Manager dropped, closing connection");
            handle.close();
        }
    }
}
