//! Connection lifecycle management.
//!
//! A connection owns the [`Mirror`] for one (shape, scope) pair and keeps it in
//! sync with the backend:
//!
//! - on first acquisition it creates an empty mirror, attaches an outbound
//!   watcher and subscribes as soon as a backend session is attached to the
//!   registry
//! - the initial snapshot is merged into the mirror root and resolves
//!   readiness; members created locally while subscribing are kept
//! - inbound patch batches are applied with the outbound watcher suspended, so
//!   they never echo back to the backend
//! - local edits made through [`ConnectionHandle::edit`] are sent as patches,
//!   in order, once the connection is ready
//!
//! Consumers hold a [`ConnectionHandle`], a counted lease. Dropping the last
//! lease schedules teardown after the configured release delay; a re-acquire in
//! the meantime reuses the live connection.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;

use crate::{
    config::MirrorConfig,
    mirror::{Editor, Mirror, MirrorError, MirrorObserver, ObserverId},
    model::snapshot::root_from_snapshot,
};

pub mod bridge;
mod errors;
pub mod memory;
mod outbound;
pub mod registry;

pub use bridge::{
    BackendMessage, BackendSession, Bridge, ConnectionKey, MessageSink, Scope, SessionId,
    ShapeDescriptor, SubscriptionId, SubscriptionRequest,
};
pub use errors::ConnectionError;
pub use memory::MemoryBridge;
pub use registry::ConnectionRegistry;

use outbound::{OutboundTarget, OutboundWatcher};
use registry::RegistryInner;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for a backend session or for the initial snapshot.
    Subscribing,
    /// The initial snapshot has been applied.
    Ready { subscription: SubscriptionId },
    /// The subscription was rejected or its snapshot was unusable.
    Failed(ConnectionError),
    /// Torn down; no further backend messages are applied.
    Released,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The shared state behind every handle for one key.
pub(crate) struct Connection {
    key: ConnectionKey,
    /// Distinguishes this connection from a later one under the same key.
    instance: Uuid,
    shape: ShapeDescriptor,
    scope: Scope,
    mirror: Mutex<Mirror>,
    watcher: Arc<OutboundWatcher>,
    state: watch::Sender<ConnectionState>,
    inbound: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Creates the connection and spawns its inbound and outbound tasks.
    pub(crate) fn open(
        shape: ShapeDescriptor,
        scope: Scope,
        config: &MirrorConfig,
        session: watch::Receiver<Option<BackendSession>>,
        runtime: &tokio::runtime::Handle,
    ) -> Arc<Self> {
        let key = ConnectionKey::new(&shape, &scope);
        let (watcher, queue) = outbound::channel();
        let mut mirror = Mirror::with_config(&config.identity);
        mirror.subscribe(watcher.clone());
        let (state, _) = watch::channel(ConnectionState::Subscribing);

        let connection = Arc::new(Self {
            key,
            instance: Uuid::new_v4(),
            shape,
            scope,
            mirror: Mutex::new(mirror),
            watcher,
            state,
            inbound: Mutex::new(None),
        });

        let target = OutboundTarget {
            key: connection.key.clone(),
            shape: connection.shape.clone(),
            scope: connection.scope.clone(),
            state: connection.state.subscribe(),
            session: session.clone(),
        };
        runtime.spawn(outbound::run(queue, target));

        let span = info_span!("inbound", key = %connection.key);
        let inbound =
            runtime.spawn(run_inbound(Arc::downgrade(&connection), session).instrument(span));
        *lock(&connection.inbound) = Some(inbound);

        info!(key = %connection.key, "Opened connection");
        connection
    }

    pub(crate) fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub(crate) fn instance(&self) -> Uuid {
        self.instance
    }

    fn is_released(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Released)
    }

    fn request(&self, session_id: SessionId) -> SubscriptionRequest {
        SubscriptionRequest {
            shape: self.shape.clone(),
            scope: self.scope.clone(),
            session_id,
        }
    }

    /// Moves a subscribing connection to the failed state.
    fn fail(&self, err: ConnectionError) {
        error!(key = %self.key, %err, "Connection failed");
        self.state.send_if_modified(|state| {
            if matches!(state, ConnectionState::Subscribing) {
                *state = ConnectionState::Failed(err.clone());
                true
            } else {
                false
            }
        });
    }

    fn handle_message(&self, message: BackendMessage) {
        match message {
            BackendMessage::Initial {
                snapshot,
                subscription_id,
            } => self.apply_initial(&snapshot, subscription_id),
            BackendMessage::Update { patches } => {
                debug!(patches = patches.len(), "Received patch batch");
                let report = {
                    let mut mirror = lock(&self.mirror);
                    let _suspended = self.watcher.suspend();
                    mirror.apply_remote(&patches)
                };
                if !report.is_clean() {
                    debug!(
                        applied = report.applied,
                        skipped = report.skipped.len(),
                        "Patch batch partially applied"
                    );
                }
            }
        }
    }

    fn apply_initial(&self, snapshot: &Value, subscription: SubscriptionId) {
        debug!(subscription, "Received initial snapshot");
        let Some(root) = root_from_snapshot(snapshot) else {
            self.fail(ConnectionError::InvalidSnapshot {
                key: self.key.to_string(),
                reason: "root is not a collection of entities".to_string(),
            });
            return;
        };

        // Edits made while subscribing are already queued for the backend and stay
        let merged = {
            let mut mirror = lock(&self.mirror);
            let _suspended = self.watcher.suspend();
            mirror.merge_snapshot(root)
        };
        self.state.send_if_modified(|state| {
            if matches!(state, ConnectionState::Released) {
                return false;
            }
            *state = ConnectionState::Ready { subscription };
            true
        });
        info!(subscription, merged, "Connection ready");
    }

    /// Stops inbound delivery. In-flight and queued outbound sends continue.
    pub(crate) fn close(&self) {
        self.state.send_replace(ConnectionState::Released);
        if let Some(task) = lock(&self.inbound).take() {
            task.abort();
        }
        info!(key = %self.key, "Released connection");
    }
}

/// Subscribes once a session is available, then applies backend messages in
/// arrival order until the connection is gone.
async fn run_inbound(
    connection: Weak<Connection>,
    mut session: watch::Receiver<Option<BackendSession>>,
) {
    let session = match session.wait_for(Option::is_some).await {
        Ok(session) => session.clone(),
        Err(_) => return,
    };
    let Some(session) = session else {
        return;
    };

    let request = match connection.upgrade() {
        Some(connection) => connection.request(session.session_id),
        None => return,
    };
    let (sink, mut messages) = mpsc::unbounded_channel();

    info!(session = session.session_id, "Subscribing");
    if let Err(err) = session.bridge.subscribe(&request, sink).await {
        if let Some(connection) = connection.upgrade() {
            connection.fail(ConnectionError::SubscriptionFailed {
                key: connection.key.to_string(),
                reason: err.to_string(),
            });
        }
        return;
    }

    while let Some(message) = messages.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        if connection.is_released() {
            break;
        }
        connection.handle_message(message);
    }
    debug!("Inbound stream ended");
}

/// A counted lease on a connection.
///
/// Dropping the handle releases it. Cloning takes another lease.
pub struct ConnectionHandle {
    connection: Arc<Connection>,
    registry: Weak<RegistryInner>,
}

impl ConnectionHandle {
    pub(crate) fn new(connection: Arc<Connection>, registry: Weak<RegistryInner>) -> Self {
        Self {
            connection,
            registry,
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.connection.key
    }

    pub fn shape(&self) -> &ShapeDescriptor {
        &self.connection.shape
    }

    pub fn scope(&self) -> &Scope {
        &self.connection.scope
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state(), ConnectionState::Ready { .. })
    }

    /// Waits until the initial snapshot has been applied.
    ///
    /// Fails if the subscription was rejected, the snapshot was unusable, or the
    /// connection was released first.
    pub async fn ready(&self) -> Result<(), ConnectionError> {
        let released = || ConnectionError::Released {
            key: self.connection.key.to_string(),
        };
        let mut state = self.connection.state.subscribe();
        let state = state
            .wait_for(|state| !matches!(state, ConnectionState::Subscribing))
            .await
            .map(|state| state.clone())
            .map_err(|_| released())?;
        match state {
            ConnectionState::Ready { .. } => Ok(()),
            ConnectionState::Failed(err) => Err(err),
            ConnectionState::Subscribing | ConnectionState::Released => Err(released()),
        }
    }

    /// Reads the mirror.
    pub fn read<R>(&self, f: impl FnOnce(&Mirror) -> R) -> R {
        f(&*lock(&self.connection.mirror))
    }

    /// The mirror rendered as JSON.
    pub fn snapshot(&self) -> Value {
        self.read(Mirror::to_json)
    }

    /// Runs a local edit. Its changes are sent to the backend, or added to the
    /// open transaction.
    pub fn edit<R>(
        &self,
        f: impl FnOnce(&mut Editor<'_>) -> Result<R, MirrorError>,
    ) -> Result<R, MirrorError> {
        lock(&self.connection.mirror).edit(f)
    }

    /// Registers an observer for every change to the mirror.
    ///
    /// Observers run while the mirror is locked and must not call back into
    /// this handle.
    pub fn observe(&self, observer: Arc<dyn MirrorObserver>) -> ObserverId {
        lock(&self.connection.mirror).subscribe(observer)
    }

    pub fn unobserve(&self, id: ObserverId) -> bool {
        lock(&self.connection.mirror).unsubscribe(id)
    }

    /// Starts accumulating local changes instead of sending them.
    pub fn begin_transaction(&self) -> Result<(), ConnectionError> {
        self.connection.watcher.begin_transaction()
    }

    pub fn in_transaction(&self) -> bool {
        self.connection.watcher.in_transaction()
    }

    /// Sends everything accumulated since [`begin_transaction`](Self::begin_transaction)
    /// as one batch, after readiness.
    pub async fn commit_transaction(&self) -> Result<(), ConnectionError> {
        let ack = self.connection.watcher.commit_transaction()?;
        self.await_ack(ack).await
    }

    /// Waits until every change made so far has been sent.
    pub async fn flush(&self) -> Result<(), ConnectionError> {
        let ack = self.connection.watcher.flush();
        self.await_ack(ack).await
    }

    async fn await_ack(
        &self,
        ack: tokio::sync::oneshot::Receiver<Result<(), ConnectionError>>,
    ) -> Result<(), ConnectionError> {
        ack.await.unwrap_or_else(|_| {
            Err(ConnectionError::Released {
                key: self.connection.key.to_string(),
            })
        })
    }
}

impl Clone for ConnectionHandle {
    fn clone(&self) -> Self {
        if let Some(registry) = self.registry.upgrade() {
            registry.retain(&self.connection);
        }
        Self::new(self.connection.clone(), self.registry.clone())
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            RegistryInner::release(&registry, &self.connection);
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("key", &self.connection.key)
            .field("state", &self.state())
            .finish()
    }
}
