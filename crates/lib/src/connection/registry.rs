//! The registry of live connections.
//!
//! At most one connection exists per [`ConnectionKey`]. Acquiring an existing
//! key returns a new lease on the same connection; releasing the last lease
//! tears it down after [`MirrorConfig::release_delay`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    BackendSession, Bridge, Connection, ConnectionError, ConnectionHandle, ConnectionKey, Scope,
    SessionId, ShapeDescriptor, lock,
};
use crate::config::MirrorConfig;

struct RegistryEntry {
    connection: Arc<Connection>,
    ref_count: usize,
    /// Bumped every time the count drops to zero, so a stale delayed teardown
    /// can tell that the connection was re-acquired in between.
    epoch: u64,
}

pub(crate) struct RegistryInner {
    config: MirrorConfig,
    session: watch::Sender<Option<BackendSession>>,
    entries: Mutex<HashMap<ConnectionKey, RegistryEntry>>,
}

impl RegistryInner {
    /// Takes another lease on a connection that is already registered.
    pub(crate) fn retain(&self, connection: &Connection) {
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get_mut(connection.key()) {
            if entry.connection.instance() == connection.instance() {
                entry.ref_count += 1;
            }
        }
    }

    /// Gives back one lease.
    pub(crate) fn release(this: &Arc<Self>, connection: &Connection) {
        let key = connection.key();
        let mut entries = lock(&this.entries);
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        // A handle outliving a torn-down connection must not touch its successor
        if entry.connection.instance() != connection.instance() {
            return;
        }

        entry.ref_count = entry.ref_count.saturating_sub(1);
        debug!(key = %key, ref_count = entry.ref_count, "Released connection lease");
        if entry.ref_count > 0 {
            return;
        }
        entry.epoch += 1;
        let epoch = entry.epoch;

        let delay = this.config.release_delay();
        let runtime = tokio::runtime::Handle::try_current();
        match runtime {
            Ok(runtime) if !delay.is_zero() => {
                drop(entries);
                let registry = Arc::downgrade(this);
                let key = key.clone();
                let instance = connection.instance();
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(registry) = registry.upgrade() {
                        registry.expire(&key, instance, epoch);
                    }
                });
            }
            _ => {
                let removed = entries.remove(key);
                drop(entries);
                if let Some(entry) = removed {
                    entry.connection.close();
                }
            }
        }
    }

    /// Tears a connection down if it is still unreferenced since `epoch`.
    fn expire(&self, key: &ConnectionKey, instance: Uuid, epoch: u64) {
        let mut entries = lock(&self.entries);
        let idle = entries.get(key).is_some_and(|entry| {
            entry.connection.instance() == instance && entry.ref_count == 0 && entry.epoch == epoch
        });
        if !idle {
            return;
        }
        let removed = entries.remove(key);
        drop(entries);
        if let Some(entry) = removed {
            entry.connection.close();
        }
    }
}

/// Hands out connections, one per (shape, scope).
///
/// Cloning the registry is cheap; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(config: MirrorConfig) -> Self {
        let (session, _) = watch::channel(None);
        Self {
            inner: Arc::new(RegistryInner {
                config,
                session,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.inner.config
    }

    /// Makes the backend available. Connections waiting for a session subscribe now.
    pub fn attach(&self, bridge: Arc<dyn Bridge>, session_id: SessionId) {
        info!(session = session_id, "Attached backend session");
        self.inner.session.send_replace(Some(BackendSession { bridge, session_id }));
    }

    /// Returns a lease on the connection for `shape` and `scope`, opening it if needed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn acquire(
        &self,
        shape: ShapeDescriptor,
        scope: Scope,
    ) -> Result<ConnectionHandle, ConnectionError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?;
        let key = ConnectionKey::new(&shape, &scope);
        let registry = Arc::downgrade(&self.inner);

        let mut entries = lock(&self.inner.entries);
        if let Some(entry) = entries.get_mut(&key) {
            entry.ref_count += 1;
            debug!(key = %key, ref_count = entry.ref_count, "Reusing connection");
            return Ok(ConnectionHandle::new(entry.connection.clone(), registry));
        }

        let connection = Connection::open(
            shape,
            scope,
            &self.inner.config,
            self.inner.session.subscribe(),
            &runtime,
        );
        entries.insert(
            key,
            RegistryEntry {
                connection: connection.clone(),
                ref_count: 1,
                epoch: 0,
            },
        );
        Ok(ConnectionHandle::new(connection, registry))
    }

    /// Number of registered connections, including ones awaiting delayed teardown.
    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        lock(&self.inner.entries).contains_key(key)
    }

    /// Outstanding leases on the connection for `key`.
    pub fn ref_count(&self, key: &ConnectionKey) -> Option<usize> {
        lock(&self.inner.entries).get(key).map(|entry| entry.ref_count)
    }

    /// Tears down every registered connection without leases, returning how many.
    ///
    /// Delayed teardown normally does this; the sweep covers teardowns that
    /// could not be scheduled.
    pub fn sweep_idle(&self) -> usize {
        let idle: Vec<RegistryEntry> = {
            let mut entries = lock(&self.inner.entries);
            let keys: Vec<ConnectionKey> = entries
                .iter()
                .filter(|(_, entry)| entry.ref_count == 0)
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| entries.remove(key)).collect()
        };
        for entry in &idle {
            entry.connection.close();
        }
        if !idle.is_empty() {
            info!(count = idle.len(), "Swept idle connections");
        }
        idle.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(MirrorConfig::default())
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("config", &self.inner.config)
            .field("connections", &self.len())
            .finish()
    }
}
