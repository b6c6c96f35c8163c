//! Connection registry.
//!
//! Process-wide tracking of every live connection. All mutation goes through
//! the atomic operations here; no caller ever holds the internal structure
//! directly. Entries are added by the dispatcher and removed by the owning
//! session loop just before its connection reaches `Closed`, so the registry
//! only ever holds connections in `Connecting`, `Open`, or `Closing`.
//!
//! Snapshots preserve insertion order so a shutdown drain is deterministic.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use crate::{
    connection::{ConnectionHandle, ConnectionId},
    error::ServerError,
};

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    /// Insertion order, for deterministic snapshots.
    order: Vec<ConnectionId>,
    /// Set once a shutdown drain begins; registration is refused from then
    /// on.
    draining: bool,
}

/// Registry of live connections.
///
/// All operations are safe to call from any number of concurrent session
/// loops and the shutdown coordinator; the registry does its own locking.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, enforcing the concurrent-connection limit.
    ///
    /// The capacity check and the insert happen under one lock so the size
    /// can never exceed `limit`, even with concurrent dispatches.
    ///
    /// # Errors
    ///
    /// - `ServerError::Draining` once a shutdown drain has begun
    /// - `ServerError::Capacity` when `limit` connections are already live
    /// - `ServerError::DuplicateId` if the id is already present. Ids come
    ///   from a monotonic counter, so this indicates a broken core invariant
    ///   rather than an operational condition; the caller must not retry.
    pub fn register(&self, handle: ConnectionHandle, limit: usize) -> Result<(), ServerError> {
        let mut inner = self.lock();
        if inner.draining {
            return Err(ServerError::Draining);
        }
        if inner.connections.len() >= limit {
            return Err(ServerError::Capacity { limit });
        }
        let id = handle.id();
        if inner.connections.contains_key(&id) {
            return Err(ServerError::DuplicateId(id));
        }
        inner.connections.insert(id, handle);
        inner.order.push(id);
        Ok(())
    }

    /// Remove a connection. Idempotent: absent ids are a no-op, which lets
    /// concurrent close paths race harmlessly.
    pub fn unregister(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let mut inner = self.lock();
        let removed = inner.connections.remove(&id);
        if removed.is_some() {
            inner.order.retain(|entry| *entry != id);
        }
        removed
    }

    /// Whether a connection is currently registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().connections.contains_key(&id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().connections.is_empty()
    }

    /// Refuse all registrations from now on. Idempotent.
    ///
    /// Runs under the same lock as [`Self::register`], so a concurrent
    /// admission either completes before a subsequent snapshot sees it or
    /// fails with `Draining`; none can slip between the drain snapshot and
    /// the end of the process.
    pub fn begin_drain(&self) {
        self.lock().draining = true;
    }

    /// Consistent point-in-time list of all connections, in insertion order.
    ///
    /// The returned handles are clones; connections registered or removed
    /// after the snapshot is taken are not reflected in it.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.connections.get(id).cloned())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
