//! Registry of live connections
//!
//! The registry is the only shared mutable peer state in the relay. Every
//! operation takes the same lock, and the lock only ever guards in-memory
//! bookkeeping; sends to peers happen on snapshots taken outside of it.

use crate::network::connection::{Connection, ConnectionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Set of connections that are currently broadcast recipients
///
/// Entries are non-owning: closing a connection is the job of its reader
/// task, never of the registry.
///
/// # Example
///
/// ```
/// use chat_relay::network::{Connection, Registry};
/// use std::sync::Arc;
///
/// let registry = Registry::new();
/// let (_peer, local) = tokio::io::duplex(64);
/// let conn = Arc::new(Connection::new("127.0.0.1:9000".parse().unwrap(), local));
///
/// registry.add(&conn);
/// assert!(registry.contains(conn.id()));
///
/// assert!(registry.remove(conn.id()));
/// assert!(!registry.remove(conn.id()));
/// ```
#[derive(Default)]
pub struct Registry {
    connections: Mutex<HashMap<ConnectionId, Weak<Connection>>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live connection
    pub fn add(&self, connection: &Arc<Connection>) {
        self.connections
            .lock()
            .insert(connection.id(), Arc::downgrade(connection));
    }

    /// Deregister a connection
    ///
    /// Returns `true` if an entry was removed. Removing an absent
    /// connection is a no-op.
    pub fn remove(&self, id: ConnectionId) -> bool {
        self.connections.lock().remove(&id).is_some()
    }

    /// Current members, for iteration outside the lock
    ///
    /// Entries whose connection has already been dropped are skipped.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Whether the connection is currently registered and still alive
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections
            .lock()
            .get(&id)
            .is_some_and(|conn| conn.strong_count() > 0)
    }

    /// Identities of all live registered connections
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections
            .lock()
            .iter()
            .filter(|(_, conn)| conn.strong_count() > 0)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Get the number of live registered connections
    ///
    /// Counts the same entries [`snapshot`](Self::snapshot) would return.
    pub fn len(&self) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|conn| conn.strong_count() > 0)
            .count()
    }

    /// Check if the registry has no live connections
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
