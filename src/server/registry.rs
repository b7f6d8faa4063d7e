use std::sync::atomic::{AtomicI32, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::server::client::{ClientConnection, RemoteClient};

/// The concurrent map of active client connections, keyed by client id.
///
/// The registry is the single source of truth for who is connected. It
/// never contains two entries for the same client id; the connection count
/// is its cardinality. Inserts tied to the capacity check happen only under
/// the connect critical section (see [`ConnectionRegistry::connect_section`]),
/// which makes the existing-connection check and the capacity check
/// linearizable with respect to concurrent connects and disconnects.
/// Removal is a bare atomic remove-if-present.
pub struct ConnectionRegistry<H> {
    connections: DashMap<Uuid, ClientConnection<H>>,
    connect_mutex: Mutex<()>,
    limit: AtomicI32,
}

impl<H: Clone> ConnectionRegistry<H> {
    /// Creates a registry with the given connection limit; a negative limit
    /// means no limit while 0 means the server accepts none.
    pub fn new(limit: i32) -> Self {
        Self {
            connections: DashMap::new(),
            connect_mutex: Mutex::new(()),
            limit: AtomicI32::new(limit),
        }
    }

    /// Enters the critical section covering the read-check-then-write
    /// sequence of a connect. Held across the existing-connection check,
    /// the capacity check and the insert.
    pub async fn connect_section(&self) -> MutexGuard<'_, ()> {
        self.connect_mutex.lock().await
    }

    /// The current number of connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// The maximum number of concurrent connections accepted, a negative
    /// number meaning no limit while 0 means the server is closed.
    pub fn limit(&self) -> i32 {
        self.limit.load(Ordering::SeqCst)
    }

    /// Sets the connection limit. Enforced only at connection-creation
    /// time, never retroactively.
    pub fn set_limit(&self, limit: i32) {
        self.limit.store(limit, Ordering::SeqCst);
    }

    /// Whether the configured limit has been reached.
    pub fn at_capacity(&self) -> bool {
        let limit = self.limit();

        limit >= 0 && self.count() >= limit as usize
    }

    /// The connection for the given client id, if any.
    pub fn get(&self, client_id: Uuid) -> Option<ClientConnection<H>> {
        self.connections.get(&client_id).map(|e| e.value().clone())
    }

    /// Inserts a connection. Only called from within the connect critical
    /// section.
    pub fn insert(&self, connection: ClientConnection<H>) {
        self.connections
            .insert(connection.client.client_id(), connection);
    }

    /// Atomically removes and returns the connection for the given client
    /// id, if present.
    pub fn remove(&self, client_id: Uuid) -> Option<ClientConnection<H>> {
        self.connections
            .remove(&client_id)
            .map(|(_, connection)| connection)
    }

    /// An immutable snapshot copy of all current connections, safe to
    /// iterate while disconnects mutate the registry.
    pub fn snapshot(&self) -> Vec<ClientConnection<H>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// The ids of all currently connected clients.
    pub fn client_ids(&self) -> Vec<Uuid> {
        self.connections.iter().map(|e| *e.key()).collect()
    }

    /// Copies of all connected clients.
    pub fn clients(&self) -> Vec<RemoteClient> {
        self.connections
            .iter()
            .map(|e| e.value().client.clone())
            .collect()
    }
}
