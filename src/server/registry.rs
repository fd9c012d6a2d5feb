//! Live connections and the handlers bound to them.

use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::net::{Connection, ConnectionId};
use crate::observability::metrics;
use crate::server::handler::ConnectionHandler;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    NotRegistered(ConnectionId),
}

#[derive(Clone)]
struct Entry {
    connection: Connection,
    handler: Arc<dyn ConnectionHandler>,
}

/// A thread-safe map of connection id to connection and handler.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<DashMap<ConnectionId, Entry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection: Connection, handler: Arc<dyn ConnectionHandler>) {
        let id = connection.id();
        self.inner.insert(id, Entry { connection, handler });
        metrics::record_active_connections(self.inner.len());
        tracing::debug!(connection_id = %id, active = self.inner.len(), "Connection registered");
    }

    /// Remove an entry, returning its connection.
    pub fn remove(&self, id: ConnectionId) -> Result<Connection, RegistryError> {
        let (_, entry) = self
            .inner
            .remove(&id)
            .ok_or(RegistryError::NotRegistered(id))?;
        metrics::record_active_connections(self.inner.len());
        tracing::debug!(connection_id = %id, active = self.inner.len(), "Connection deregistered");
        Ok(entry.connection)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Shut down every registered handler and connection.
    ///
    /// Entries leave the map through the usual deregistration path, not here.
    /// Returns how many entries were shut down.
    pub fn shutdown_all(&self) -> usize {
        // Collect first; shutdown re-enters the map through deregistration.
        let entries: Vec<Entry> = self.inner.iter().map(|entry| entry.value().clone()).collect();
        for entry in &entries {
            entry.handler.shutdown();
            entry.connection.shutdown();
        }
        entries.len()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("len", &self.inner.len())
            .finish()
    }
}
