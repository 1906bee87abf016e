//! Registry of live connections.
//!
//! # Responsibilities
//! - Map connection ids to live connections
//! - Point-in-time snapshots for the heartbeat and the shutdown walk
//!
//! # Design Decisions
//! - Sharded `DashMap`: add and remove are O(1) and linearizable per key, and
//!   a snapshot never blocks the accept path for long
//! - Connections remove themselves when they reach a terminal state

use std::sync::Arc;

use dashmap::DashMap;

use super::connection::{Connection, ConnectionId};

#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns `false` if its id was already present.
    pub fn add(&self, connection: Arc<Connection>) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.connections.entry(connection.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(connection);
                true
            }
        }
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, connection)| connection)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections registered at the moment of the call.
    ///
    /// Concurrent adds and removes may or may not be reflected, but no entry
    /// appears twice.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::test_support::open_connection;
    use crate::net::AbortReason;

    #[test]
    fn connections_deregister_on_teardown() {
        let registry = ConnectionRegistry::new();
        let (first, _t1) = open_connection(&registry);
        let (second, _t2) = open_connection(&registry);
        assert_eq!(registry.len(), 2);
        assert!(!registry.add(Arc::clone(&first)));

        first.abort(AbortReason::Requested("test".into()));
        assert!(!registry.contains(first.id()));
        assert!(registry.get(second.id()).is_some());
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn concurrent_add_and_remove_lose_nothing() {
        let registry = ConnectionRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let mut kept = Vec::new();
                    for i in 0..50 {
                        let (connection, transport) = open_connection(&registry);
                        if i % 2 == 0 {
                            connection.abort(AbortReason::Requested("churn".into()));
                        } else {
                            kept.push((connection, transport));
                        }
                    }
                    kept
                })
            })
            .collect();

        let kept: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(registry.len(), kept.len());
        for (connection, _) in &kept {
            assert!(registry.contains(connection.id()));
        }
    }
}
