//! WebSocket connection manager.
//!
//! Assigns engine connection ids to sockets and routes outgoing engine
//! messages to the socket that owns each id.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arbor_engine::{ConnectionId, Envelope};
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Sender for outgoing frames.
pub type MessageSender = mpsc::UnboundedSender<Vec<u8>>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique session id, for correlating logs across reconnects
    pub session: String,
    /// Channel to send frames to this connection
    pub sender: MessageSender,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug)]
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, Connection>,
    // 0 is the server's own id
    next_id: AtomicU32,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection.
    ///
    /// Returns the engine connection id.
    pub fn register(&self, profile: Option<u32>, sender: MessageSender) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = uuid::Uuid::new_v4().to_string();

        tracing::info!(conn_id = id, session = %session, ?profile, "WebSocket connection registered");

        self.connections.insert(id, Connection { session, sender });

        id
    }

    /// Unregister a connection.
    pub fn unregister(&self, id: ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(&id) {
            tracing::info!(conn_id = id, session = %conn.session, "WebSocket connection unregistered");
        }
    }

    /// Send a frame to a specific connection.
    pub fn send_to(&self, id: ConnectionId, bytes: Vec<u8>) -> bool {
        match self.connections.get(&id) {
            Some(conn) => conn.sender.send(bytes).is_ok(),
            None => false,
        }
    }

    /// Route engine output to sockets.
    ///
    /// Returns the number of envelopes handed to a live connection.
    pub fn deliver(&self, envelopes: Vec<Envelope>) -> usize {
        let mut sent_count = 0;

        for envelope in envelopes {
            if self.send_to(envelope.connection, envelope.bytes) {
                sent_count += 1;
            } else {
                tracing::debug!(conn_id = envelope.connection, "Dropping frame for closed connection");
            }
        }

        sent_count
    }

    /// Session id of a connection.
    pub fn session(&self, id: ConnectionId) -> Option<String> {
        self.connections.get(&id).map(|c| c.session.clone())
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_engine::Reliability;

    #[test]
    fn test_register_unregister() {
        let manager = ConnectionManager::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let first = manager.register(None, tx1);
        let second = manager.register(Some(2), tx2);
        assert_eq!((first, second), (1, 2));
        assert_eq!(manager.connection_count(), 2);
        assert_ne!(manager.session(first), manager.session(second));

        manager.unregister(first);
        assert_eq!(manager.connection_count(), 1);
        assert!(manager.session(first).is_none());
    }

    #[test]
    fn test_deliver_routes_by_connection() {
        let manager = ConnectionManager::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let first = manager.register(None, tx1);
        let second = manager.register(None, tx2);

        let envelope = |connection, byte| Envelope {
            connection,
            bytes: vec![byte],
            reliability: Reliability::Reliable,
        };
        let sent = manager.deliver(vec![
            envelope(second, 2),
            envelope(first, 1),
            envelope(99, 9),
        ]);
        assert_eq!(sent, 2);

        assert_eq!(rx1.try_recv().unwrap(), vec![1]);
        assert_eq!(rx2.try_recv().unwrap(), vec![2]);
        assert!(rx1.try_recv().is_err());
    }
}
