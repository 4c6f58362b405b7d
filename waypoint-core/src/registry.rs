//! Client connection registry.
//!
//! Connections are keyed by an opaque id assigned at accept time; the
//! transport handle itself never acts as a map key. The registry owns
//! only delivery metadata and the outbound sender half - the socket
//! stays with its connection task.

use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;

/// Opaque, monotonically increasing connection id.
pub type ConnectionId = u64;

/// One live client connection.
#[derive(Debug)]
pub struct ClientConnection {
    pub id: ConnectionId,
    pub remote_address: String,

    /// Outbound half: serialized envelopes handed to the writer task.
    sender: UnboundedSender<String>,

    /// Unix timestamp (fractional seconds) of the last delivery.
    last_send: Option<f64>,
}

impl ClientConnection {
    /// Returns the last delivery timestamp, if anything was sent yet.
    pub fn last_send(&self) -> Option<f64> {
        self.last_send
    }

    /// Hands one serialized envelope to the connection's writer task.
    ///
    /// Returns false if the writer half is gone (connection tearing
    /// down); the caller treats that as a skipped recipient.
    pub fn send(&self, data: String) -> bool {
        self.sender.send(data).is_ok()
    }
}

/// Registry of all live client connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ClientConnection>,
    next_id: ConnectionId,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection and returns its assigned id.
    ///
    /// Updates the high-water mark of concurrent connections.
    pub fn register(
        &mut self,
        remote_address: impl Into<String>,
        sender: UnboundedSender<String>,
    ) -> ConnectionId {
        self.next_id += 1;
        let id = self.next_id;
        self.connections.insert(
            id,
            ClientConnection {
                id,
                remote_address: remote_address.into(),
                sender,
                last_send: None,
            },
        );
        self.max_connections = self.max_connections.max(self.connections.len());
        id
    }

    /// Removes a connection. No-op when the id is unknown.
    pub fn unregister(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    pub fn exists(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn lookup(&self, id: ConnectionId) -> Option<&ClientConnection> {
        self.connections.get(&id)
    }

    /// Stamps the last-send time for a connection.
    pub fn record_delivery(&mut self, id: ConnectionId, timestamp: f64) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.last_send = Some(timestamp);
        }
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// High-water mark of concurrent connections.
    pub fn max_count(&self) -> usize {
        self.max_connections
    }
}
