//! Shared gateway state.
//!
//! One `Gateway` value owns the subscription engine behind a mutex plus
//! the control-connection pool. Engine mutations run synchronously under
//! the lock; the lock is never held across an await point.

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use uuid::Uuid;
use waypoint_core::SubscriptionEngine;

/// Shared state for both channels.
pub struct Gateway {
    engine: Mutex<SubscriptionEngine>,

    /// Live one-shot control sessions, keyed by session id.
    control_pool: DashMap<Uuid, String>,
    control_max: AtomicUsize,

    started_at: Instant,
    add_stats: bool,
}

impl Gateway {
    pub fn new(add_stats: bool) -> Self {
        Self {
            engine: Mutex::new(SubscriptionEngine::new()),
            control_pool: DashMap::new(),
            control_max: AtomicUsize::new(0),
            started_at: Instant::now(),
            add_stats,
        }
    }

    /// Locks the subscription engine for one synchronous operation.
    pub fn engine(&self) -> MutexGuard<'_, SubscriptionEngine> {
        self.engine.lock()
    }

    /// Whether every control response carries statistics.
    pub fn add_stats(&self) -> bool {
        self.add_stats
    }

    /// Tracks a freshly accepted control connection.
    pub fn control_opened(&self, remote_address: String) -> Uuid {
        let session_id = Uuid::new_v4();
        self.control_pool.insert(session_id, remote_address);
        self.control_max
            .fetch_max(self.control_pool.len(), Ordering::Relaxed);
        session_id
    }

    /// Drops a control connection from the pool.
    pub fn control_closed(&self, session_id: Uuid) {
        self.control_pool.remove(&session_id);
    }

    /// Per-channel socket statistics for control responses.
    pub fn socket_stats(&self) -> Value {
        let engine = self.engine();
        json!({
            "control": {
                "uptime": self.started_at.elapsed().as_secs(),
                "connections": self.control_pool.len(),
                "maxConnections": self.control_max.load(Ordering::Relaxed),
            },
            "client": {
                "connections": engine.registry().count(),
                "maxConnections": engine.registry().max_count(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_pool_tracking() {
        let gateway = Gateway::new(false);
        let a = gateway.control_opened("127.0.0.1:40000".to_string());
        let b = gateway.control_opened("127.0.0.1:40001".to_string());

        let stats = gateway.socket_stats();
        assert_eq!(stats["control"]["connections"], 2);
        assert_eq!(stats["control"]["maxConnections"], 2);

        gateway.control_closed(a);
        gateway.control_closed(b);
        let stats = gateway.socket_stats();
        assert_eq!(stats["control"]["connections"], 0);
        assert_eq!(stats["control"]["maxConnections"], 2);
    }

    #[test]
    fn test_client_stats_follow_registry() {
        let gateway = Gateway::new(false);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = gateway.engine().on_connection_open("10.0.0.1:1", tx);

        let stats = gateway.socket_stats();
        assert_eq!(stats["client"]["connections"], 1);

        gateway.engine().on_connection_closed(conn);
        let stats = gateway.socket_stats();
        assert_eq!(stats["client"]["connections"], 0);
        assert_eq!(stats["client"]["maxConnections"], 1);
    }
}
