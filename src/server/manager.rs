//! Registry of live connections.
//!
//! Entries live in a slab indexed by a generational [`ConnectionId`], so a
//! stop aimed at a connection that has already gone away can never hit a
//! newer connection that reused the same slot.

use crate::metrics::Metrics;
use slab::Slab;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

/// Handle naming one registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: usize,
    generation: u64,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// What a connection task receives when it is registered.
pub struct Registration {
    pub id: ConnectionId,
    /// Signalled once when the manager stops this connection.
    pub stop: Arc<Notify>,
}

struct Entry {
    generation: u64,
    peer: SocketAddr,
    stop: Arc<Notify>,
}

struct Inner {
    connections: Slab<Entry>,
    next_generation: u64,
}

/// Tracks every open connection and can stop any or all of them.
pub struct ConnectionManager {
    inner: Mutex<Inner>,
    metrics: Arc<dyn Metrics>,
}

impl ConnectionManager {
    pub fn new(metrics: Arc<dyn Metrics>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                connections: Slab::new(),
                next_generation: 0,
            }),
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a newly accepted connection.
    pub fn register(&self, peer: SocketAddr) -> Registration {
        let stop = Arc::new(Notify::new());
        let mut inner = self.lock();

        let generation = inner.next_generation;
        inner.next_generation += 1;
        let index = inner.connections.insert(Entry {
            generation,
            peer,
            stop: Arc::clone(&stop),
        });
        let active = inner.connections.len();
        drop(inner);

        self.metrics.counter("connections.accepted", 1);
        self.metrics.gauge("connections.active", active as u64);

        Registration {
            id: ConnectionId { index, generation },
            stop,
        }
    }

    /// Stop a connection. Returns false if it was already stopped.
    pub fn stop(&self, id: ConnectionId) -> bool {
        let mut inner = self.lock();

        let current = inner
            .connections
            .get(id.index)
            .is_some_and(|entry| entry.generation == id.generation);
        if !current {
            return false;
        }

        let entry = inner.connections.remove(id.index);
        let active = inner.connections.len();
        drop(inner);

        entry.stop.notify_one();
        self.metrics.gauge("connections.active", active as u64);
        debug!(conn = %id, peer = %entry.peer, "Connection stopped");
        true
    }

    /// Stop every live connection. Returns how many were stopped.
    pub fn stop_all(&self) -> usize {
        let entries: Vec<Entry> = self.lock().connections.drain().collect();

        for entry in &entries {
            entry.stop.notify_one();
        }
        self.metrics.gauge("connections.active", 0);
        entries.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testing::RecordingMetrics;
    use crate::metrics::NullMetrics;
    use std::time::Duration;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_register_and_stop() {
        let manager = ConnectionManager::new(NullMetrics::shared());
        let a = manager.register(peer());
        let b = manager.register(peer());
        assert_eq!(manager.len(), 2);
        assert_ne!(a.id, b.id);

        assert!(manager.stop(a.id));
        assert_eq!(manager.len(), 1);

        // Idempotent
        assert!(!manager.stop(a.id));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_stale_id_does_not_stop_reused_slot() {
        let manager = ConnectionManager::new(NullMetrics::shared());
        let old = manager.register(peer());
        assert!(manager.stop(old.id));

        let new = manager.register(peer());
        assert_eq!(new.id.index, old.id.index);

        assert!(!manager.stop(old.id));
        assert_eq!(manager.len(), 1);
        assert!(manager.stop(new.id));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_stop_all() {
        let manager = ConnectionManager::new(NullMetrics::shared());
        let regs: Vec<_> = (0..5).map(|_| manager.register(peer())).collect();

        assert_eq!(manager.stop_all(), 5);
        assert!(manager.is_empty());
        for reg in &regs {
            assert!(!manager.stop(reg.id));
        }
        assert_eq!(manager.stop_all(), 0);
    }

    #[tokio::test]
    async fn test_stop_before_wait_is_not_lost() {
        let manager = ConnectionManager::new(NullMetrics::shared());
        let reg = manager.register(peer());

        manager.stop(reg.id);

        tokio::time::timeout(Duration::from_secs(1), reg.stop.notified())
            .await
            .expect("stop signal should be stored as a permit");
    }

    #[test]
    fn test_connection_metrics() {
        let metrics = Arc::new(RecordingMetrics::default());
        let manager = ConnectionManager::new(metrics.clone());

        let a = manager.register(peer());
        manager.register(peer());
        assert_eq!(metrics.counter_value("connections.accepted"), 2);
        assert_eq!(metrics.gauge_value("connections.active"), Some(2));

        manager.stop(a.id);
        assert_eq!(metrics.gauge_value("connections.active"), Some(1));

        manager.stop_all();
        assert_eq!(metrics.gauge_value("connections.active"), Some(0));
    }
}
