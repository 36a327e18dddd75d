//! Connection identity and lifetime tracking.
//!
//! # Responsibilities
//! - Hand out `conn-N` identifiers; client and upstream sockets draw from one
//!   sequence, so an ID is unambiguous in logs
//! - Count open and total connections per side with drop guards
//! - Log how long each connection lived when it closes

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier shared by client and upstream connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which end of the proxy a connection faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSide {
    Client,
    Upstream,
}

impl fmt::Display for ConnectionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionSide::Client => "client",
            ConnectionSide::Upstream => "upstream",
        })
    }
}

/// Open and total counts for one side.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    side: ConnectionSide,
    open: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new(side: ConnectionSide) -> Self {
        Self {
            side,
            open: Arc::new(AtomicU64::new(0)),
            total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Count `id` as open until the returned guard drops.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        self.open.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            open: Arc::clone(&self.open),
            side: self.side,
            id,
            opened_at: Instant::now(),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.open.load(Ordering::SeqCst)
    }

    pub fn total_count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct ConnectionGuard {
    open: Arc<AtomicU64>,
    side: ConnectionSide,
    id: ConnectionId,
    opened_at: Instant,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(
            connection_id = %self.id,
            side = %self.side,
            lifetime_ms = self.opened_at.elapsed().as_millis() as u64,
            "Connection closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_and_prefixed() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn-"));
    }

    #[test]
    fn guards_keep_counts() {
        let tracker = ConnectionTracker::new(ConnectionSide::Upstream);
        let first = tracker.track(ConnectionId::next());
        let second = tracker.track(ConnectionId::next());
        assert_eq!(tracker.active_count(), 2);

        drop(first);
        assert_eq!(tracker.active_count(), 1);
        assert!(second.id().to_string().starts_with("conn-"));
        drop(second);
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.total_count(), 2);
    }
}
