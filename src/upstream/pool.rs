//! Pool of idle upstream connections.
//!
//! # Responsibilities
//! - Keep idle keep-alive connections per `host:port`, oldest first
//! - Hand each idle connection to at most one caller
//! - Bound idle connections per destination
//!
//! # Design Decisions
//! - One `DashMap` entry per key; queue operations hold only that shard's lock
//!   and never perform I/O
//! - A popped connection that has since disconnected is discarded and the
//!   caller opens a fresh one
//! - Overflow closes the oldest idle connection

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;

use crate::upstream::connection::UpstreamHandle;

/// Default bound on idle connections kept per destination.
pub const DEFAULT_MAX_IDLE_PER_HOST: usize = 32;

#[derive(Debug, Clone)]
pub struct UpstreamPool {
    idle: Arc<DashMap<String, VecDeque<UpstreamHandle>>>,
    max_idle_per_host: usize,
}

impl Default for UpstreamPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE_PER_HOST)
    }
}

impl UpstreamPool {
    /// `max_idle_per_host == 0` disables pooling.
    pub fn new(max_idle_per_host: usize) -> Self {
        Self {
            idle: Arc::new(DashMap::new()),
            max_idle_per_host,
        }
    }

    /// Pop the oldest idle connection for `key`.
    pub fn acquire(&self, key: &str) -> Option<UpstreamHandle> {
        let handle = {
            let mut queue = self.idle.get_mut(key)?;
            queue.pop_front()?
        };
        self.idle.remove_if(key, |_, queue| queue.is_empty());

        if handle.is_connected() {
            tracing::debug!(key = %key, upstream_id = %handle.id(), "Reusing pooled upstream connection");
            Some(handle)
        } else {
            tracing::debug!(key = %key, upstream_id = %handle.id(), "Discarding disconnected pooled connection");
            None
        }
    }

    /// Return a connection after a clean keep-alive exchange.
    /// Returns false when the connection was not kept.
    pub fn release(&self, key: &str, handle: UpstreamHandle) -> bool {
        if self.max_idle_per_host == 0 || !handle.is_connected() {
            return false;
        }
        let evicted = {
            let mut queue = self.idle.entry(key.to_string()).or_default();
            queue.push_back(handle);
            if queue.len() > self.max_idle_per_host {
                queue.pop_front()
            } else {
                None
            }
        };
        if let Some(oldest) = evicted {
            tracing::debug!(key = %key, upstream_id = %oldest.id(), "Idle limit reached, closing oldest connection");
            oldest.close();
        }
        true
    }

    /// Drop and close every idle connection for `key`.
    pub fn evict(&self, key: &str) -> usize {
        match self.idle.remove(key) {
            Some((_, queue)) => {
                let count = queue.len();
                queue.iter().for_each(UpstreamHandle::close);
                count
            }
            None => 0,
        }
    }

    /// Remove a specific connection (it disconnected while idle).
    pub fn remove(&self, key: &str, handle: &UpstreamHandle) {
        if let Some(mut queue) = self.idle.get_mut(key) {
            queue.retain(|h| h.id() != handle.id());
        }
        self.idle.remove_if(key, |_, queue| queue.is_empty());
    }

    pub fn idle_count(&self, key: &str) -> usize {
        self.idle.get(key).map(|q| q.len()).unwrap_or(0)
    }

    pub fn total_idle(&self) -> usize {
        self.idle.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn max_idle_per_host(&self) -> usize {
        self.max_idle_per_host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionId;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn handle(key: &str) -> UpstreamHandle {
        // The receiver is leaked into the test so the channel stays open.
        let (handle, rx) = UpstreamHandle::new(ConnectionId::next(), key);
        std::mem::forget(rx);
        handle
    }

    #[test]
    fn fifo_per_key() {
        let pool = UpstreamPool::default();
        let first = handle("a:80");
        let second = handle("a:80");
        pool.release("a:80", first.clone());
        pool.release("a:80", second.clone());

        assert_eq!(pool.acquire("a:80").unwrap().id(), first.id());
        assert_eq!(pool.acquire("a:80").unwrap().id(), second.id());
        assert!(pool.acquire("a:80").is_none());
        assert!(pool.acquire("b:80").is_none());
    }

    #[test]
    fn disconnected_entries_are_discarded() {
        let pool = UpstreamPool::default();
        let dead = handle("a:80");
        pool.release("a:80", dead.clone());
        dead.mark_disconnected();
        assert!(pool.acquire("a:80").is_none());
        assert_eq!(pool.idle_count("a:80"), 0);
    }

    #[test]
    fn bound_closes_oldest() {
        let pool = UpstreamPool::new(1);
        let old = handle("a:80");
        let new = handle("a:80");
        pool.release("a:80", old.clone());
        pool.release("a:80", new.clone());
        assert!(!old.is_connected());
        assert_eq!(pool.acquire("a:80").unwrap().id(), new.id());
    }

    #[test]
    fn zero_bound_disables_pooling() {
        let pool = UpstreamPool::new(0);
        assert!(!pool.release("a:80", handle("a:80")));
        assert_eq!(pool.total_idle(), 0);
    }

    #[test]
    fn evict_closes_all() {
        let pool = UpstreamPool::default();
        let h = handle("a:80");
        pool.release("a:80", h.clone());
        assert_eq!(pool.evict("a:80"), 1);
        assert!(!h.is_connected());
    }

    #[test]
    fn concurrent_acquire_never_shares_a_connection() {
        let pool = UpstreamPool::new(1000);
        for _ in 0..500 {
            pool.release("a:80", handle("a:80"));
        }
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let seen = seen.clone();
                std::thread::spawn(move || {
                    while let Some(h) = pool.acquire("a:80") {
                        assert!(seen.lock().unwrap().insert(h.id()), "connection handed out twice");
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 500);
    }
}
