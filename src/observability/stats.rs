//! In-process counters for the admin endpoint.
//!
//! Every recording call also feeds the `metrics` facade, so the admin
//! snapshot and the Prometheus exporter agree.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use http::{Method, StatusCode};
use serde::Serialize;

use crate::net::connection::{ConnectionGuard, ConnectionId, ConnectionSide, ConnectionTracker};
use crate::observability::metrics;

#[derive(Debug)]
struct StatsInner {
    clients: ConnectionTracker,
    upstreams: ConnectionTracker,
    requests: AtomicU64,
    responses: AtomicU64,
    in_flight: AtomicI64,
    pool_hits: AtomicU64,
    connect_failures: AtomicU64,
    tunnels: AtomicU64,
}

impl Default for StatsInner {
    fn default() -> Self {
        Self {
            clients: ConnectionTracker::new(ConnectionSide::Client),
            upstreams: ConnectionTracker::new(ConnectionSide::Upstream),
            requests: AtomicU64::new(0),
            responses: AtomicU64::new(0),
            in_flight: AtomicI64::new(0),
            pool_hits: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            tunnels: AtomicU64::new(0),
        }
    }
}

/// Shared, cheaply cloneable counters.
#[derive(Debug, Clone, Default)]
pub struct ProxyStats {
    inner: Arc<StatsInner>,
}

/// Point-in-time view of [`ProxyStats`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub client_connections_open: u64,
    pub client_connections_total: u64,
    pub upstream_connections_open: u64,
    pub upstream_connections_total: u64,
    pub requests_total: u64,
    pub responses_total: u64,
    pub requests_in_flight: i64,
    pub pool_hits_total: u64,
    pub connect_failures_total: u64,
    pub tunnels_total: u64,
}

/// Guard for an open client connection; also updates the metrics gauge.
#[derive(Debug)]
pub struct ClientGuard {
    _guard: ConnectionGuard,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        metrics::record_client_closed();
    }
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_client(&self, id: ConnectionId) -> ClientGuard {
        metrics::record_client_opened();
        ClientGuard {
            _guard: self.inner.clients.track(id),
        }
    }

    pub fn track_upstream(&self, id: ConnectionId) -> ConnectionGuard {
        metrics::record_upstream_connect();
        self.inner.upstreams.track(id)
    }

    pub fn request_received(&self, method: &Method) {
        metrics::record_request(method);
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// A pending request left the unanswered queue, answered or not.
    pub fn request_settled(&self) {
        self.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn response_relayed(&self, status: StatusCode) {
        metrics::record_response(status);
        self.inner.responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pool_hit(&self) {
        metrics::record_pool_hit();
        self.inner.pool_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        metrics::record_connect_failure();
        self.inner.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_opened(&self) {
        metrics::record_tunnel();
        self.inner.tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = &self.inner;
        StatsSnapshot {
            client_connections_open: inner.clients.active_count(),
            client_connections_total: inner.clients.total_count(),
            upstream_connections_open: inner.upstreams.active_count(),
            upstream_connections_total: inner.upstreams.total_count(),
            requests_total: inner.requests.load(Ordering::Relaxed),
            responses_total: inner.responses.load(Ordering::Relaxed),
            requests_in_flight: inner.in_flight.load(Ordering::Relaxed),
            pool_hits_total: inner.pool_hits.load(Ordering::Relaxed),
            connect_failures_total: inner.connect_failures.load(Ordering::Relaxed),
            tunnels_total: inner.tunnels.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_activity() {
        let stats = ProxyStats::new();
        let client = stats.track_client(ConnectionId::next());
        let upstream = stats.track_upstream(ConnectionId::next());
        stats.request_received(&Method::GET);
        stats.response_relayed(StatusCode::OK);
        stats.request_settled();
        stats.pool_hit();

        let snap = stats.snapshot();
        assert_eq!(snap.client_connections_open, 1);
        assert_eq!(snap.upstream_connections_open, 1);
        assert_eq!(snap.requests_total, 1);
        assert_eq!(snap.requests_in_flight, 0);
        assert_eq!(snap.pool_hits_total, 1);

        drop(client);
        drop(upstream);
        let snap = stats.snapshot();
        assert_eq!(snap.client_connections_open, 0);
        assert_eq!(snap.client_connections_total, 1);
    }
}
