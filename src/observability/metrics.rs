//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_client_connections_total` (counter)
//! - `proxy_client_connections_active` (gauge)
//! - `proxy_requests_total` (counter): by method
//! - `proxy_responses_total` (counter): by status
//! - `proxy_upstream_connects_total` (counter)
//! - `proxy_upstream_connect_failures_total` (counter)
//! - `proxy_pool_hits_total` (counter)
//! - `proxy_tunnels_total` (counter)
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - The Prometheus exporter is optional and serves its own scrape endpoint

use std::net::SocketAddr;

use http::{Method, StatusCode};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install Prometheus exporter"),
    }
}

pub fn record_client_opened() {
    metrics::counter!("proxy_client_connections_total").increment(1);
    metrics::gauge!("proxy_client_connections_active").increment(1.0);
}

pub fn record_client_closed() {
    metrics::gauge!("proxy_client_connections_active").decrement(1.0);
}

pub fn record_request(method: &Method) {
    metrics::counter!("proxy_requests_total", "method" => method.to_string()).increment(1);
}

pub fn record_response(status: StatusCode) {
    metrics::counter!("proxy_responses_total", "status" => status.as_u16().to_string()).increment(1);
}

pub fn record_upstream_connect() {
    metrics::counter!("proxy_upstream_connects_total").increment(1);
}

pub fn record_connect_failure() {
    metrics::counter!("proxy_upstream_connect_failures_total").increment(1);
}

pub fn record_pool_hit() {
    metrics::counter!("proxy_pool_hits_total").increment(1);
}

pub fn record_tunnel() {
    metrics::counter!("proxy_tunnels_total").increment(1);
}
