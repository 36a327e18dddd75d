//! Read-only admin API.
//!
//! # Endpoints
//! - `GET /admin/status`: version and liveness
//! - `GET /admin/stats`: `ProxyStats` snapshot plus idle pool size
//! - `GET /admin/routes`: current route table
//!
//! Requests are traced with `tower-http`; a bearer token is required when
//! `admin.api_key` is set.

pub mod auth;
pub mod handlers;

use axum::{middleware, routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::observability::ProxyStats;
use crate::routing::table::RouteTableStore;
use crate::upstream::UpstreamPool;

use self::auth::admin_auth_middleware;
use self::handlers::*;

/// Shared state for admin handlers.
#[derive(Debug, Clone)]
pub struct AdminState {
    pub stats: ProxyStats,
    pub pool: UpstreamPool,
    pub routes: RouteTableStore,
    /// Expected bearer token; empty disables authentication.
    pub api_key: String,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/stats", get(get_stats))
        .route("/admin/routes", get(get_routes))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
