use axum::{extract::State, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::observability::StatsSnapshot;

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub idle_upstream_connections: usize,
}

#[derive(Debug, Serialize)]
pub struct RouteStatus {
    pub name: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub destination: String,
    pub rewrite: Option<String>,
}

pub async fn get_status() -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
    })
}

pub async fn get_stats(State(state): State<AdminState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        stats: state.stats.snapshot(),
        idle_upstream_connections: state.pool.total_idle(),
    })
}

pub async fn get_routes(State(state): State<AdminState>) -> Json<Vec<RouteStatus>> {
    let table = state.routes.load();
    let routes = table
        .routes()
        .iter()
        .map(|route| RouteStatus {
            name: route.name.clone(),
            host: route.host.as_ref().map(|h| h.to_string()),
            path: route.path.to_string(),
            destination: route.destination.to_string(),
            rewrite: route.destination.rewritten_target().map(str::to_string),
        })
        .collect();
    Json(routes)
}
