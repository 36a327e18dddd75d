//! Bearer-token guard for the admin API. An empty `admin.api_key` leaves the
//! API open, which is the default for the loopback-bound admin address.

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::admin::AdminState;

pub async fn admin_auth_middleware(
    State(state): State<AdminState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if state.api_key.is_empty() {
        return Ok(next.run(request).await);
    }

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(state.api_key.as_str()) {
        return Ok(next.run(request).await);
    }

    tracing::info!(path = %request.uri().path(), "Admin request rejected: missing or wrong bearer token");
    Err(StatusCode::UNAUTHORIZED)
}
