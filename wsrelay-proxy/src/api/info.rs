//! Health and version endpoints.
//!
//! - `/health` – liveness probe, always `200 OK` once the router serves.
//! - `/version` – cargo package name and version.
//!
//! The endpoints include a `Cache-Control: no-cache` header to prevent
//! caching of responses.

use axum::{
    Router,
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use tower_http::set_header::SetResponseHeaderLayer;

/// Create a router containing the health and version endpoints.
///
/// All endpoints have `Cache-Control: no-cache` set.
pub(crate) fn routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
}

/// Returns `200 OK` with a plain `"healthy"` response.
async fn health() -> impl IntoResponse {
    (StatusCode::OK, "healthy")
}

/// Responds with cargo package name and version.
async fn version() -> impl IntoResponse {
    (
        StatusCode::OK,
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")),
    )
}
