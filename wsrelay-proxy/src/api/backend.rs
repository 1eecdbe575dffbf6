//! The backend registration endpoint.
//!
//! Agents dial out to this path and hold the resulting WebSocket for their
//! whole lifetime. The token must carry a non-empty `reportedUuid` claim,
//! which becomes the backend id; a token without it is rejected before the
//! upgrade. This is a trusted egress, so no origin checks apply.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, WebSocketUpgrade};
use axum::response::{IntoResponse as _, Response};
use axum::routing::any;
use http::{HeaderMap, StatusCode};
use tracing::instrument;

use crate::api::errors::ApiError;
use crate::auth::{TokenValidator, authenticate};
use crate::services::registry::BackendRegistry;

pub(crate) struct BackendArgs {
    pub(crate) registry: BackendRegistry,
    pub(crate) validator: Arc<TokenValidator>,
}

/// Creates a `Router` with the single backend registration route.
pub(crate) fn routes(path: &str, args: BackendArgs) -> Router {
    let BackendArgs { registry, validator } = args;
    Router::new().route(
        path,
        any(
            move |headers: HeaderMap,
                  Query(params): Query<HashMap<String, String>>,
                  ws: WebSocketUpgrade| {
                register(registry.clone(), Arc::clone(&validator), headers, params, ws)
            },
        ),
    )
}

#[instrument(level = "debug", skip_all)]
async fn register(
    registry: BackendRegistry,
    validator: Arc<TokenValidator>,
    headers: HeaderMap,
    params: HashMap<String, String>,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = match authenticate(&validator, &headers, &params) {
        Ok(claims) => claims,
        Err(err) => return ApiError::from(err).into_response(),
    };
    // a valid token without a usable backend id is a malformed registration,
    // not an authentication failure; reject it before the upgrade
    let backend_id = match claims.backend_id() {
        Ok(backend_id) => backend_id.to_owned(),
        Err(err) => {
            tracing::warn!("rejecting backend registration: {err}");
            return (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()).into_response();
        }
    };

    ws.on_failed_upgrade({
        let backend_id = backend_id.clone();
        move |err| {
            tracing::warn!(backend_id, "could not establish backend websocket: {err:?}");
        }
    })
    .on_upgrade(move |socket| async move {
        tracing::info!(backend_id, "registering backend");
        registry.add(&backend_id, socket);
    })
}
