//! The fan-out handler.
//!
//! For tokens that enumerate multiple `(url, token)` targets (typical for
//! cluster-wide metrics), this handler opens one session per target across as
//! many backends and merges everything the targets emit onto one client
//! WebSocket. Writes to the client are serialized behind a mutex; a countdown
//! of still-live sessions closes the client once every target has finished.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use axum::extract::{Query, WebSocketUpgrade};
use axum::response::{IntoResponse as _, Response};
use axum::routing::any;
use futures::stream::SplitSink;
use futures::{SinkExt as _, StreamExt as _};
use http::{HeaderMap, Uri};
use tokio::sync::{Mutex, mpsc};
use tracing::instrument;
use uuid::Uuid;
use wsrelay_types::{Frame, FrameType};

use crate::api::errors::ApiError;
use crate::api::frontend::{CLOSE_HANDSHAKE_DEADLINE, PAYLOAD_WRITE_DEADLINE};
use crate::auth::{AuthError, TokenValidator, authenticate};
use crate::services::registry::BackendRegistry;

pub(crate) struct StatsArgs {
    pub(crate) registry: BackendRegistry,
    pub(crate) validator: Arc<TokenValidator>,
}

struct StatsTarget {
    backend_id: String,
    url: String,
}

/// Creates a `Router` dispatching every configured fan-out pattern.
pub(crate) fn routes(patterns: &[String], args: StatsArgs) -> Router {
    let StatsArgs { registry, validator } = args;
    let mut router = Router::new();
    for pattern in patterns {
        let registry = registry.clone();
        let validator = Arc::clone(&validator);
        router = router.route(
            pattern,
            any(
                move |headers: HeaderMap,
                      Query(params): Query<HashMap<String, String>>,
                      uri: Uri,
                      ws: WebSocketUpgrade| {
                    handle(registry.clone(), Arc::clone(&validator), headers, params, uri, ws)
                },
            ),
        );
    }
    router
}

#[instrument(level = "debug", skip_all, fields(uri = %uri))]
async fn handle(
    registry: BackendRegistry,
    validator: Arc<TokenValidator>,
    headers: HeaderMap,
    params: HashMap<String, String>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let multi_host = is_multi_host(uri.path());
    let targets = match resolve_targets(&registry, &validator, &headers, &params, &uri, multi_host)
    {
        Ok(targets) => targets,
        Err(err) => return ApiError::from(err).into_response(),
    };

    ws.on_failed_upgrade(|err| {
        tracing::warn!("could not establish client websocket: {err:?}");
    })
    .on_upgrade(move |socket| fan_out(registry, targets, socket))
}

/// Paths ending in `project[/]` or `service[/]` address a whole cluster and
/// expect the target list inside the token.
fn is_multi_host(path: &str) -> bool {
    ["project", "project/", "service", "service/"]
        .iter()
        .any(|suffix| path.ends_with(suffix))
}

fn resolve_targets(
    registry: &BackendRegistry,
    validator: &TokenValidator,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
    uri: &Uri,
    multi_host: bool,
) -> Result<Vec<StatsTarget>, AuthError> {
    let claims = authenticate(validator, headers, params)?;

    if !multi_host {
        let backend_id = claims.host_id()?;
        if !registry.has_backend(backend_id) {
            return Err(AuthError::UnknownBackend(backend_id.to_owned()));
        }
        let url = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| uri.path().to_owned());
        return Ok(vec![StatsTarget {
            backend_id: backend_id.to_owned(),
            url,
        }]);
    }

    let targets = claims.fanout_targets().ok_or(AuthError::MissingClaim("project"))?;
    targets
        .iter()
        .map(|target| {
            let inner = validator.validate(&target.token)?;
            let backend_id = inner.host_id()?;
            if !registry.has_backend(backend_id) {
                return Err(AuthError::UnknownBackend(backend_id.to_owned()));
            }
            Ok(StatsTarget {
                backend_id: backend_id.to_owned(),
                // the agent needs the inner token to authorize its own leg
                url: format!("{}?token={}", target.url, target.token),
            })
        })
        .collect()
}

/// Opens one session per target and merges their replies onto the client.
#[instrument(level = "debug", skip_all, fields(targets = targets.len()))]
async fn fan_out(registry: BackendRegistry, targets: Vec<StatsTarget>, socket: WebSocket) {
    let (sink, mut stream) = socket.split();
    let sink = Arc::new(Mutex::new(sink));
    let live = Arc::new(AtomicUsize::new(targets.len()));

    let mut sessions: Vec<(String, Uuid)> = Vec::with_capacity(targets.len());
    let mut pumps = Vec::with_capacity(targets.len());
    let mut bound_all = true;
    for target in &targets {
        let Ok((key, inbound)) = registry.initialize_client(&target.backend_id).await else {
            bound_all = false;
            break;
        };
        sessions.push((target.backend_id.clone(), key));
        pumps.push(tokio::spawn(fanout_pump(
            inbound,
            Arc::clone(&sink),
            Arc::clone(&live),
        )));
        if registry
            .connect(&target.backend_id, key, &target.url)
            .await
            .is_err()
        {
            bound_all = false;
            break;
        }
    }

    if bound_all {
        // client messages are not forwarded anywhere; draining them just
        // detects when the client goes away
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }

    for (backend_id, key) in &sessions {
        let _ = registry.close(backend_id, *key).await;
    }
    {
        let mut sink = sink.lock().await;
        let close = sink.send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        })));
        let _ = tokio::time::timeout(CLOSE_HANDSHAKE_DEADLINE, close).await;
    }
    for pump in pumps {
        let _ = pump.await;
    }
}

/// Reply pump for one fan-out leg. `Body` frames go to the shared client
/// sink; the leg that consumes the last `Close` finishes the client socket.
async fn fanout_pump(
    mut inbound: mpsc::Receiver<Frame>,
    sink: Arc<Mutex<SplitSink<WebSocket, Message>>>,
    live: Arc<AtomicUsize>,
) {
    while let Some(frame) = inbound.recv().await {
        match frame.frame_type {
            FrameType::Body => {
                let mut sink = sink.lock().await;
                let write = sink.send(Message::text(frame.body));
                match tokio::time::timeout(PAYLOAD_WRITE_DEADLINE, write).await {
                    Ok(Ok(())) => {}
                    _ => {
                        tracing::debug!("client write failed, dropping fan-out leg");
                        break;
                    }
                }
            }
            FrameType::Close => {
                if live.fetch_sub(1, Ordering::AcqRel) == 1 {
                    // every leg is done, finish the client socket
                    let mut sink = sink.lock().await;
                    let close = sink.send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "".into(),
                    })));
                    let _ = tokio::time::timeout(CLOSE_HANDSHAKE_DEADLINE, close).await;
                }
                break;
            }
            FrameType::Connect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_host_is_a_path_suffix_check() {
        assert!(is_multi_host("/v1/stats/project"));
        assert!(is_multi_host("/v1/stats/project/"));
        assert!(is_multi_host("/v1/stats/service"));
        assert!(is_multi_host("/v1/stats/service/"));
        assert!(!is_multi_host("/v1/stats/container"));
        assert!(!is_multi_host("/v1/projects/1/stats"));
    }
}
