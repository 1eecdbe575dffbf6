//! The frontend WebSocket entry points.
//!
//! Binds one client WebSocket to one session on the backend its token names.
//! The session is announced to the backend with a `Connect` frame carrying
//! the original request URL before the client read loop starts, so the
//! backend always sees `Connect` strictly before any `Body`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use axum::extract::{Query, WebSocketUpgrade};
use axum::response::{IntoResponse as _, Response};
use axum::routing::any;
use futures::stream::SplitSink;
use futures::{SinkExt as _, StreamExt as _};
use http::{HeaderMap, Uri};
use tokio::sync::mpsc;
use tracing::instrument;
use wsrelay_types::{Frame, FrameType};

use crate::api::errors::{ApiError, is_peer_disconnect};
use crate::auth::{AuthError, TokenValidator, authenticate};
use crate::services::registry::BackendRegistry;

/// Write deadline for payload frames towards the client. A client that
/// cannot keep up within this window is dropped.
pub(crate) const PAYLOAD_WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Deadline for the closing handshake.
pub(crate) const CLOSE_HANDSHAKE_DEADLINE: Duration = Duration::from_secs(1);

pub(crate) struct FrontendArgs {
    pub(crate) registry: BackendRegistry,
    pub(crate) validator: Arc<TokenValidator>,
}

/// Creates a `Router` dispatching every configured frontend pattern to the
/// WebSocket handler.
pub(crate) fn routes(patterns: &[String], args: FrontendArgs) -> Router {
    let FrontendArgs { registry, validator } = args;
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
    let backend_id = match authorize(&registry, &validator, &headers, &params) {
        Ok(backend_id) => backend_id,
        Err(err) => return ApiError::from(err).into_response(),
    };

    let url = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| uri.path().to_owned());

    ws.on_failed_upgrade(|err| {
        tracing::warn!("could not establish client websocket: {err:?}");
    })
    .on_upgrade(move |socket| run_session(registry, backend_id, url, socket))
}

/// The token must name a connected backend; anything else is an
/// authentication failure.
pub(crate) fn authorize(
    registry: &BackendRegistry,
    validator: &TokenValidator,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Result<String, AuthError> {
    let claims = authenticate(validator, headers, params)?;
    let backend_id = claims.host_id()?;
    if !registry.has_backend(backend_id) {
        return Err(AuthError::UnknownBackend(backend_id.to_owned()));
    }
    Ok(backend_id.to_owned())
}

/// The whole life-cycle of one client session.
#[instrument(level = "debug", skip_all, fields(backend_id = %backend_id))]
async fn run_session(registry: BackendRegistry, backend_id: String, url: String, mut socket: WebSocket) {
    // registration may have vanished between auth and upgrade
    let Ok(mx) = registry.lookup(&backend_id) else {
        let _ = socket.close().await;
        return;
    };
    let (key, inbound) = mx.initialize_client().await;
    let (sink, mut stream) = socket.split();
    let pump = tokio::spawn(reply_pump(inbound, sink));

    if mx.connect(key, &url).await.is_err() {
        mx.close(key, false).await;
        let _ = pump.await;
        return;
    }

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                if !is_peer_disconnect(&err) {
                    tracing::debug!("client read failed: {err:?}");
                }
                break;
            }
        };
        let body = match message {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(_) => break,
            _ => continue,
        };
        if mx.send(key, body).await.is_err() {
            break;
        }
    }

    mx.close(key, true).await;
    // closing the session ends the pump, which performs the close handshake
    let _ = pump.await;
}

/// Forwards backend replies to the client until the session closes.
///
/// `Body` frames are written with [`PAYLOAD_WRITE_DEADLINE`]; a `Close` frame
/// or queue end finishes the pump, which then runs a best-effort closing
/// handshake. Dropping the inbound receiver on the way out unblocks the
/// multiplexer reader should it be mid-delivery for this session.
async fn reply_pump(mut inbound: mpsc::Receiver<Frame>, mut sink: SplitSink<WebSocket, Message>) {
    while let Some(frame) = inbound.recv().await {
        match frame.frame_type {
            FrameType::Body => {
                let write = sink.send(Message::text(frame.body));
                match tokio::time::timeout(PAYLOAD_WRITE_DEADLINE, write).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        if !is_peer_disconnect(&err) {
                            tracing::debug!("client write failed: {err:?}");
                        }
                        break;
                    }
                    Err(_) => {
                        tracing::debug!("client write deadline exceeded, dropping session");
                        break;
                    }
                }
            }
            FrameType::Close => break,
            // backends do not announce sessions to clients
            FrameType::Connect => {}
        }
    }
    let close = sink.send(Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "".into(),
    })));
    let _ = tokio::time::timeout(CLOSE_HANDSHAKE_DEADLINE, close).await;
}
