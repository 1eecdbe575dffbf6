//! The HTTP adapter.
//!
//! Adapts one plain HTTP request/response exchange onto the multiplexer
//! protocol. The request body is streamed towards the backend in 4 KiB
//! chunks, each wrapped in an [`HttpMessage`]; the response is rebuilt from
//! the response-shaped messages the agent sends back. The upload runs
//! synchronously against the bounded outbound queue, so a slow backend
//! naturally blocks the client upload.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Query, RawPathParams, Request};
use axum::response::{IntoResponse as _, Response};
use axum::routing::any;
use futures::StreamExt as _;
use http::StatusCode;
use tokio::sync::mpsc;
use tracing::instrument;
use uuid::Uuid;
use wsrelay_types::{CONTAINER_PROXY_PATH, Frame, FrameType, HttpMessage};

use crate::api::errors::ApiError;
use crate::auth::{AuthError, Claims, TokenValidator, authenticate};
use crate::proxy_protocol::add_forwarded_headers;
use crate::services::multiplexer::QUEUE_CAPACITY;
use crate::services::registry::BackendRegistry;
use crate::services::token_lookup::{LookupRequest, TokenLookup};

/// Upload chunk size.
const CHUNK_SIZE: usize = 4096;

#[derive(Clone)]
pub(crate) struct HttpArgs {
    pub(crate) registry: BackendRegistry,
    pub(crate) validator: Arc<TokenValidator>,
    pub(crate) token_lookup: Option<Arc<TokenLookup>>,
    pub(crate) https_ports: Arc<HashSet<u16>>,
}

/// Creates a `Router` dispatching every configured HTTP-adapter pattern.
pub(crate) fn routes(patterns: &[String], args: HttpArgs) -> Router {
    let mut router = Router::new();
    for pattern in patterns {
        let args = args.clone();
        router = router.route(
            pattern,
            any(
                move |Query(params): Query<HashMap<String, String>>,
                      path_params: RawPathParams,
                      peer: Result<ConnectInfo<SocketAddr>, axum::extract::rejection::ExtensionRejection>,
                      request: Request| {
                    let path_params: HashMap<String, String> = path_params
                        .iter()
                        .map(|(name, value)| (name.to_owned(), value.to_owned()))
                        .collect();
                    let args = args.clone();
                    async move {
                        handle(args, params, path_params, peer.ok().map(|info| info.0), request).await
                    }
                },
            ),
        );
    }
    router
}

#[instrument(level = "debug", skip_all, fields(method, backend_id))]
async fn handle(
    args: HttpArgs,
    params: HashMap<String, String>,
    path_params: HashMap<String, String>,
    peer: Option<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();

    let claims = match authorize(&args, &parts.headers, &params, &path_params).await {
        Ok(claims) => claims,
        Err(err) => return err.into_response(),
    };
    let backend_id = match claims.host_id() {
        Ok(backend_id) => backend_id.to_owned(),
        Err(err) => return ApiError::from(err).into_response(),
    };
    tracing::Span::current().record("method", parts.method.as_str());
    tracing::Span::current().record("backend_id", backend_id.as_str());

    let (key, inbound) = match args.registry.initialize_client(&backend_id).await {
        Ok(session) => session,
        Err(err) => return ApiError::from(err).into_response(),
    };
    // the backend routes on this literal path to find its HTTP handler
    if let Err(err) = args
        .registry
        .connect(&backend_id, key, CONTAINER_PROXY_PATH)
        .await
    {
        let _ = args.registry.close(&backend_id, key).await;
        return ApiError::from(err).into_response();
    }

    let head = request_head(&claims, &parts, &path_params, peer, &args.https_ports);
    if let Err(err) = upload(&args.registry, &backend_id, key, head, body).await {
        let _ = args.registry.close(&backend_id, key).await;
        return err.into_response();
    }

    respond(args.registry, backend_id, key, inbound).await
}

/// Primary JWT check, with a fallback to the cached control-plane lookup for
/// callers that present API keys or cookies instead of a proxy token.
async fn authorize(
    args: &HttpArgs,
    headers: &http::HeaderMap,
    params: &HashMap<String, String>,
    path_params: &HashMap<String, String>,
) -> Result<Claims, ApiError> {
    let primary = authenticate(&args.validator, headers, params).and_then(|claims| {
        let backend_id = claims.host_id()?.to_owned();
        if args.registry.has_backend(&backend_id) {
            Ok(claims)
        } else {
            Err(AuthError::UnknownBackend(backend_id))
        }
    });
    let primary_err = match primary {
        Ok(claims) => return Ok(claims),
        Err(err) => err,
    };

    let Some(lookup) = &args.token_lookup else {
        return Err(ApiError::Auth(primary_err));
    };
    tracing::debug!("primary token check failed ({primary_err}), trying token lookup");
    let lookup_request = lookup_request(headers, path_params);
    let token = lookup.lookup(&lookup_request).await.map_err(|err| {
        tracing::debug!("token lookup failed: {err:?}");
        ApiError::Auth(primary_err)
    })?;
    let claims = args.validator.validate(&token).map_err(ApiError::Auth)?;
    let backend_id = claims.host_id().map_err(ApiError::Auth)?.to_owned();
    if !args.registry.has_backend(&backend_id) {
        return Err(ApiError::Auth(AuthError::UnknownBackend(backend_id)));
    }
    Ok(claims)
}

fn lookup_request(
    headers: &http::HeaderMap,
    path_params: &HashMap<String, String>,
) -> LookupRequest {
    let header = |name: http::header::HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };
    let token_cookie = headers
        .get(http::header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .map(str::trim)
                .find_map(|cookie| cookie.strip_prefix("token="))
        })
        .map(str::to_owned);
    LookupRequest {
        authorization: header(http::header::AUTHORIZATION),
        project_header: headers
            .get("x-api-project-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned),
        token_cookie,
        project_var: path_params.get("project").cloned(),
        service_var: path_params.get("service").cloned(),
    }
}

/// The first message of the tunneled request: method, rewritten URL, host and
/// headers. The URL points at the agent-local address from the token's
/// `proxy` claim.
fn request_head(
    claims: &Claims,
    parts: &http::request::Parts,
    path_params: &HashMap<String, String>,
    peer: Option<SocketAddr>,
    https_ports: &HashSet<u16>,
) -> HttpMessage {
    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_owned())
                .or_default()
                .push(value.to_owned());
        }
    }
    add_forwarded_headers(&mut headers, peer, originating_port(parts), https_ports);

    let target = claims.proxy.clone().unwrap_or_default();
    let scheme = if target.scheme.is_empty() { "http" } else { target.scheme.as_str() };
    let mut path = path_params
        .get("path")
        .cloned()
        .unwrap_or_else(|| parts.uri.path().to_owned());
    if !path.starts_with('/') {
        path.insert(0, '/');
    }
    let url = match parts.uri.query() {
        Some(query) => format!("{scheme}://{}{path}?{query}", target.address),
        None => format!("{scheme}://{}{path}", target.address),
    };

    HttpMessage {
        method: parts.method.to_string(),
        host: parts
            .headers
            .get(http::header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned(),
        url,
        headers,
        ..Default::default()
    }
}

fn originating_port(parts: &http::request::Parts) -> Option<u16> {
    let host = parts.headers.get(http::header::HOST)?.to_str().ok()?;
    host.rsplit_once(':')?.1.parse().ok()
}

/// Streams the request body towards the backend. The head rides with the
/// first chunk; a final empty message carries the end-of-stream flag.
async fn upload(
    registry: &BackendRegistry,
    backend_id: &str,
    key: Uuid,
    head: HttpMessage,
    body: Body,
) -> Result<(), ApiError> {
    let mut head = Some(head);
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| ApiError::BadRequest(format!("body read failed: {err}")))?;
        for piece in chunk.chunks(CHUNK_SIZE) {
            let mut message = head.take().unwrap_or_default();
            message.body = piece.to_vec();
            send_message(registry, backend_id, key, &message).await?;
        }
    }
    let mut tail = head.take().unwrap_or_default();
    tail.eof = true;
    send_message(registry, backend_id, key, &tail).await
}

async fn send_message(
    registry: &BackendRegistry,
    backend_id: &str,
    key: Uuid,
    message: &HttpMessage,
) -> Result<(), ApiError> {
    let body = message
        .to_frame_body()
        .map_err(|err| ApiError::Gateway(err.to_string()))?;
    Ok(registry.send(backend_id, key, body).await?)
}

/// Rebuilds the client response. The first response-shaped message fixes
/// status and headers; later messages only append body bytes until one sets
/// the end-of-stream flag.
async fn respond(
    registry: BackendRegistry,
    backend_id: String,
    key: Uuid,
    mut inbound: mpsc::Receiver<Frame>,
) -> Response {
    let first = loop {
        let Some(frame) = inbound.recv().await else {
            let _ = registry.close(&backend_id, key).await;
            return ApiError::Gateway("backend closed before responding".to_owned()).into_response();
        };
        match frame.frame_type {
            FrameType::Body => match HttpMessage::from_frame_body(&frame.body) {
                Ok(message) => break message,
                Err(err) => {
                    let _ = registry.close(&backend_id, key).await;
                    return ApiError::Gateway(format!("invalid response message: {err}"))
                        .into_response();
                }
            },
            FrameType::Close => {
                let _ = registry.close(&backend_id, key).await;
                return ApiError::Gateway("backend dropped the exchange".to_owned())
                    .into_response();
            }
            FrameType::Connect => {}
        }
    };

    let status = if first.code > 0 {
        StatusCode::from_u16(first.code).unwrap_or(StatusCode::OK)
    } else {
        StatusCode::OK
    };
    let mut builder = Response::builder().status(status);
    for (name, values) in &first.headers {
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }

    if first.eof {
        let _ = registry.close(&backend_id, key).await;
        return builder
            .body(Body::from(first.body))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
    }

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(QUEUE_CAPACITY);
    if !first.body.is_empty() {
        let _ = tx.send(Ok(first.body.into())).await;
    }
    tokio::spawn(stream_response(registry, backend_id, key, inbound, tx));
    let stream =
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

async fn stream_response(
    registry: BackendRegistry,
    backend_id: String,
    key: Uuid,
    mut inbound: mpsc::Receiver<Frame>,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    loop {
        let Some(frame) = inbound.recv().await else {
            // backend vanished mid-response; abort the body so the client
            // does not mistake the truncation for a complete answer
            let _ = tx
                .send(Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "backend connection lost",
                )))
                .await;
            break;
        };
        match frame.frame_type {
            FrameType::Body => match HttpMessage::from_frame_body(&frame.body) {
                Ok(message) => {
                    if !message.body.is_empty()
                        && tx.send(Ok(message.body.into())).await.is_err()
                    {
                        // client went away
                        break;
                    }
                    if message.eof {
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx
                        .send(Err(std::io::Error::new(ErrorKind::InvalidData, err)))
                        .await;
                    break;
                }
            },
            FrameType::Close => break,
            FrameType::Connect => {}
        }
    }
    let _ = registry.close(&backend_id, key).await;
}
