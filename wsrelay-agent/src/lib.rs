#![deny(missing_docs)]
//! Agent-side library for wsrelay.
//!
//! An agent dials **out** to the proxy, holds the resulting WebSocket for its
//! whole lifetime, and serves the sessions the proxy announces over it. Each
//! `Connect` frame names a request path; the agent looks the path up in its
//! handler table and spawns the matching [`SessionHandler`] with a private
//! incoming queue and a [`ResponseSender`] for its replies. `Body` frames are
//! forwarded to the session's queue, `Close` frames end it.
//!
//! The connection is handled very conservatively: anything unexpected on the
//! socket terminates the dispatch loop, which drops every session queue and
//! so surfaces end-of-stream to every running handler. Callers that want a
//! permanent tunnel reconnect in a loop around [`connect_to_proxy`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt as _, StreamExt as _};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use wsrelay_types::{Frame, FrameType};

/// Capacity of the shared response queue and of every per-session incoming
/// queue.
const QUEUE_CAPACITY: usize = 10;

/// Errors the agent may encounter.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The proxy URL does not parse.
    #[error(transparent)]
    InvalidUri(#[from] http::uri::InvalidUri),
    /// The WebSocket to the proxy failed.
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
    /// The dispatch loop is gone; no more replies can be delivered.
    #[error("the connection to the proxy is gone")]
    ConnectionGone,
}

/// The reply half handed to a [`SessionHandler`].
///
/// All sessions of one agent share the bounded response queue behind this
/// sender, so a slow proxy exerts backpressure on every handler.
#[derive(Clone)]
pub struct ResponseSender {
    key: String,
    outgoing: mpsc::Sender<Frame>,
}

impl ResponseSender {
    /// The session key this sender replies for.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Sends one reply body to the client behind the proxy.
    pub async fn send(&self, body: impl Into<String>) -> Result<(), AgentError> {
        self.outgoing
            .send(Frame::body(self.key.clone(), body))
            .await
            .map_err(|_| AgentError::ConnectionGone)
    }

    /// Tells the proxy this session is finished. The client observes a clean
    /// close.
    pub async fn close(&self) -> Result<(), AgentError> {
        self.outgoing
            .send(Frame::close(self.key.clone()))
            .await
            .map_err(|_| AgentError::ConnectionGone)
    }
}

/// One request path an agent serves.
///
/// `incoming` yields the client's payloads until the session closes; replies
/// go through `response`. Returning without [`ResponseSender::close`] leaves
/// the session open until the client hangs up.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Serves one session from start to finish.
    async fn handle(&self, key: String, incoming: mpsc::Receiver<String>, response: ResponseSender);
}

/// The handler table: request path to handler.
pub type Handlers = HashMap<String, Arc<dyn SessionHandler>>;

/// Dials the proxy and serves sessions until the connection drops.
///
/// `token` must carry the `reportedUuid` claim the proxy registers this agent
/// under.
pub async fn connect_to_proxy(
    proxy_url: &str,
    token: &str,
    handlers: Handlers,
) -> Result<(), AgentError> {
    tracing::info!(url = proxy_url, "connecting to proxy");
    let request = ClientRequestBuilder::new(proxy_url.parse()?)
        .with_header("Authorization", format!("Bearer {token}"));
    let (socket, _) = tokio_tungstenite::connect_async(request).await?;
    dispatch(socket, handlers).await;
    Ok(())
}

/// Runs the dispatch loop on an established proxy socket.
///
/// Exposed separately so embedders can bring their own connection setup.
pub async fn dispatch<S>(socket: WebSocketStream<S>, handlers: Handlers)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = socket.split();
    let (response_tx, mut response_rx) = mpsc::channel::<Frame>(QUEUE_CAPACITY);
    let writer = tokio::spawn(async move {
        while let Some(frame) = response_rx.recv().await {
            if let Err(err) = sink.send(Message::text(frame.encode())).await {
                tracing::debug!("could not write to proxy: {err:?}");
                break;
            }
        }
    });

    let mut responders: HashMap<String, mpsc::Sender<String>> = HashMap::new();
    while let Some(message) = stream.next().await {
        let Ok(message) = message else {
            break;
        };
        let Message::Text(text) = message else {
            continue;
        };
        let frame = match Frame::decode(text.as_str()) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!("dropping frame from proxy: {err}");
                continue;
            }
        };
        let Frame {
            key,
            frame_type,
            body,
        } = frame;
        match frame_type {
            FrameType::Connect => {
                let path = request_path(&body);
                let Some(handler) = handlers.get(path) else {
                    tracing::warn!(path, "no handler for requested path");
                    let _ = response_tx.send(Frame::close(key)).await;
                    continue;
                };
                let (incoming_tx, incoming_rx) = mpsc::channel(QUEUE_CAPACITY);
                responders.insert(key.clone(), incoming_tx);
                let handler = Arc::clone(handler);
                let response = ResponseSender {
                    key: key.clone(),
                    outgoing: response_tx.clone(),
                };
                tokio::spawn(async move { handler.handle(key, incoming_rx, response).await });
            }
            FrameType::Body => {
                let delivered = match responders.get(&key) {
                    Some(incoming) => incoming.send(body).await.is_ok(),
                    None => false,
                };
                if !delivered {
                    // either never announced or the handler already returned
                    responders.remove(&key);
                    tracing::warn!(key, "no responder for session");
                    let _ = response_tx.send(Frame::close(key)).await;
                }
            }
            FrameType::Close => {
                // dropping the sender surfaces end-of-stream to the handler
                responders.remove(&key);
            }
        }
    }
    // the proxy is gone: close every session queue and stop the writer
    responders.clear();
    drop(response_tx);
    let _ = writer.await;
}

/// The path component of a `Connect` frame body, which may be a bare path
/// with query or a full URL.
fn request_path(url: &str) -> &str {
    let url = url.split(['?', '#']).next().unwrap_or(url);
    if let Some((_, rest)) = url.split_once("://") {
        match rest.find('/') {
            Some(index) => &rest[index..],
            None => "/",
        }
    } else {
        url
    }
}
