//! The per-backend multiplexer.
//!
//! One [`Multiplexer`] exists for every live backend WebSocket. It owns the
//! socket (split between one reader and one writer task), a bounded outbound
//! frame queue, and the table of per-session inbound queues. Client-side
//! handlers obtain a session with [`Multiplexer::initialize_client`] and talk
//! to the backend exclusively through frames; replies are routed back to the
//! session's inbound queue by the reader task.
//!
//! Reader-loop failure is the universal shutdown trigger: the multiplexer
//! deregisters itself, stops the writer, and drops every session's queue
//! sender, which surfaces end-of-stream to every bound client handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wsrelay_types::{Frame, FrameError, FrameType};

use crate::metrics::{
    METRICS_ID_PROXY_FRAMES_MALFORMED, METRICS_ID_PROXY_FRAMES_ORPHANED,
    METRICS_ID_PROXY_FRAMES_ROUTED, METRICS_ID_PROXY_SESSIONS_OPEN,
};
use crate::services::registry::Deregister;

/// Capacity of the outbound queue and of every per-session inbound queue.
pub(crate) const QUEUE_CAPACITY: usize = 10;

/// Idle time after which the writer sends a keepalive ping.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Write deadline for control frames.
const CONTROL_WRITE_DEADLINE: Duration = Duration::from_secs(1);

/// The outbound queue is gone, meaning the backend connection already shut
/// down. Callers treat this like a vanished backend.
#[derive(Debug, thiserror::Error)]
#[error("backend [{0}] is shutting down")]
pub struct BackendGone(pub String);

/// Owns one backend WebSocket and routes frames between it and the sessions
/// bound to it.
pub struct Multiplexer {
    backend_id: String,
    outbound: mpsc::Sender<Frame>,
    sessions: RwLock<HashMap<Uuid, mpsc::Sender<Frame>>>,
    deregister: Deregister,
    cancel: CancellationToken,
}

impl Multiplexer {
    /// Creates the multiplexer without starting its loops. The returned
    /// receiver is the read half of the outbound queue and must be handed to
    /// [`Multiplexer::start`] once the multiplexer is registered.
    pub(crate) fn new(backend_id: String, deregister: Deregister) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let mx = Arc::new(Self {
            backend_id,
            outbound,
            sessions: RwLock::new(HashMap::new()),
            deregister,
            cancel: CancellationToken::new(),
        });
        (mx, outbound_rx)
    }

    /// Spawns the reader and writer tasks on the given socket.
    pub(crate) fn start(self: &Arc<Self>, socket: WebSocket, outbound_rx: mpsc::Receiver<Frame>) {
        let (sink, stream) = socket.split();
        tokio::spawn(Arc::clone(self).read_loop(stream));
        tokio::spawn(write_loop(
            self.backend_id.clone(),
            outbound_rx,
            sink,
            self.cancel.clone(),
        ));
    }

    /// The backend this multiplexer serves.
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// Stops both loops. The reader runs the full shutdown path on its way
    /// out, so all bound sessions observe end-of-stream.
    pub(crate) fn teardown(&self) {
        self.cancel.cancel();
    }

    /// Allocates a session key and installs a fresh inbound queue for it.
    ///
    /// The returned receiver yields every frame the backend sends for this
    /// session until the session is closed.
    pub async fn initialize_client(&self) -> (Uuid, mpsc::Receiver<Frame>) {
        let key = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let previous = self.sessions.write().await.insert(key, tx);
        // The v4 space does not collide; a duplicate means the table is corrupt.
        assert!(previous.is_none(), "duplicate session key {key}");
        ::metrics::gauge!(METRICS_ID_PROXY_SESSIONS_OPEN).increment(1);
        tracing::debug!(backend_id = %self.backend_id, session = %key, "session opened");
        (key, rx)
    }

    /// Announces a new session to the backend, carrying the request `url`.
    pub async fn connect(&self, key: Uuid, url: &str) -> Result<(), BackendGone> {
        self.enqueue(Frame::connect(key.to_string(), url)).await
    }

    /// Forwards one payload chunk to the backend.
    pub async fn send(&self, key: Uuid, body: String) -> Result<(), BackendGone> {
        self.enqueue(Frame::body(key.to_string(), body)).await
    }

    /// Closes a session: optionally tells the backend to drop its end, then
    /// removes the inbound queue from the table. Removing the queue drops its
    /// sender, which the client-side pump observes as end-of-stream.
    ///
    /// Closing an absent session is a no-op.
    pub async fn close(&self, key: Uuid, notify_backend: bool) {
        let removed = self.sessions.write().await.remove(&key).is_some();
        if !removed {
            return;
        }
        ::metrics::gauge!(METRICS_ID_PROXY_SESSIONS_OPEN).decrement(1);
        tracing::debug!(backend_id = %self.backend_id, session = %key, "session closed");
        if notify_backend {
            let _ = self.enqueue(Frame::close(key.to_string())).await;
        }
    }

    async fn enqueue(&self, frame: Frame) -> Result<(), BackendGone> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| BackendGone(self.backend_id.clone()))
    }

    async fn read_loop(self: Arc<Self>, mut stream: SplitStream<WebSocket>) {
        loop {
            let message = tokio::select! {
                message = stream.next() => message,
                _ = self.cancel.cancelled() => break,
            };
            let Some(Ok(message)) = message else {
                // Read errors and EOF are both terminal.
                break;
            };
            let Message::Text(text) = message else {
                continue;
            };
            let frame = match Frame::decode(text.as_str()) {
                Ok(frame) => frame,
                Err(FrameError::Malformed) => {
                    ::metrics::counter!(METRICS_ID_PROXY_FRAMES_MALFORMED).increment(1);
                    tracing::warn!(backend_id = %self.backend_id, "dropping malformed frame");
                    continue;
                }
                Err(FrameError::UnknownType { key, symbol }) => {
                    ::metrics::counter!(METRICS_ID_PROXY_FRAMES_MALFORMED).increment(1);
                    tracing::warn!(
                        backend_id = %self.backend_id,
                        key = %key,
                        symbol = %symbol,
                        "dropping frame with unknown type"
                    );
                    if let Ok(key) = Uuid::parse_str(&key) {
                        self.close(key, true).await;
                    }
                    continue;
                }
            };
            self.route(frame).await;
        }
        self.shutdown().await;
    }

    /// Delivers one decoded frame to its session, or answers with a `Close`
    /// frame if the session is gone and the backend does not know yet.
    async fn route(&self, frame: Frame) {
        let frame_type = frame.frame_type;
        let raw_key = frame.key.clone();
        let delivered = match Uuid::parse_str(&raw_key) {
            Ok(key) => {
                let sessions = self.sessions.read().await;
                if let Some(queue) = sessions.get(&key) {
                    // Blocking send: a slow client exerts backpressure on this
                    // reader for its own session only. A pump that died has
                    // dropped its receiver, which fails the send immediately.
                    if queue.send(frame).await.is_ok() {
                        ::metrics::counter!(METRICS_ID_PROXY_FRAMES_ROUTED).increment(1);
                    }
                    true
                } else {
                    false
                }
            }
            Err(_) => false,
        };
        if !delivered && frame_type != FrameType::Close {
            ::metrics::counter!(METRICS_ID_PROXY_FRAMES_ORPHANED).increment(1);
            tracing::debug!(backend_id = %self.backend_id, key = %raw_key, "orphan frame, telling backend to drop the session");
            let _ = self.enqueue(Frame::close(raw_key)).await;
        }
    }

    /// Deregisters, stops the writer, and closes every session's inbound
    /// queue. No `Close` frames are sent; the socket is already gone.
    async fn shutdown(self: &Arc<Self>) {
        tracing::info!(backend_id = %self.backend_id, "backend connection lost, shutting down multiplexer");
        self.deregister.remove(self);
        self.cancel.cancel();
        let drained = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().count()
        };
        ::metrics::gauge!(METRICS_ID_PROXY_SESSIONS_OPEN).decrement(drained as f64);
    }
}

/// Drains the outbound queue onto the socket. Frames are written in enqueue
/// order; after [`KEEPALIVE_INTERVAL`] without a data write a ping goes out
/// with a short deadline so a dead peer turns into an error.
async fn write_loop(
    backend_id: String,
    mut outbound: mpsc::Receiver<Frame>,
    mut sink: SplitSink<WebSocket, Message>,
    cancel: CancellationToken,
) {
    let mut keepalive = tokio::time::interval_at(
        Instant::now() + KEEPALIVE_INTERVAL,
        KEEPALIVE_INTERVAL,
    );
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                if let Err(err) = sink.send(Message::text(frame.encode())).await {
                    tracing::error!(backend_id, error = %err, "could not write frame to backend");
                    break;
                }
                keepalive.reset();
            }
            _ = keepalive.tick() => {
                let ping = sink.send(Message::Ping(Bytes::new()));
                match tokio::time::timeout(CONTROL_WRITE_DEADLINE, ping).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(backend_id, error = %err, "backend keepalive failed");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(backend_id, "backend keepalive timed out");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    // A dead writer must wake the reader so the teardown cascade runs.
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::registry::BackendRegistry;

    fn test_multiplexer() -> (Arc<Multiplexer>, mpsc::Receiver<Frame>) {
        let registry = BackendRegistry::default();
        Multiplexer::new("backend-1".to_owned(), registry.deregister_capability("backend-1"))
    }

    #[tokio::test]
    async fn frames_leave_in_enqueue_order() {
        let (mx, mut outbound) = test_multiplexer();
        let (key, _inbound) = mx.initialize_client().await;
        mx.connect(key, "/v1/echo?a=b").await.unwrap();
        mx.send(key, "first".to_owned()).await.unwrap();
        mx.send(key, "second".to_owned()).await.unwrap();
        mx.close(key, true).await;

        let types: Vec<_> = [
            outbound.recv().await.unwrap(),
            outbound.recv().await.unwrap(),
            outbound.recv().await.unwrap(),
            outbound.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|frame| frame.frame_type)
        .collect();
        assert_eq!(
            types,
            [FrameType::Connect, FrameType::Body, FrameType::Body, FrameType::Close]
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_closes_the_queue_once() {
        let (mx, mut outbound) = test_multiplexer();
        let (key, mut inbound) = mx.initialize_client().await;

        mx.close(key, true).await;
        mx.close(key, true).await;

        // exactly one Close frame reaches the backend
        assert_eq!(outbound.recv().await.unwrap().frame_type, FrameType::Close);
        mx.send(key, "late".to_owned()).await.unwrap();
        assert_eq!(outbound.recv().await.unwrap().frame_type, FrameType::Body);
        // and the inbound queue yields end-of-stream exactly once
        assert!(inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn delivery_stops_after_close() {
        let (mx, _outbound) = test_multiplexer();
        let (key, mut inbound) = mx.initialize_client().await;

        mx.route(Frame::body(key.to_string(), "before")).await;
        assert_eq!(inbound.recv().await.unwrap().body, "before");

        mx.close(key, false).await;
        mx.route(Frame::body(key.to_string(), "after")).await;
        assert!(inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn orphan_frames_are_answered_with_close() {
        let (mx, mut outbound) = test_multiplexer();
        mx.route(Frame::body("no-such-session", "hello")).await;
        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.frame_type, FrameType::Close);
        assert_eq!(reply.key, "no-such-session");

        // an orphan Close is swallowed, not echoed
        mx.route(Frame::close("no-such-session")).await;
        mx.route(Frame::body("poke", "x")).await;
        assert_eq!(outbound.recv().await.unwrap().key, "poke");
    }

    #[tokio::test]
    async fn shutdown_closes_every_session_queue() {
        let (mx, _outbound) = test_multiplexer();
        let (_, mut first) = mx.initialize_client().await;
        let (_, mut second) = mx.initialize_client().await;
        let (_, mut third) = mx.initialize_client().await;

        mx.shutdown().await;

        assert!(first.recv().await.is_none());
        assert!(second.recv().await.is_none());
        assert!(third.recv().await.is_none());
    }
}
