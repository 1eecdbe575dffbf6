//! This module defines the [`ApiError`] a handler may report back to a
//! frontend caller before a session is established, plus helpers to classify
//! WebSocket failures once the session runs.

use std::io::ErrorKind;

use axum::response::{IntoResponse, Response};
use http::StatusCode;
use tungstenite::error::ProtocolError;

use crate::auth::AuthError;
use crate::metrics::METRICS_ID_PROXY_AUTH_FAILURES;
use crate::services::registry::RegistryError;

/// Errors a handler turns into an HTTP response.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ApiError {
    /// Any failure of the authentication path. The caller sees a bare 401;
    /// the detail stays in the logs.
    #[error("Failed authentication")]
    Auth(#[from] AuthError),
    /// The addressed backend is unknown or going away.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The backend misbehaved while answering an HTTP-adapter exchange.
    #[error("bad gateway: {0}")]
    Gateway(String),
    /// The client request could not be consumed.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::debug!(error = ?self, "rejecting request");
        let status = match &self {
            ApiError::Auth(_) => {
                ::metrics::counter!(METRICS_ID_PROXY_AUTH_FAILURES).increment(1);
                StatusCode::UNAUTHORIZED
            }
            ApiError::Registry(RegistryError::NoSuchBackend(_)) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Registry(RegistryError::BackendGone(_)) | ApiError::Gateway(_) => {
                StatusCode::BAD_GATEWAY
            }
        };
        (status, self.to_string()).into_response()
    }
}

/// Whether a WebSocket error is just the peer going away without a closing
/// handshake. Those are everyday client behavior and not worth more than a
/// trace line.
pub(crate) fn is_peer_disconnect(error: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(current) = source {
        if let Some(tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)) =
            current.downcast_ref()
        {
            return true;
        }
        if let Some(io_error) = current.downcast_ref::<std::io::Error>()
            && io_error.kind() == ErrorKind::ConnectionReset
        {
            return true;
        }
        source = current.source();
    }
    false
}
