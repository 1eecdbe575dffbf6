//! The text frame that rides the backend WebSocket.
//!
//! A frame is the triple `(session-key, type, body)`, encoded as the three
//! fields joined by the literal separator `||`. The body is an opaque string
//! and may itself contain `||`, so decoding splits at the first two
//! occurrences only.

use std::fmt;

/// The literal separator between the three frame fields.
pub const MESSAGE_SEPARATOR: &str = "||";

/// The kind of a [`Frame`].
///
/// The wire symbols are fixed: `0` announces a new session, `1` carries a
/// payload chunk, `2` tears a session down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Announces a new session to the peer, body carries the request URL.
    Connect,
    /// Carries one payload chunk for an established session.
    Body,
    /// Signals that either side is done with the session.
    Close,
}

impl FrameType {
    /// The single-character wire symbol of this frame type.
    pub fn symbol(self) -> &'static str {
        match self {
            FrameType::Connect => "0",
            FrameType::Body => "1",
            FrameType::Close => "2",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Errors the decoder may report.
///
/// An [`FrameError::UnknownType`] keeps the session key so the caller can
/// still tear down the session the peer referred to.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The raw text had fewer than three `||`-separated parts.
    #[error("frame has fewer than three parts")]
    Malformed,
    /// The type symbol was none of `0`, `1`, `2`.
    #[error("unknown frame type [{symbol}] for key [{key}]")]
    UnknownType {
        /// The session key the frame referred to.
        key: String,
        /// The unrecognized type symbol.
        symbol: String,
    },
}

/// One unit of transfer on the backend WebSocket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// The session this frame belongs to. Unique within one backend
    /// connection; opaque to the agent.
    pub key: String,
    /// What this frame means for the session.
    pub frame_type: FrameType,
    /// Opaque payload. Empty for most `Close` frames.
    pub body: String,
}

impl Frame {
    /// A `Connect` frame announcing a new session for `url`.
    pub fn connect(key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            frame_type: FrameType::Connect,
            body: url.into(),
        }
    }

    /// A `Body` frame carrying one payload chunk.
    pub fn body(key: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            frame_type: FrameType::Body,
            body: body.into(),
        }
    }

    /// A `Close` frame with an empty body.
    pub fn close(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            frame_type: FrameType::Close,
            body: String::new(),
        }
    }

    /// Encodes the frame as `key||type||body`.
    pub fn encode(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.key,
            self.frame_type,
            self.body,
            sep = MESSAGE_SEPARATOR
        )
    }

    /// Decodes a frame from its wire representation.
    ///
    /// Splits at the first two `||` occurrences, so the body survives
    /// embedded separators verbatim.
    pub fn decode(raw: &str) -> Result<Self, FrameError> {
        let mut parts = raw.splitn(3, MESSAGE_SEPARATOR);
        let (Some(key), Some(symbol), Some(body)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(FrameError::Malformed);
        };
        let frame_type = match symbol {
            "0" => FrameType::Connect,
            "1" => FrameType::Body,
            "2" => FrameType::Close,
            _ => {
                return Err(FrameError::UnknownType {
                    key: key.to_owned(),
                    symbol: symbol.to_owned(),
                });
            }
        };
        Ok(Self {
            key: key.to_owned(),
            frame_type,
            body: body.to_owned(),
        })
    }
}
