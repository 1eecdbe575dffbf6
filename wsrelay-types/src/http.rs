//! The structured message used to carry one HTTP exchange over the frame
//! protocol.
//!
//! A streamed HTTP request (or response) becomes a sequence of
//! [`HttpMessage`]s: the first one carries method, URL, host and headers, the
//! following ones accumulate body chunks, and the last one sets the
//! end-of-stream flag. Each message is JSON-encoded and becomes the body of
//! one `Body` frame. Field names are part of the wire contract and must not
//! change.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The fixed path the proxy announces for HTTP-adapter sessions. Agents route
/// on this literal to identify the HTTP handler on their end.
pub const CONTAINER_PROXY_PATH: &str = "/v1/container-proxy/";

/// One slice of an HTTP request or response tunneled over the frame protocol.
///
/// All fields are optional on the wire; a chunk-only message carries nothing
/// but `body` (and possibly `EOF`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMessage {
    /// Request method. Set on the first message of a request.
    #[serde(default)]
    pub method: String,
    /// The `Host` of the original request.
    #[serde(default)]
    pub host: String,
    /// Full target URL, rewritten to the agent-local scheme and address.
    #[serde(default)]
    pub url: String,
    /// Header name to list of values.
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    /// One chunk of body bytes, base64 on the wire.
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
    /// Set on the final message of a request or response.
    #[serde(rename = "EOF", default)]
    pub eof: bool,
    /// Response status code; zero means "not set".
    #[serde(default)]
    pub code: u16,
    /// Requests that the connection be handed over verbatim after the
    /// exchange (websocket-style upgrades through the HTTP adapter).
    #[serde(default)]
    pub hijack: bool,
}

impl HttpMessage {
    /// Serializes the message into the body string of a `Body` frame.
    pub fn to_frame_body(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parses a message out of a `Body` frame's body.
    pub fn from_frame_body(body: &str) -> serde_json::Result<Self> {
        serde_json::from_str(body)
    }
}

mod base64_bytes {
    //! `Vec<u8>` as standard base64; JSON cannot carry raw bytes.

    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_field_names_are_stable() {
        let message = HttpMessage {
            method: "GET".to_owned(),
            host: "example.com".to_owned(),
            url: "http://10.0.0.7:9090/metrics".to_owned(),
            headers: HashMap::from([("Accept".to_owned(), vec!["*/*".to_owned()])]),
            body: b"ping".to_vec(),
            eof: true,
            code: 0,
            hijack: false,
        };
        let encoded = message.to_frame_body().unwrap();
        for field in ["\"method\"", "\"host\"", "\"url\"", "\"headers\"", "\"body\"", "\"EOF\"", "\"code\"", "\"hijack\""] {
            assert!(encoded.contains(field), "missing {field} in {encoded}");
        }
        assert_eq!(HttpMessage::from_frame_body(&encoded).unwrap(), message);
    }

    #[test]
    fn chunk_only_message_parses() {
        let decoded = HttpMessage::from_frame_body(r#"{"body":"aGVsbG8="}"#).unwrap();
        assert_eq!(decoded.body, b"hello");
        assert!(!decoded.eof);
        assert_eq!(decoded.code, 0);
        assert!(decoded.method.is_empty());
    }

    #[test]
    fn response_head_round_trips() {
        let response = HttpMessage {
            code: 502,
            headers: HashMap::from([(
                "Content-Type".to_owned(),
                vec!["text/plain".to_owned()],
            )]),
            ..Default::default()
        };
        let decoded =
            HttpMessage::from_frame_body(&response.to_frame_body().unwrap()).unwrap();
        assert_eq!(decoded, response);
    }
}
