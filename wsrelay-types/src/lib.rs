#![deny(missing_docs)]
//! Wire types shared by the wsrelay proxy and agent.
//!
//! This crate groups together the message structures that ride the backend
//! WebSocket. It provides:
//!
//! * The [`frame`] module: the `||`-delimited frame that is the only unit of
//!   transfer between the proxy and a connected agent.
//! * The [`http`] module: the structured message used to adapt a streamed
//!   HTTP request/response onto the frame protocol.
//!
//! Both ends of the tunnel must agree on these encodings, so they live here
//! rather than in the proxy or the agent crate.

pub mod frame;
pub mod http;

pub use frame::{Frame, FrameError, FrameType, MESSAGE_SEPARATOR};
pub use http::{CONTAINER_PROXY_PATH, HttpMessage};
