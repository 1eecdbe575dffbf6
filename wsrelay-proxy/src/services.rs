//! Internal services of the proxy.
//!
//! - [`multiplexer`] – owns one backend WebSocket and routes frames.
//! - [`registry`] – the process-wide backend table.
//! - [`token_lookup`] – the cached control-plane token lookup.

pub mod multiplexer;
pub mod registry;
pub mod token_lookup;
