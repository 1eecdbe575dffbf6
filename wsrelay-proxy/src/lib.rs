#![deny(missing_docs)]
//! Core of the wsrelay reverse WebSocket proxy.
//!
//! Long-lived agents behind NAT dial **out** to this proxy and hold one
//! persistent WebSocket each. External clients then connect with URLs that
//! name a target backend; the proxy multiplexes many such client sessions
//! over the single backend socket and demultiplexes the replies. Both
//! client-initiated WebSocket sessions and synthesized HTTP request/response
//! exchanges ride the same frame protocol (see `wsrelay-types`).
//!
//! The main entry point is the [`ProxyBuilder`]: it owns the
//! [`BackendRegistry`] and, given a [`config::ProxyConfig`] and a
//! [`auth::TokenValidator`], produces an `axum::Router` that the hosting
//! application serves. The URL surface is configuration-driven; exactly one
//! pattern registers backends and one or more patterns are frontend entry
//! points.
//!
//! Serve the router with
//! `Router::into_make_service_with_connect_info::<SocketAddr>` so the HTTP
//! adapter can synthesize `X-Forwarded-*` headers from the client peer
//! address; without it those headers are simply omitted.
//!
//! The proxy holds no persistent state. A restart loses all backend
//! registrations; agents are expected to reconnect.

use std::collections::HashSet;
use std::sync::Arc;

use axum::Router;
use axum::extract::Request;
use axum::http::Uri;
use axum::middleware::{self, Next};
use axum::response::Response;
use eyre::Context as _;
use tower_http::trace::TraceLayer;

use crate::api::backend::BackendArgs;
use crate::api::frontend::FrontendArgs;
use crate::api::http::HttpArgs;
use crate::api::stats::StatsArgs;
use crate::auth::TokenValidator;
use crate::config::ProxyConfig;

pub mod auth;
pub mod config;
pub mod metrics;

pub(crate) mod api;
pub(crate) mod proxy_protocol;
pub(crate) mod services;

pub use services::multiplexer::Multiplexer;
pub use services::registry::{BackendRegistry, RegistryError};
pub use services::token_lookup::{LookupError, LookupRequest, TokenLookup};

/// Assembles the proxy router.
pub struct ProxyBuilder {
    config: ProxyConfig,
    registry: BackendRegistry,
    validator: Arc<TokenValidator>,
    token_lookup: Option<Arc<TokenLookup>>,
}

impl ProxyBuilder {
    /// Initializes the proxy core.
    ///
    /// Builds the empty backend registry and, when the configuration names a
    /// control plane, the cached token-lookup client for the HTTP adapter.
    pub fn new(config: ProxyConfig, validator: TokenValidator) -> eyre::Result<Self> {
        let token_lookup = config
            .service_proxy_addr
            .as_deref()
            .map(|addr| TokenLookup::new(addr, config.token_cache_ttl).map(Arc::new))
            .transpose()
            .context("while building the token lookup client")?;
        Ok(Self {
            config,
            registry: BackendRegistry::default(),
            validator: Arc::new(validator),
            token_lookup,
        })
    }

    /// A handle to the backend registry, e.g. for administrative tooling.
    pub fn registry(&self) -> BackendRegistry {
        self.registry.clone()
    }

    /// Builds the `axum` [`Router`] with the configured URL surface.
    pub fn build(self) -> Router {
        let Self {
            config,
            registry,
            validator,
            token_lookup,
        } = self;
        let https_ports: Arc<HashSet<u16>> =
            Arc::new(config.https_ports.iter().copied().collect());

        Router::new()
            .merge(api::info::routes())
            .merge(api::backend::routes(
                &config.backend_path,
                BackendArgs {
                    registry: registry.clone(),
                    validator: Arc::clone(&validator),
                },
            ))
            .merge(api::frontend::routes(
                &config.frontend_paths,
                FrontendArgs {
                    registry: registry.clone(),
                    validator: Arc::clone(&validator),
                },
            ))
            .merge(api::stats::routes(
                &config.stats_paths,
                StatsArgs {
                    registry: registry.clone(),
                    validator: Arc::clone(&validator),
                },
            ))
            .merge(api::http::routes(
                &config.http_paths,
                HttpArgs {
                    registry,
                    validator,
                    token_lookup,
                    https_ports,
                },
            ))
            .layer(middleware::from_fn(collapse_duplicate_slashes))
            .layer(TraceLayer::new_for_http())
    }
}

/// Collapses runs of `/` in the request path to a single `/` before routing,
/// so `//v1//echo` cannot evade the configured patterns.
async fn collapse_duplicate_slashes(mut request: Request, next: Next) -> Response {
    let uri = request.uri();
    if uri.path().contains("//") {
        let path = uri.path();
        let mut cleaned = String::with_capacity(path.len());
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            cleaned.push('/');
            cleaned.push_str(segment);
        }
        if cleaned.is_empty() {
            cleaned.push('/');
        } else if path.ends_with('/') {
            // a trailing slash is significant for the fan-out patterns
            cleaned.push('/');
        }
        let rebuilt = match uri.query() {
            Some(query) => format!("{cleaned}?{query}"),
            None => cleaned,
        };
        if let Ok(path_and_query) = rebuilt.parse() {
            let mut parts = uri.clone().into_parts();
            parts.path_and_query = Some(path_and_query);
            if let Ok(new_uri) = Uri::from_parts(parts) {
                *request.uri_mut() = new_uri;
            }
        }
    }
    next.run(request).await
}
