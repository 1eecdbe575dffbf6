//! Configuration types and CLI/environment parsing for the proxy.
//!
//! Concrete deployments may have a more detailed config and can use the
//! exposed [`ProxyConfig`] and flatten it with `#[clap(flatten)]`.
//!
//! Additionally this module defines the [`Environment`] to assert dev-only
//! code.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

/// The environment the service is running in.
///
/// Main usage for the `Environment` is to call
/// [`Environment::assert_is_dev`]. Features that are intended for `dev` only
/// (like the shared-secret token validator) shall assert that they are used
/// from the `dev` environment.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Environment {
    /// Production environment.
    Prod,
    /// Development environment.
    Dev,
}

impl Environment {
    /// Asserts that `Environment` is `dev`. Panics if not the case.
    pub fn assert_is_dev(&self) {
        assert!(matches!(self, Environment::Dev), "Is not dev environment")
    }
}

/// The configuration of the proxy core.
///
/// It can be configured via environment variables or command line arguments
/// using `clap`. The URL surface is configuration-driven: exactly one pattern
/// registers backends, one or more patterns are frontend WebSocket entry
/// points, and the HTTP-adapter and fan-out surfaces are optional.
#[derive(Parser, Debug)]
pub struct ProxyConfig {
    /// The environment of the proxy (either `prod` or `dev`).
    #[clap(long, env = "WSRELAY_ENVIRONMENT", default_value = "prod")]
    pub environment: Environment,

    /// The path agents register their tunnel on.
    #[clap(long, env = "WSRELAY_BACKEND_PATH", default_value = "/v1/connectbackend")]
    pub backend_path: String,

    /// Patterns routed to the frontend WebSocket handler.
    #[clap(
        long,
        env = "WSRELAY_FRONTEND_PATHS",
        value_delimiter = ',',
        default_value = "/v1/{*path}"
    )]
    pub frontend_paths: Vec<String>,

    /// Patterns routed to the fan-out handler. Multi-target mode engages when
    /// the request path ends in `project[/]` or `service[/]`.
    #[clap(long, env = "WSRELAY_STATS_PATHS", value_delimiter = ',')]
    pub stats_paths: Vec<String>,

    /// Patterns routed to the HTTP adapter.
    #[clap(long, env = "WSRELAY_HTTP_PATHS", value_delimiter = ',')]
    pub http_paths: Vec<String>,

    /// Location of the public key used to validate JWTs (RS256).
    #[clap(long, env = "WSRELAY_JWT_PUBLIC_KEY_FILE")]
    pub jwt_public_key_file: Option<PathBuf>,

    /// Shared secret for HS256 tokens. Only honored in the dev environment.
    #[clap(long, env = "WSRELAY_JWT_DEV_SECRET")]
    pub jwt_dev_secret: Option<String>,

    /// `host:port` of the control plane for the secondary token lookup. The
    /// lookup is disabled when unset.
    #[clap(long, env = "WSRELAY_SERVICE_PROXY_ADDR")]
    pub service_proxy_addr: Option<String>,

    /// How long successful token lookups are cached.
    #[clap(
        long,
        env = "WSRELAY_TOKEN_CACHE_TTL",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub token_cache_ttl: Duration,

    /// Originating ports for which the synthesized X-Forwarded-Proto is
    /// `https`.
    #[clap(long, env = "WSRELAY_HTTPS_PORTS", value_delimiter = ',')]
    pub https_ports: Vec<u16>,
}
