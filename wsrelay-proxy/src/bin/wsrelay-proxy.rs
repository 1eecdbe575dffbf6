use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use eyre::Context as _;
use tokio_util::sync::CancellationToken;
use wsrelay_proxy::ProxyBuilder;
use wsrelay_proxy::auth::TokenValidator;
use wsrelay_proxy::config::ProxyConfig;

/// The configuration of the proxy server.
///
/// It can be configured via environment variables or command line arguments
/// using `clap`.
#[derive(Parser, Debug)]
struct ServerConfig {
    /// The bind addr of the axum server.
    #[clap(long, env = "WSRELAY_BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind_addr: SocketAddr,

    /// Max wait time the service waits for in-flight work during shutdown.
    #[clap(
        long,
        env = "WSRELAY_MAX_WAIT_TIME_SHUTDOWN",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    max_wait_time_shutdown: Duration,

    /// The proxy core config.
    #[clap(flatten)]
    proxy: ProxyConfig,
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("wsrelay_proxy=debug,info")),
        )
        .init();
    tracing::info!(concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")));
    wsrelay_proxy::metrics::describe_metrics();

    let config = ServerConfig::parse();

    let validator =
        TokenValidator::from_config(&config.proxy).context("while loading the token validator")?;
    let router = ProxyBuilder::new(config.proxy, validator)?.build();

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("while binding listen address")?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let cancellation_token = CancellationToken::new();
    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("received shutdown signal");
            cancellation_token.cancel();
        }
    });

    let server = tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            let shutdown_token = cancellation_token.clone();
            let result = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
            .await;
            if let Err(err) = result {
                tracing::error!("got error from axum: {err:?}");
            }
            // cancel in case axum encountered an error so the main task wakes
            cancellation_token.cancel();
        }
    });

    cancellation_token.cancelled().await;
    tracing::info!(
        "waiting for shutdown (max wait time {:?})..",
        config.max_wait_time_shutdown
    );
    match tokio::time::timeout(config.max_wait_time_shutdown, server).await {
        Ok(_) => {
            tracing::info!("good night!");
            Ok(ExitCode::SUCCESS)
        }
        Err(_) => {
            tracing::warn!("could not finish shutdown in time");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("can install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("can install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
