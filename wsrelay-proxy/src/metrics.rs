//! Metrics definitions for the proxy.
//!
//! This module defines all metrics keys used by the service and provides a
//! helper [`describe_metrics`] to set metadata for each metric using the
//! `metrics` crate.

/// Metrics key for the number of currently registered backends.
pub const METRICS_ID_PROXY_BACKENDS_REGISTERED: &str = "wsrelay.proxy.backends.registered";
/// Metrics key for the number of currently open sessions across all backends.
pub const METRICS_ID_PROXY_SESSIONS_OPEN: &str = "wsrelay.proxy.sessions.open";
/// Metrics key for frames delivered to a bound session.
pub const METRICS_ID_PROXY_FRAMES_ROUTED: &str = "wsrelay.proxy.frames.routed";
/// Metrics key for frames dropped because they did not decode.
pub const METRICS_ID_PROXY_FRAMES_MALFORMED: &str = "wsrelay.proxy.frames.malformed";
/// Metrics key for frames answered with a `Close` because their session is gone.
pub const METRICS_ID_PROXY_FRAMES_ORPHANED: &str = "wsrelay.proxy.frames.orphaned";
/// Metrics key for rejected authentication attempts.
pub const METRICS_ID_PROXY_AUTH_FAILURES: &str = "wsrelay.proxy.auth.failures";
/// Metrics key for token lookups that went to the control plane.
pub const METRICS_ID_PROXY_TOKEN_LOOKUPS: &str = "wsrelay.proxy.token_lookup.remote";

/// Describe all metrics used by the service.
///
/// This calls the `describe_*` functions from the `metrics` crate to set
/// metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_ID_PROXY_BACKENDS_REGISTERED,
        metrics::Unit::Count,
        "Number of currently registered backends"
    );

    metrics::describe_gauge!(
        METRICS_ID_PROXY_SESSIONS_OPEN,
        metrics::Unit::Count,
        "Number of currently open sessions across all backends"
    );

    metrics::describe_counter!(
        METRICS_ID_PROXY_FRAMES_ROUTED,
        metrics::Unit::Count,
        "Number of frames delivered to a bound session"
    );

    metrics::describe_counter!(
        METRICS_ID_PROXY_FRAMES_MALFORMED,
        metrics::Unit::Count,
        "Number of frames dropped because they did not decode"
    );

    metrics::describe_counter!(
        METRICS_ID_PROXY_FRAMES_ORPHANED,
        metrics::Unit::Count,
        "Number of frames answered with a Close because their session is gone"
    );

    metrics::describe_counter!(
        METRICS_ID_PROXY_AUTH_FAILURES,
        metrics::Unit::Count,
        "Number of rejected authentication attempts"
    );

    metrics::describe_counter!(
        METRICS_ID_PROXY_TOKEN_LOOKUPS,
        metrics::Unit::Count,
        "Number of token lookups that went to the control plane"
    )
}
