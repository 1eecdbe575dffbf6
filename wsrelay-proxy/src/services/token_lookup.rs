//! Remote token lookup for callers that present no JWT of their own.
//!
//! The HTTP adapter serves CLI-style clients that authenticate with API keys
//! or cookies instead of proxy-signed JWTs. For those, the proxy asks the
//! control plane's service-proxy endpoint to mint a token, and caches the
//! answer for a short while keyed by a hash of the credential material.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::metrics::METRICS_ID_PROXY_TOKEN_LOOKUPS;

const AUTH_HEADER: &str = "Authorization";
const PROJECT_HEADER: &str = "X-API-Project-Id";
const DEFAULT_SERVICE: &str = "swarm:2375";

/// Errors of the remote lookup.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// The control plane rejected the credentials.
    #[error("token lookup unauthorized")]
    Unauthorized,
    /// The control plane answered with an unexpected status.
    #[error("token lookup returned HTTP {0}")]
    Status(u16),
    /// Transport-level failure talking to the control plane.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// The `service` router variable does not parse as `name:port`.
    #[error("invalid service [{0}]")]
    InvalidService(String),
}

/// The credential material a lookup is keyed and forwarded by.
#[derive(Debug, Default)]
pub struct LookupRequest {
    /// The caller's `Authorization` header, verbatim.
    pub authorization: Option<String>,
    /// The caller's `X-API-Project-Id` header.
    pub project_header: Option<String>,
    /// The caller's `token` cookie value.
    pub token_cookie: Option<String>,
    /// The `project` router variable, when the pattern binds one.
    pub project_var: Option<String>,
    /// The `service` router variable, when the pattern binds one.
    pub service_var: Option<String>,
}

/// Cached client for the control plane's service-proxy endpoint.
pub struct TokenLookup {
    cache: moka::sync::Cache<String, String>,
    client: reqwest::Client,
    service_proxy_url: String,
}

#[derive(Serialize)]
struct ServiceProxyRequest {
    service: String,
    port: u16,
    scheme: String,
}

#[derive(Deserialize)]
struct ServiceProxyResponse {
    token: String,
}

impl TokenLookup {
    /// Builds the lookup client against `service_proxy_addr` (host:port of
    /// the control plane), caching successful answers for `cache_ttl`.
    pub fn new(service_proxy_addr: &str, cache_ttl: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            cache: moka::sync::Cache::builder().time_to_live(cache_ttl).build(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()?,
            service_proxy_url: format!("http://{service_proxy_addr}/v2-beta/serviceproxies"),
        })
    }

    /// Returns a token for the given credential material, from cache or from
    /// the control plane.
    pub async fn lookup(&self, request: &LookupRequest) -> Result<String, LookupError> {
        let key = cache_key(request);
        if let Some(token) = self.cache.get(&key) {
            return Ok(token);
        }
        ::metrics::counter!(METRICS_ID_PROXY_TOKEN_LOOKUPS).increment(1);
        let token = self.call_service_proxy(request).await?;
        if !token.is_empty() {
            self.cache.insert(key, token.clone());
        }
        Ok(token)
    }

    async fn call_service_proxy(&self, request: &LookupRequest) -> Result<String, LookupError> {
        let service = request.service_var.as_deref().unwrap_or(DEFAULT_SERVICE);
        let (service, port, scheme) = split_service(service)?;
        tracing::debug!(url = self.service_proxy_url, "asking control plane for a token");

        let mut call = self
            .client
            .post(&self.service_proxy_url)
            .json(&ServiceProxyRequest { service, port, scheme });
        if let Some(authorization) = &request.authorization {
            call = call.header(AUTH_HEADER, unwrap_bearer(authorization));
        }
        if let Some(project) = request.project_var.as_ref().or(request.project_header.as_ref()) {
            call = call.header(PROJECT_HEADER, project);
        }
        if let Some(cookie) = &request.token_cookie {
            call = call.header(http::header::COOKIE.as_str(), format!("token={cookie}"));
        }

        let response = call.send().await?;
        let status = response.status();
        if status.as_u16() == 401 {
            return Err(LookupError::Unauthorized);
        }
        if status.is_client_error() || status.is_server_error() {
            return Err(LookupError::Status(status.as_u16()));
        }
        let body: ServiceProxyResponse = response.json().await?;
        Ok(body.token)
    }
}

fn split_service(service: &str) -> Result<(String, u16, String), LookupError> {
    let mut parts = service.splitn(2, ':');
    let name = parts.next().unwrap_or_default().to_owned();
    let Some(port) = parts.next() else {
        return Ok((name, 80, "http".to_owned()));
    };
    let scheme = if port.ends_with("443") { "https" } else { "http" };
    let port = port
        .parse()
        .map_err(|_| LookupError::InvalidService(service.to_owned()))?;
    Ok((name, port, scheme.to_owned()))
}

/// Undoes the double base64 wrapping some clients apply to basic credentials.
fn unwrap_bearer(authorization: &str) -> String {
    let Some(wrapped) = authorization.strip_prefix("Bearer ") else {
        return authorization.to_owned();
    };
    if let Ok(decoded) = BASE64.decode(wrapped)
        && let Ok(text) = String::from_utf8(decoded)
        && text.split(' ').count() == 2
    {
        return text;
    }
    authorization.to_owned()
}

fn cache_key(request: &LookupRequest) -> String {
    let mut hasher = blake3::Hasher::new();
    for (label, value) in [
        (AUTH_HEADER, &request.authorization),
        (PROJECT_HEADER, &request.project_header),
        ("project", &request.project_var),
        ("service", &request.service_var),
        ("token", &request.token_cookie),
    ] {
        hasher.update(label.as_bytes());
        hasher.update(value.as_deref().unwrap_or_default().as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_splits_into_name_port_scheme() {
        assert_eq!(
            split_service("swarm:2375").unwrap(),
            ("swarm".to_owned(), 2375, "http".to_owned())
        );
        assert_eq!(
            split_service("registry:8443").unwrap(),
            ("registry".to_owned(), 8443, "https".to_owned())
        );
        assert_eq!(
            split_service("plain").unwrap(),
            ("plain".to_owned(), 80, "http".to_owned())
        );
        assert!(split_service("bad:port").is_err());
    }

    #[test]
    fn double_encoded_bearer_is_unwrapped() {
        let inner = "Basic dXNlcjpwYXNz";
        let wrapped = format!("Bearer {}", BASE64.encode(inner));
        assert_eq!(unwrap_bearer(&wrapped), inner);
        // a real JWT stays untouched
        assert_eq!(unwrap_bearer("Bearer abc.def.ghi"), "Bearer abc.def.ghi");
        assert_eq!(unwrap_bearer("Basic xyz"), "Basic xyz");
    }

    #[test]
    fn cache_key_tracks_credential_material() {
        let base = LookupRequest {
            authorization: Some("Bearer a".to_owned()),
            ..Default::default()
        };
        let same = LookupRequest {
            authorization: Some("Bearer a".to_owned()),
            ..Default::default()
        };
        let different = LookupRequest {
            authorization: Some("Bearer b".to_owned()),
            ..Default::default()
        };
        assert_eq!(cache_key(&base), cache_key(&same));
        assert_ne!(cache_key(&base), cache_key(&different));
    }
}
