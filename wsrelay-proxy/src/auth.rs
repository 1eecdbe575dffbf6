//! Token extraction and validation.
//!
//! The proxy consumes JWTs in two places: agents present a token carrying the
//! `reportedUuid` claim when they register, and frontend callers present a
//! token carrying the `hostUuid` claim (plus, for the HTTP and fan-out flows,
//! a `proxy` or `project`/`service` claim with target metadata). Tokens are
//! taken from the `Authorization: Bearer` header first, then from the `token`
//! query parameter.

use std::collections::HashMap;

use http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::config::ProxyConfig;

/// Errors of the authentication path. All of them surface as a 401 to the
/// caller; the detail stays in the logs.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Neither the bearer header nor the `token` query parameter was set.
    #[error("no token provided")]
    MissingToken,
    /// Signature or claim validation failed.
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
    /// The token parsed but carries no usable claim of the required kind.
    #[error("token carries no usable {0} claim")]
    MissingClaim(&'static str),
    /// The token names a backend that is not connected.
    #[error("no backend connected for [{0}]")]
    UnknownBackend(String),
}

/// The agent-local target of an HTTP-adapter token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyTarget {
    /// `host:port` the agent should dial.
    #[serde(default)]
    pub address: String,
    /// `http` or `https`; empty means `http`.
    #[serde(default)]
    pub scheme: String,
}

/// One target of a fan-out token.
#[derive(Debug, Clone, Deserialize)]
pub struct FanoutTarget {
    /// Request URL for the inner session.
    pub url: String,
    /// Token authorizing the inner session; resolves to a backend id.
    pub token: String,
}

/// The claims the proxy consumes. Everything is optional; each handler
/// insists on the claims its flow needs.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    /// Backend id presented by a registering agent.
    #[serde(default, rename = "reportedUuid")]
    pub reported_uuid: Option<String>,
    /// Backend id a frontend session is authorized for.
    #[serde(default, rename = "hostUuid")]
    pub host_uuid: Option<String>,
    /// Target metadata for the HTTP adapter.
    #[serde(default)]
    pub proxy: Option<ProxyTarget>,
    /// Fan-out targets, project flavor.
    #[serde(default)]
    pub project: Option<Vec<FanoutTarget>>,
    /// Fan-out targets, service flavor.
    #[serde(default)]
    pub service: Option<Vec<FanoutTarget>>,
}

impl Claims {
    /// The non-empty `reportedUuid` claim of a registering agent.
    pub fn backend_id(&self) -> Result<&str, AuthError> {
        self.reported_uuid
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(AuthError::MissingClaim("reportedUuid"))
    }

    /// The non-empty `hostUuid` claim of a frontend token.
    pub fn host_id(&self) -> Result<&str, AuthError> {
        self.host_uuid
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(AuthError::MissingClaim("hostUuid"))
    }

    /// The fan-out target list, from `project` or `service`.
    pub fn fanout_targets(&self) -> Option<&[FanoutTarget]> {
        self.project
            .as_deref()
            .or(self.service.as_deref())
    }
}

/// Validates JWTs against the configured verification key.
pub struct TokenValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    /// Validator for RS256 tokens against a public-key PEM.
    pub fn from_rsa_pem(pem: &[u8]) -> Result<Self, jsonwebtoken::errors::Error> {
        Ok(Self {
            decoding_key: DecodingKey::from_rsa_pem(pem)?,
            validation: base_validation(Algorithm::RS256),
        })
    }

    /// Validator for HS256 tokens with a shared secret. Dev only; callers
    /// must have asserted the environment.
    pub fn from_dev_secret(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: base_validation(Algorithm::HS256),
        }
    }

    /// Builds the validator the configuration asks for.
    pub fn from_config(config: &ProxyConfig) -> eyre::Result<Self> {
        if let Some(key_file) = &config.jwt_public_key_file {
            let pem = std::fs::read(key_file)?;
            return Ok(Self::from_rsa_pem(&pem)?);
        }
        if let Some(secret) = &config.jwt_dev_secret {
            config.environment.assert_is_dev();
            return Ok(Self::from_dev_secret(secret));
        }
        eyre::bail!("either --jwt-public-key-file or --jwt-dev-secret must be set")
    }

    /// Checks signature and standard claims, returning the decoded claims.
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims)
    }
}

fn base_validation(algorithm: Algorithm) -> Validation {
    let mut validation = Validation::new(algorithm);
    // exp is honored when present but the tokens the control plane issues do
    // not always carry it
    validation.required_spec_claims.clear();
    validation.validate_aud = false;
    validation
}

/// Extracts a token: `Authorization: Bearer` first, then `?token=`.
pub fn extract_token(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    if let Some(bearer) = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
    {
        return Some(bearer.to_owned());
    }
    query.get("token").filter(|token| !token.is_empty()).cloned()
}

/// Extraction plus validation in one step, the shape every handler starts
/// with.
pub fn authenticate(
    validator: &TokenValidator,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<Claims, AuthError> {
    let token = extract_token(headers, query).ok_or(AuthError::MissingToken)?;
    validator.validate(&token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    const SECRET: &str = "test-secret";

    fn token(claims: serde_json::Value) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn bearer_header_wins_over_query_parameter() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-header"),
        );
        let query = HashMap::from([("token".to_owned(), "from-query".to_owned())]);
        assert_eq!(extract_token(&headers, &query).as_deref(), Some("from-header"));
        assert_eq!(
            extract_token(&HeaderMap::new(), &query).as_deref(),
            Some("from-query")
        );
        assert!(extract_token(&HeaderMap::new(), &HashMap::new()).is_none());
    }

    #[test]
    fn validates_claims_without_exp() {
        let validator = TokenValidator::from_dev_secret(SECRET);
        let claims = validator
            .validate(&token(serde_json::json!({"hostUuid": "1"})))
            .unwrap();
        assert_eq!(claims.host_id().unwrap(), "1");
        assert!(claims.backend_id().is_err());
    }

    #[test]
    fn rejects_bad_signature_and_empty_claims() {
        let validator = TokenValidator::from_dev_secret("other-secret");
        assert!(validator.validate(&token(serde_json::json!({"hostUuid": "1"}))).is_err());

        let validator = TokenValidator::from_dev_secret(SECRET);
        let claims = validator
            .validate(&token(serde_json::json!({"reportedUuid": ""})))
            .unwrap();
        assert!(matches!(
            claims.backend_id(),
            Err(AuthError::MissingClaim("reportedUuid"))
        ));
    }

    #[test]
    fn fanout_targets_prefer_project_over_service() {
        let validator = TokenValidator::from_dev_secret(SECRET);
        let claims = validator
            .validate(&token(serde_json::json!({
                "project": [{"url": "/v1/stats", "token": "a"}],
                "service": [{"url": "/v1/other", "token": "b"}],
            })))
            .unwrap();
        let targets = claims.fanout_targets().unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].url, "/v1/stats");
    }
}
