#![deny(missing_docs)]
//! JWT construction helpers for wsrelay tests.
//!
//! All helpers sign with HS256 and a caller-supplied shared secret, matching
//! the dev-environment validator of the proxy.

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::json;

/// Signs arbitrary claims with the shared `secret`.
pub fn sign_claims(secret: &str, claims: &serde_json::Value) -> String {
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("can sign test token")
}

/// A token a frontend client presents for sessions on `host_uuid`.
pub fn frontend_token(secret: &str, host_uuid: &str) -> String {
    sign_claims(secret, &json!({ "hostUuid": host_uuid }))
}

/// A token an agent presents to register as `reported_uuid`.
pub fn backend_token(secret: &str, reported_uuid: &str) -> String {
    sign_claims(secret, &json!({ "reportedUuid": reported_uuid }))
}

/// A token for the HTTP adapter: authorizes `host_uuid` and carries the
/// agent-local target in the `proxy` claim.
pub fn http_token(secret: &str, host_uuid: &str, address: &str, scheme: &str) -> String {
    sign_claims(
        secret,
        &json!({
            "hostUuid": host_uuid,
            "proxy": { "address": address, "scheme": scheme },
        }),
    )
}

/// A fan-out token enumerating `(url, inner-token)` targets in the `project`
/// claim.
pub fn fanout_token(secret: &str, targets: &[(String, String)]) -> String {
    let targets: Vec<_> = targets
        .iter()
        .map(|(url, token)| json!({ "url": url, "token": token }))
        .collect();
    sign_claims(secret, &json!({ "project": targets }))
}
