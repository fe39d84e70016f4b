//! Authorization context
//!
//! The bounded projection of a verified token payload. Downstream code only
//! ever sees these fields; the raw token is hashed immediately and never
//! persisted or logged.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 of the raw token, hex-encoded. The one-way digest is the only
/// token-derived value that may appear in stores or logs.
pub fn token_hash(raw_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_token.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorizationContext {
    pub subject: String,
    pub client_id: Option<String>,
    pub scopes: Vec<String>,
    pub audience: Vec<String>,
    pub token_type: String,
    pub token_hash: String,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub issuer: Option<String>,
}

impl AuthorizationContext {
    /// Project verified claims into the bounded field set.
    pub fn from_claims(claims: &Value, raw_token: &str) -> Self {
        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let client_id = claims
            .get("client_id")
            .or_else(|| claims.get("azp"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let scopes = parse_scopes(claims);
        let audience = parse_audience(claims.get("aud"));
        let token_type = claims
            .get("token_type")
            .and_then(Value::as_str)
            .unwrap_or("Bearer")
            .to_string();
        let issued_at = claims.get("iat").and_then(Value::as_i64).and_then(to_utc);
        let expires_at = claims.get("exp").and_then(Value::as_i64).and_then(to_utc);
        let issuer = claims
            .get("iss")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            subject,
            client_id,
            scopes,
            audience,
            token_type,
            token_hash: token_hash(raw_token),
            issued_at,
            expires_at,
            issuer,
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Seconds until expiry; `None` when the token carries no `exp`.
    pub fn expires_in(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at.map(|exp| (exp - now).num_seconds())
    }
}

/// `scope` may arrive as a space-delimited string or as an `scp` array.
fn parse_scopes(claims: &Value) -> Vec<String> {
    if let Some(scope) = claims.get("scope").and_then(Value::as_str) {
        return scope.split_whitespace().map(str::to_string).collect();
    }
    if let Some(scp) = claims.get("scp").and_then(Value::as_array) {
        return scp
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }
    Vec::new()
}

/// `aud` may be a single string or an array of strings.
pub fn parse_audience(aud: Option<&Value>) -> Vec<String> {
    match aud {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn to_utc(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Opaque refresh credentials held alongside a session's authorization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenRefresh {
    pub refresh_token: String,
    pub auth_server: String,
    pub scopes: Vec<String>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub attempts: u32,
}
