//! Bearer token validation
//!
//! Two verification paths, tried in order: local JWT verification against a
//! cached JWKS, then RFC 7662 introspection. With neither configured the
//! validator fails closed. Raw token bytes never reach logs; diagnostics
//! carry reasons only.

use super::jwks::JwksCache;
use crate::config::AuthorizationConfig;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Signature algorithms accepted for JWT verification.
const ALLOWED_ALGORITHMS: &[Algorithm] = &[Algorithm::RS256, Algorithm::ES256];

const INTROSPECTION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Invalid or expired token")]
    Invalid,
    #[error("Token signature algorithm not allowed")]
    DisallowedAlgorithm,
    #[error("Token audience does not match this resource")]
    AudienceMismatch,
    #[error("Token introspection reports token inactive")]
    Inactive,
    #[error("Token introspection request failed")]
    IntrospectionUnavailable,
    #[error("No token validation method configured")]
    NoValidationMethod,
}

pub struct TokenValidator {
    config: Arc<AuthorizationConfig>,
    jwks: Option<Arc<JwksCache>>,
    http: reqwest::Client,
}

impl TokenValidator {
    pub fn new(config: Arc<AuthorizationConfig>) -> Self {
        let jwks = config.jwks_uri.as_ref().map(|uri| JwksCache::new(uri.clone()));
        let http = reqwest::Client::builder()
            .timeout(INTROSPECTION_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { config, jwks, http }
    }

    pub fn jwks_cache(&self) -> Option<Arc<JwksCache>> {
        self.jwks.clone()
    }

    /// Validate a bearer token and return its claims.
    pub async fn validate(&self, token: &str) -> Result<Value, TokenError> {
        if let Some(jwks) = &self.jwks {
            match self.verify_jwt(jwks, token).await {
                Ok(claims) => return Ok(claims),
                Err(err) => {
                    debug!(reason = %err, "JWT verification failed");
                    if self.config.introspection_endpoint.is_none() {
                        return Err(err);
                    }
                }
            }
        }

        if self.config.introspection_endpoint.is_some() {
            return self.introspect(token).await;
        }

        if self.jwks.is_none() {
            return Err(TokenError::NoValidationMethod);
        }
        Err(TokenError::Invalid)
    }

    async fn verify_jwt(&self, jwks: &JwksCache, token: &str) -> Result<Value, TokenError> {
        let header = decode_header(token).map_err(|_| TokenError::Invalid)?;
        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err(TokenError::DisallowedAlgorithm);
        }
        let kid = header.kid.as_deref().ok_or(TokenError::Invalid)?;
        let key = jwks.get_key(kid).await.map_err(|err| {
            debug!(reason = %err, "JWKS key lookup failed");
            TokenError::Invalid
        })?;

        let mut validation = Validation::new(header.alg);
        validation.algorithms = ALLOWED_ALGORITHMS.to_vec();
        validation.validate_exp = true;
        if self.config.validate_audience {
            validation.set_audience(&[&self.config.resource_uri]);
        } else {
            validation.validate_aud = false;
        }

        let data = decode::<Value>(token, &key, &validation).map_err(|err| {
            match err.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidAudience => TokenError::AudienceMismatch,
                _ => TokenError::Invalid,
            }
        })?;
        Ok(data.claims)
    }

    /// RFC 7662 introspection: form-encoded POST, `active=false` or any
    /// non-2xx response counts as invalid.
    async fn introspect(&self, token: &str) -> Result<Value, TokenError> {
        let endpoint = self
            .config
            .introspection_endpoint
            .as_ref()
            .ok_or(TokenError::NoValidationMethod)?;

        let response = self
            .http
            .post(endpoint)
            .form(&[("token", token), ("token_type_hint", "access_token")])
            .send()
            .await
            .map_err(|err| {
                warn!(reason = %err, "introspection endpoint unreachable");
                TokenError::IntrospectionUnavailable
            })?;

        if !response.status().is_success() {
            return Err(TokenError::Inactive);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|_| TokenError::IntrospectionUnavailable)?;

        if body.get("active").and_then(Value::as_bool) != Some(true) {
            return Err(TokenError::Inactive);
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthorizationConfig;

    fn validator(config: AuthorizationConfig) -> TokenValidator {
        TokenValidator::new(Arc::new(config))
    }

    #[tokio::test]
    async fn fails_closed_without_any_method() {
        let v = validator(AuthorizationConfig {
            enabled: true,
            ..AuthorizationConfig::default()
        });
        assert!(matches!(
            v.validate("some.jwt.token").await,
            Err(TokenError::NoValidationMethod)
        ));
    }

    #[tokio::test]
    async fn malformed_jwt_with_jwks_configured_is_invalid() {
        let v = validator(AuthorizationConfig {
            enabled: true,
            jwks_uri: Some("http://127.0.0.1:0/jwks".to_string()),
            ..AuthorizationConfig::default()
        });
        assert!(matches!(
            v.validate("not-a-jwt").await,
            Err(TokenError::Invalid)
        ));
    }

    #[tokio::test]
    async fn unreachable_introspection_is_reported_as_unavailable() {
        let v = validator(AuthorizationConfig {
            enabled: true,
            introspection_endpoint: Some("http://127.0.0.1:1/introspect".to_string()),
            ..AuthorizationConfig::default()
        });
        assert!(matches!(
            v.validate("opaque-token").await,
            Err(TokenError::IntrospectionUnavailable)
        ));
    }
}
