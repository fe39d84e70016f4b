//! JWKS cache
//!
//! Public keys fetched lazily from the authorization server's JWKS endpoint,
//! indexed by `kid`. The cache is bounded and entries expire, so key
//! rotation converges without restarts. An unknown `kid` forces a refresh
//! before failing.

use chrono::{DateTime, Utc};
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Cached key budget; the oldest entry is evicted beyond this.
const MAX_CACHED_KEYS: usize = 50;

/// Entry lifetime.
const KEY_TTL: Duration = Duration::from_secs(600);

/// Outbound fetch timeout.
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum JwksError {
    #[error("JWKS fetch failed: {0}")]
    Fetch(String),
    #[error("unknown key id")]
    UnknownKeyId,
    #[error("unusable JWK: {0}")]
    BadKey(String),
}

/// Raw JWK as returned by the endpoint; only the components we reconstruct
/// keys from are captured.
#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

/// Stored components; `DecodingKey` is rebuilt on demand since it does not
/// implement `Clone` for all key types.
#[derive(Debug, Clone)]
struct CachedJwk {
    kty: String,
    n: Option<String>,
    e: Option<String>,
    x: Option<String>,
    y: Option<String>,
    fetched_at: DateTime<Utc>,
}

impl CachedJwk {
    fn to_decoding_key(&self) -> Result<DecodingKey, JwksError> {
        match self.kty.as_str() {
            "RSA" => {
                let n = self
                    .n
                    .as_deref()
                    .ok_or_else(|| JwksError::BadKey("RSA key missing 'n'".into()))?;
                let e = self
                    .e
                    .as_deref()
                    .ok_or_else(|| JwksError::BadKey("RSA key missing 'e'".into()))?;
                DecodingKey::from_rsa_components(n, e)
                    .map_err(|err| JwksError::BadKey(format!("RSA components rejected: {err}")))
            }
            "EC" => {
                let x = self
                    .x
                    .as_deref()
                    .ok_or_else(|| JwksError::BadKey("EC key missing 'x'".into()))?;
                let y = self
                    .y
                    .as_deref()
                    .ok_or_else(|| JwksError::BadKey("EC key missing 'y'".into()))?;
                DecodingKey::from_ec_components(x, y)
                    .map_err(|err| JwksError::BadKey(format!("EC components rejected: {err}")))
            }
            other => Err(JwksError::BadKey(format!("unsupported key type: {other}"))),
        }
    }

    fn is_fresh(&self) -> bool {
        let age = Utc::now() - self.fetched_at;
        age.to_std().map(|age| age < KEY_TTL).unwrap_or(false)
    }
}

pub struct JwksCache {
    uri: String,
    client: reqwest::Client,
    keys: RwLock<HashMap<String, CachedJwk>>,
    refresh_lock: Mutex<()>,
}

impl JwksCache {
    pub fn new(uri: String) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            uri,
            client,
            keys: RwLock::new(HashMap::new()),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Decoding key for `kid`, refreshing the document when the entry is
    /// missing or stale.
    pub async fn get_key(&self, kid: &str) -> Result<DecodingKey, JwksError> {
        {
            let keys = self.keys.read().await;
            if let Some(cached) = keys.get(kid) {
                if cached.is_fresh() {
                    return cached.to_decoding_key();
                }
            }
        }

        self.refresh().await?;

        let keys = self.keys.read().await;
        keys.get(kid)
            .ok_or(JwksError::UnknownKeyId)?
            .to_decoding_key()
    }

    async fn refresh(&self) -> Result<(), JwksError> {
        let _guard = self.refresh_lock.lock().await;

        let response = self
            .client
            .get(&self.uri)
            .send()
            .await
            .map_err(|e| JwksError::Fetch(e.to_string()))?
            .error_for_status()
            .map_err(|e| JwksError::Fetch(e.to_string()))?;

        let document: JwksResponse = response
            .json()
            .await
            .map_err(|e| JwksError::Fetch(format!("failed to parse JWKS: {e}")))?;

        let now = Utc::now();
        let mut keys = self.keys.write().await;
        for jwk in document.keys {
            let Some(kid) = jwk.kid else { continue };
            keys.insert(
                kid,
                CachedJwk {
                    kty: jwk.kty,
                    n: jwk.n,
                    e: jwk.e,
                    x: jwk.x,
                    y: jwk.y,
                    fetched_at: now,
                },
            );
        }
        while keys.len() > MAX_CACHED_KEYS {
            let oldest = keys
                .iter()
                .min_by_key(|(_, v)| v.fetched_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    keys.remove(&k);
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut keys = self.keys.write().await;
        let before = keys.len();
        keys.retain(|_, v| v.is_fresh());
        before - keys.len()
    }

    pub async fn cached_key_count(&self) -> usize {
        self.keys.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsa_entry(age: chrono::Duration) -> CachedJwk {
        CachedJwk {
            kty: "RSA".to_string(),
            n: Some("AQAB".to_string()),
            e: Some("AQAB".to_string()),
            x: None,
            y: None,
            fetched_at: Utc::now() - age,
        }
    }

    #[test]
    fn freshness_follows_ttl() {
        assert!(rsa_entry(chrono::Duration::seconds(10)).is_fresh());
        assert!(!rsa_entry(chrono::Duration::seconds(601)).is_fresh());
    }

    #[test]
    fn unsupported_key_types_are_rejected() {
        let entry = CachedJwk {
            kty: "oct".to_string(),
            n: None,
            e: None,
            x: None,
            y: None,
            fetched_at: Utc::now(),
        };
        assert!(matches!(entry.to_decoding_key(), Err(JwksError::BadKey(_))));
    }

    #[tokio::test]
    async fn sweep_removes_stale_entries() {
        let cache = JwksCache::new("http://127.0.0.1:0/jwks".to_string());
        cache
            .keys
            .write()
            .await
            .insert("old".into(), rsa_entry(chrono::Duration::seconds(700)));
        cache
            .keys
            .write()
            .await
            .insert("new".into(), rsa_entry(chrono::Duration::seconds(1)));
        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.cached_key_count().await, 1);
    }
}
