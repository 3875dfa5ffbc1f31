//! JWKS fetching and caching.
//!
//! [`JwksCache`] holds decoding keys per `jwks_uri`. Keys are refreshed when
//! the cache entry ages past its TTL or when a token presents an unknown
//! `kid`; in the unknown-`kid` case exactly one forced refresh happens
//! before the lookup fails. Concurrent readers that miss the same `kid`
//! coalesce onto a single in-flight fetch: the refresh happens under the
//! entry's write lock, and waiters re-check freshness after acquiring it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey};
use tokio::sync::RwLock;

/// Errors from JWKS endpoint fetching and key parsing.
#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    /// HTTP request to the JWKS endpoint failed.
    #[error("JWKS fetch failed: {0}")]
    Fetch(String),
    /// The JWKS JSON could not be parsed.
    #[error("JWKS parse error: {0}")]
    Parse(String),
    /// No suitable key was found for the given `kid`, even after a refresh.
    #[error("no JWKS key found{}", .kid.as_deref().map(|k| format!(" for kid \"{k}\"")).unwrap_or_default())]
    KeyNotFound {
        /// The `kid` from the token header, when present.
        kid: Option<String>,
    },
    /// A JWK could not be converted to a decoding key.
    #[error("invalid JWK: {0}")]
    InvalidKey(String),
}

/// A cached decoding key with the algorithm the JWKS declared for it.
#[derive(Clone)]
pub(crate) struct CachedKey {
    pub decoding_key: DecodingKey,
    pub algorithm: Algorithm,
}

struct JwksEntry {
    /// Keys indexed by `kid`; keys without a `kid` live under `None`.
    keys: HashMap<Option<String>, CachedKey>,
    fetched_at: Option<Instant>,
}

impl JwksEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at
            .is_some_and(|fetched_at| fetched_at.elapsed() < ttl)
    }

    fn fetched_within(&self, window: Duration) -> bool {
        self.fetched_at
            .is_some_and(|fetched_at| fetched_at.elapsed() < window)
    }
}

/// Cache of JWKS documents keyed by `jwks_uri`.
pub struct JwksCache {
    http: reqwest::Client,
    ttl: Duration,
    /// Floor between consecutive fetches of one URI; coalesces concurrent
    /// unknown-`kid` refreshers onto a single fetch.
    min_refresh_interval: Duration,
    entries: RwLock<HashMap<String, Arc<RwLock<JwksEntry>>>>,
}

impl JwksCache {
    /// Default cache TTL: 15 minutes.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

    /// Create a cache with the given TTL.
    pub fn new(http: reqwest::Client, ttl: Duration) -> Self {
        Self {
            http,
            ttl,
            min_refresh_interval: Duration::from_millis(500),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Look up the decoding key for `kid` in the JWKS at `jwks_uri`.
    ///
    /// Fetches the document when the entry is empty or stale. On unknown
    /// `kid`, forces one refresh and retries the lookup once before failing
    /// with [`JwksError::KeyNotFound`].
    pub(crate) async fn decoding_key(
        &self,
        jwks_uri: &str,
        kid: Option<&str>,
    ) -> Result<CachedKey, JwksError> {
        let entry = self.entry(jwks_uri).await;

        {
            let entry = entry.read().await;
            if entry.is_fresh(self.ttl)
                && let Some(key) = lookup_key(&entry.keys, kid)
            {
                return Ok(key);
            }
        }

        // Stale entry or unknown kid: refresh under the write lock. Waiters
        // that queued behind the same miss observe the fresh fetch and skip
        // their own.
        let mut entry = entry.write().await;
        if entry.fetched_within(self.min_refresh_interval) {
            return lookup_key(&entry.keys, kid).ok_or(JwksError::KeyNotFound {
                kid: kid.map(String::from),
            });
        }

        tracing::debug!(jwks_uri = %jwks_uri, "fetching JWKS");
        match self.fetch(jwks_uri).await {
            Ok(keys) => {
                entry.keys = keys;
                entry.fetched_at = Some(Instant::now());
            }
            Err(err) => {
                // Keep stale keys on fetch failure, but stamp the attempt so
                // every request does not retry immediately.
                tracing::warn!(jwks_uri = %jwks_uri, error = %err, "JWKS refresh failed, keeping stale keys");
                if entry.keys.is_empty() {
                    return Err(err);
                }
                entry.fetched_at = Some(Instant::now());
            }
        }

        lookup_key(&entry.keys, kid).ok_or(JwksError::KeyNotFound {
            kid: kid.map(String::from),
        })
    }

    async fn entry(&self, jwks_uri: &str) -> Arc<RwLock<JwksEntry>> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(jwks_uri) {
                return entry.clone();
            }
        }
        let mut entries = self.entries.write().await;
        entries
            .entry(jwks_uri.to_string())
            .or_insert_with(|| {
                Arc::new(RwLock::new(JwksEntry {
                    keys: HashMap::new(),
                    fetched_at: None,
                }))
            })
            .clone()
    }

    async fn fetch(
        &self,
        jwks_uri: &str,
    ) -> Result<HashMap<Option<String>, CachedKey>, JwksError> {
        let response = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| JwksError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(JwksError::Fetch(format!(
                "{} returned status {}",
                jwks_uri,
                response.status()
            )));
        }

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| JwksError::Parse(e.to_string()))?;

        parse_jwk_set(&jwks)
    }
}

/// Look up a key by `kid`, falling back to the only key when the set has
/// exactly one.
fn lookup_key(
    keys: &HashMap<Option<String>, CachedKey>,
    kid: Option<&str>,
) -> Option<CachedKey> {
    if let Some(key) = keys.get(&kid.map(String::from)) {
        return Some(key.clone());
    }
    if keys.len() == 1 {
        return keys.values().next().cloned();
    }
    None
}

/// Convert a JWK set into a `kid -> CachedKey` map.
fn parse_jwk_set(jwks: &JwkSet) -> Result<HashMap<Option<String>, CachedKey>, JwksError> {
    let mut keys = HashMap::new();

    for jwk in &jwks.keys {
        let algorithm = jwk
            .common
            .key_algorithm
            .and_then(key_algorithm_to_algorithm)
            .or_else(|| infer_algorithm_from_key_type(jwk))
            .ok_or_else(|| {
                JwksError::InvalidKey(format!(
                    "cannot determine algorithm for key {:?}",
                    jwk.common.key_id
                ))
            })?;

        let decoding_key = DecodingKey::from_jwk(jwk)
            .map_err(|e| JwksError::InvalidKey(format!("failed to create decoding key: {e}")))?;

        keys.insert(
            jwk.common.key_id.clone(),
            CachedKey {
                decoding_key,
                algorithm,
            },
        );
    }

    Ok(keys)
}

fn key_algorithm_to_algorithm(ka: jsonwebtoken::jwk::KeyAlgorithm) -> Option<Algorithm> {
    use jsonwebtoken::jwk::KeyAlgorithm;
    match ka {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    }
}

/// Infer the algorithm from the JWK key type when `alg` is absent.
fn infer_algorithm_from_key_type(jwk: &jsonwebtoken::jwk::Jwk) -> Option<Algorithm> {
    use jsonwebtoken::jwk::AlgorithmParameters;
    match &jwk.algorithm {
        AlgorithmParameters::RSA(_) => Some(Algorithm::RS256),
        AlgorithmParameters::EllipticCurve(ec) => {
            use jsonwebtoken::jwk::EllipticCurve;
            match ec.curve {
                EllipticCurve::P256 => Some(Algorithm::ES256),
                EllipticCurve::P384 => Some(Algorithm::ES384),
                _ => None,
            }
        }
        AlgorithmParameters::OctetKey(_) => Some(Algorithm::HS256),
        AlgorithmParameters::OctetKeyPair(_) => Some(Algorithm::EdDSA),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oct_jwk(kid: Option<&str>) -> serde_json::Value {
        use base64::Engine as _;
        let k = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"shared-test-secret");
        let mut jwk = serde_json::json!({
            "kty": "oct",
            "k": k,
            "alg": "HS256",
        });
        if let Some(kid) = kid {
            jwk["kid"] = serde_json::json!(kid);
        }
        jwk
    }

    #[test]
    fn test_parse_jwk_set_with_kid() {
        let jwks: JwkSet =
            serde_json::from_value(serde_json::json!({"keys": [oct_jwk(Some("k1"))]})).unwrap();
        let keys = parse_jwk_set(&jwks).unwrap();
        assert_eq!(keys.len(), 1);
        let key = &keys[&Some("k1".to_string())];
        assert!(matches!(key.algorithm, Algorithm::HS256));
    }

    #[test]
    fn test_parse_jwk_set_without_kid_stores_under_none() {
        let jwks: JwkSet =
            serde_json::from_value(serde_json::json!({"keys": [oct_jwk(None)]})).unwrap();
        let keys = parse_jwk_set(&jwks).unwrap();
        assert!(keys.contains_key(&None));
    }

    #[test]
    fn test_lookup_key_exact_and_fallback() {
        let jwks: JwkSet = serde_json::from_value(serde_json::json!({
            "keys": [oct_jwk(Some("k1"))]
        }))
        .unwrap();
        let keys = parse_jwk_set(&jwks).unwrap();

        assert!(lookup_key(&keys, Some("k1")).is_some());
        // Single-key fallback applies regardless of the requested kid.
        assert!(lookup_key(&keys, Some("other")).is_some());
        assert!(lookup_key(&keys, None).is_some());
    }

    #[test]
    fn test_lookup_key_no_fallback_with_multiple_keys() {
        let jwks: JwkSet = serde_json::from_value(serde_json::json!({
            "keys": [oct_jwk(Some("k1")), oct_jwk(Some("k2"))]
        }))
        .unwrap();
        let keys = parse_jwk_set(&jwks).unwrap();

        assert!(lookup_key(&keys, Some("k1")).is_some());
        assert!(lookup_key(&keys, Some("k3")).is_none());
    }

    #[test]
    fn test_error_display_mentions_kid() {
        let err = JwksError::KeyNotFound {
            kid: Some("rotated".to_string()),
        };
        assert!(err.to_string().contains("rotated"));

        let err = JwksError::KeyNotFound { kid: None };
        assert!(err.to_string().contains("no JWKS key found"));
    }
}
