//! Storage backend contract and persisted records.
//!
//! The coordinator persists four record kinds in one key/value namespace:
//!
//! | Key | Record |
//! |---|---|
//! | `client:{zone}:{app_name}` | registered client |
//! | `token:{context_id}:{server_name}` | token record |
//! | `pending:{context_id}:{server_name}` | PKCE verifier + state + created_at |
//! | `state:{opaque_state}` | reverse index to (context_id, server_name) |
//!
//! Every per-user key embeds the `context_id`, which is the isolation
//! boundary: two contexts never observe each other's tokens or pending
//! records. The contract is get/set/delete by string key plus an atomic
//! [`StorageBackend::take`] used to consume single-use records (pending
//! authorizations and their state index).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::oauth::types::TokenResponse;

/// Key/value storage used by the coordinator.
///
/// Implementations must be linearizable per key; no cross-key transactions
/// are required.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any existing one.
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Delete a value. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically read and delete a value.
    ///
    /// Used to consume single-use records: of any number of concurrent
    /// takers of one key, at most one observes the value.
    async fn take(&self, key: &str) -> Result<Option<String>>;
}

/// In-memory storage backend.
///
/// The default backend for single-process deployments and tests. State does
/// not survive a restart; production deployments supply their own
/// [`StorageBackend`] over a durable store.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.remove(key))
    }
}

/// Storage key construction.
pub mod keys {
    /// Registered client record for (zone, application name).
    pub fn client(zone_url: &str, app_name: &str) -> String {
        format!("client:{zone_url}:{app_name}")
    }

    /// Token record for (context, server).
    pub fn token(context_id: &str, server_name: &str) -> String {
        format!("token:{context_id}:{server_name}")
    }

    /// Pending authorization for (context, server).
    pub fn pending(context_id: &str, server_name: &str) -> String {
        format!("pending:{context_id}:{server_name}")
    }

    /// Reverse index from an opaque `state` value.
    pub fn state(state: &str) -> String {
        format!("state:{state}")
    }
}

/// Read and deserialize a record.
pub(crate) async fn read_json<T: DeserializeOwned>(
    storage: &dyn StorageBackend,
    key: &str,
) -> Result<Option<T>> {
    match storage.get(key).await? {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw).map(Some).map_err(Error::storage),
    }
}

/// Serialize and write a record.
pub(crate) async fn write_json<T: Serialize>(
    storage: &dyn StorageBackend,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_string(value).map_err(Error::storage)?;
    storage.set(key, raw).await
}

/// Atomically consume and deserialize a record.
pub(crate) async fn take_json<T: DeserializeOwned>(
    storage: &dyn StorageBackend,
    key: &str,
) -> Result<Option<T>> {
    match storage.take(key).await? {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw).map(Some).map_err(Error::storage),
    }
}

/// A persisted access token for one (context, server) pair.
///
/// Records are immutable: refresh or re-authentication writes a replacement,
/// never mutates in place. Expired records are discarded lazily on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    /// The access token (opaque).
    pub access_token: String,
    /// Token type, normally `"Bearer"`.
    pub token_type: String,
    /// Refresh token, when the zone issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absolute expiry instant; `None` means non-expiring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Granted scopes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    /// The resource (audience) the token was issued for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// The zone that issued the token, for refresh grants.
    pub zone_url: String,
}

impl TokenRecord {
    /// Build a record from a token endpoint response.
    pub fn from_response(
        response: &TokenResponse,
        zone_url: impl Into<String>,
        resource: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: response.access_token.clone(),
            token_type: response.token_type.clone(),
            refresh_token: response.refresh_token.clone(),
            expires_at: response.expires_at(now),
            scope: response.scope.clone(),
            resource,
            zone_url: zone_url.into(),
        }
    }

    /// Whether the token is still usable at `now`, keeping `margin` of
    /// remaining lifetime in hand.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => expires_at - margin > now,
        }
    }
}

/// Short-lived record correlating an authorization request with its
/// callback. Written before the user is redirected, consumed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuthorization {
    /// PKCE code verifier (single-use).
    pub verifier: String,
    /// Opaque `state` correlation value.
    pub state: String,
    /// When the authorization URL was issued.
    pub created_at: DateTime<Utc>,
    /// The URL the user must visit.
    pub authorization_url: String,
    /// Zone that will redeem the code.
    pub zone_url: String,
    /// Registered client redeeming the code.
    pub client_id: String,
    /// Redirect URI bound to the authorization request.
    pub redirect_uri: String,
    /// Resource indicator sent with the request.
    pub resource: String,
}

impl PendingAuthorization {
    /// Whether the record has outlived the pending TTL at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        self.created_at + ttl < now
    }
}

/// Reverse index entry: which (context, server) a callback `state` belongs
/// to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateIndex {
    pub context_id: String,
    pub server_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_response(expires_in: Option<u64>) -> TokenResponse {
        let mut value = serde_json::json!({
            "access_token": "T1",
            "token_type": "Bearer",
            "refresh_token": "R1",
            "scope": "mcp:read"
        });
        if let Some(secs) = expires_in {
            value["expires_in"] = serde_json::json!(secs);
        }
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        storage.set("k", "v".to_string()).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some("v".to_string()));

        storage.delete("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);

        // Deleting a missing key is fine.
        storage.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_take_is_single_use() {
        let storage = MemoryStorage::new();
        storage.set("pending:a:srv", "{}".to_string()).await.unwrap();

        assert!(storage.take("pending:a:srv").await.unwrap().is_some());
        assert!(storage.take("pending:a:srv").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_take_yields_one_winner() {
        use std::sync::Arc;

        let storage = Arc::new(MemoryStorage::new());
        storage.set("state:s1", "{}".to_string()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage.take("state:s1").await.unwrap().is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_key_scheme() {
        assert_eq!(
            keys::client("https://acme.zones.example", "My App"),
            "client:https://acme.zones.example:My App"
        );
        assert_eq!(keys::token("alice", "srv"), "token:alice:srv");
        assert_eq!(keys::pending("alice", "srv"), "pending:alice:srv");
        assert_eq!(keys::state("xyz"), "state:xyz");
    }

    #[test]
    fn test_token_record_freshness_margin() {
        let now = Utc::now();
        let mut record = TokenRecord::from_response(
            &token_response(Some(3600)),
            "https://acme.zones.example",
            Some("http://srv:8000/".to_string()),
            now,
        );
        let margin = chrono::Duration::seconds(30);

        assert!(record.is_fresh(now, margin));

        // 20 seconds of lifetime left is inside the 30 second margin.
        record.expires_at = Some(now + chrono::Duration::seconds(20));
        assert!(!record.is_fresh(now, margin));

        record.expires_at = None;
        assert!(record.is_fresh(now, margin));
    }

    #[test]
    fn test_pending_expiry() {
        let now = Utc::now();
        let pending = PendingAuthorization {
            verifier: "v".to_string(),
            state: "s".to_string(),
            created_at: now - chrono::Duration::seconds(700),
            authorization_url: "https://zone.example/authorize?x".to_string(),
            zone_url: "https://zone.example".to_string(),
            client_id: "c123".to_string(),
            redirect_uri: "http://localhost:8080/oauth/callback".to_string(),
            resource: "http://srv:8000/".to_string(),
        };

        assert!(pending.is_expired(now, chrono::Duration::seconds(600)));
        assert!(!pending.is_expired(now, chrono::Duration::seconds(800)));
    }

    #[tokio::test]
    async fn test_json_helpers_roundtrip() {
        let storage = MemoryStorage::new();
        let record = StateIndex {
            context_id: "alice".to_string(),
            server_name: "srv".to_string(),
        };

        write_json(&storage, "state:s1", &record).await.unwrap();
        let loaded: StateIndex = read_json(&storage, "state:s1").await.unwrap().unwrap();
        assert_eq!(loaded.context_id, "alice");

        let taken: Option<StateIndex> = take_json(&storage, "state:s1").await.unwrap();
        assert!(taken.is_some());
        let gone: Option<StateIndex> = read_json(&storage, "state:s1").await.unwrap();
        assert!(gone.is_none());
    }
}
