//! Remote coordinator profile.
//!
//! Never opens a browser and never blocks: authorization URLs are returned
//! to the embedding application via
//! [`RemoteAuthCoordinator::get_auth_challenges`], and the application wires
//! [`RemoteAuthCoordinator::handle_completion`] into its own HTTP router as
//! the redirect endpoint. Multi-tenant: every operation is scoped by
//! `context_id`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::coordinator::{
    AuthChallenge, AuthCoordinator, ClientManager, CompletionSubscriber, ConnectOutcome,
    CoordinatorConfig, StorageBackend,
};
use crate::error::{Error, Result};

/// Coordinator profile for servers embedding the MCP client.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::collections::HashMap;
/// use mcp_delegate::coordinator::{
///     CoordinatorConfig, MemoryStorage, RemoteAuthCoordinator, ServerEntry,
/// };
///
/// # async fn example() -> mcp_delegate::Result<()> {
/// let coordinator = RemoteAuthCoordinator::new(
///     CoordinatorConfig::new("My Agent Platform")
///         .server("srv", ServerEntry::new("http://srv:8000/mcp")),
///     "https://platform.example/oauth/callback",
///     Arc::new(MemoryStorage::new()),
/// )?;
///
/// // Surface this to the end user out of band.
/// coordinator.connect("tenant-1", "srv").await?;
/// for challenge in coordinator.get_auth_challenges("tenant-1").await? {
///     println!("authorize at: {}", challenge.authorization_url);
/// }
///
/// // Wired into the embedding application's router:
/// let params: HashMap<String, String> = HashMap::new();
/// let (status, body) = coordinator.handle_completion(&params).await;
/// # Ok(())
/// # }
/// ```
pub struct RemoteAuthCoordinator {
    inner: Arc<AuthCoordinator>,
}

impl RemoteAuthCoordinator {
    /// Create the coordinator with the redirect URI the embedding
    /// application serves.
    pub fn new(
        config: CoordinatorConfig,
        redirect_uri: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        let inner = Arc::new(AuthCoordinator::new(config, redirect_uri.into(), storage)?);
        Ok(Self { inner })
    }

    /// The shared coordinator core.
    pub fn coordinator(&self) -> &Arc<AuthCoordinator> {
        &self.inner
    }

    /// A [`ClientManager`] over this coordinator.
    pub fn client_manager(&self) -> ClientManager {
        ClientManager::new(self.inner.clone())
    }

    /// Connect (context, server). Never blocks on user action: when
    /// authorization is required the challenge is returned immediately.
    pub async fn connect(&self, context_id: &str, server_name: &str) -> Result<ConnectOutcome> {
        self.inner.connect(context_id, server_name).await
    }

    /// Every challenge awaiting user completion for one context.
    pub async fn get_auth_challenges(&self, context_id: &str) -> Result<Vec<AuthChallenge>> {
        self.inner.get_auth_challenges(context_id).await
    }

    /// Subscribe to completion events.
    pub async fn subscribe(&self, subscriber: Arc<dyn CompletionSubscriber>) {
        self.inner.subscribe(subscriber).await;
    }

    /// The completion endpoint, framework-neutral: feed it the callback's
    /// query parameters, get an HTTP status and JSON body to respond with.
    ///
    /// Returns `200 {"status":"complete"}` when the code was redeemed and
    /// the token stored; a `4xx`/`5xx` JSON error document otherwise.
    pub async fn handle_completion(
        &self,
        params: &HashMap<String, String>,
    ) -> (u16, serde_json::Value) {
        completion_response(&self.inner, params).await
    }
}

/// Shared completion-endpoint behavior for both profiles.
pub(crate) async fn completion_response(
    coordinator: &AuthCoordinator,
    params: &HashMap<String, String>,
) -> (u16, serde_json::Value) {
    match coordinator.complete_authorization(params).await {
        Ok(_) => (200, serde_json::json!({ "status": "complete" })),
        Err(err) => {
            let (status, code) = match &err {
                Error::Protocol { code, .. } => (400, code.clone()),
                Error::TokenExchange { code, .. } => (400, code.clone()),
                Error::Config(_) => (500, "server_error".to_string()),
                Error::Storage(_) => (500, "server_error".to_string()),
                _ => (502, "temporarily_unavailable".to_string()),
            };
            tracing::debug!(error = %err, status, "authorization callback rejected");
            (
                status,
                serde_json::json!({
                    "error": code,
                    "error_description": err.to_string(),
                }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryStorage;

    fn coordinator() -> RemoteAuthCoordinator {
        RemoteAuthCoordinator::new(
            CoordinatorConfig::new("Test Platform"),
            "https://platform.example/oauth/callback",
            Arc::new(MemoryStorage::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_completion_endpoint_rejects_missing_state() {
        let coordinator = coordinator();
        let (status, body) = coordinator.handle_completion(&HashMap::new()).await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_completion_endpoint_rejects_replayed_state() {
        let coordinator = coordinator();
        let mut params = HashMap::new();
        params.insert("state".to_string(), "never-issued".to_string());
        params.insert("code".to_string(), "abc".to_string());

        let (status, body) = coordinator.handle_completion(&params).await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_no_challenges_for_fresh_context() {
        let coordinator = coordinator();
        let challenges = coordinator.get_auth_challenges("tenant-1").await.unwrap();
        assert!(challenges.is_empty());
    }
}
