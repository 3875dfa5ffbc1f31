//! Local coordinator profile.
//!
//! Runs a loopback HTTP listener for the OAuth redirect, opens the
//! authorization URL in the system browser, and (by default) blocks the
//! connecting caller until the callback arrives. Single-process; meant for
//! CLIs, desktop apps, and local development.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use tokio::sync::{Mutex, oneshot};

use crate::coordinator::{
    AuthCoordinator, ClientManager, ConnectOutcome, CoordinatorConfig, StorageBackend,
    remote::completion_response,
};
use crate::error::{Error, Result};

/// Loopback listener and browser behavior for the Local profile.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Host name used in the redirect URI and bound by the listener.
    pub host: String,
    /// Listener port; `0` lets the OS pick one.
    pub port: u16,
    /// Path of the redirect endpoint.
    pub callback_path: String,
    /// Open the authorization URL in the system browser.
    pub auto_open_browser: bool,
    /// Block `connect` until the callback completes the flow.
    pub block_until_callback: bool,
    /// Upper bound on the callback wait. No bound by default.
    pub callback_timeout: Option<Duration>,
    /// How often the blocking wait re-checks the session.
    pub poll_interval: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 0,
            callback_path: "/oauth/callback".to_string(),
            auto_open_browser: true,
            block_until_callback: true,
            callback_timeout: None,
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Coordinator profile that serves the OAuth redirect on a loopback
/// listener and drives the browser flow itself.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use mcp_delegate::coordinator::{
///     CoordinatorConfig, LocalAuthCoordinator, LocalConfig, MemoryStorage, ServerEntry,
/// };
///
/// # async fn example() -> mcp_delegate::Result<()> {
/// let coordinator = LocalAuthCoordinator::start(
///     CoordinatorConfig::new("My MCP Client")
///         .server("srv", ServerEntry::new("http://srv:8000/mcp")),
///     LocalConfig::default(),
///     Arc::new(MemoryStorage::new()),
/// )
/// .await?;
///
/// // Blocks until the user finishes the browser flow.
/// let outcome = coordinator.connect("default", "srv").await?;
/// assert!(outcome.is_connected());
/// # Ok(())
/// # }
/// ```
pub struct LocalAuthCoordinator {
    inner: Arc<AuthCoordinator>,
    local: LocalConfig,
    bound_addr: SocketAddr,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl LocalAuthCoordinator {
    /// Bind the loopback listener, start serving the callback endpoint, and
    /// return the coordinator.
    pub async fn start(
        config: CoordinatorConfig,
        local: LocalConfig,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        if !local.callback_path.starts_with('/') {
            return Err(Error::config(format!(
                "callback_path must start with '/', got {:?}",
                local.callback_path
            )));
        }

        let listener =
            tokio::net::TcpListener::bind((local.host.as_str(), local.port))
                .await
                .map_err(|e| {
                    Error::Network(format!(
                        "failed to bind callback listener on {}:{}: {e}",
                        local.host, local.port
                    ))
                })?;
        let bound_addr = listener
            .local_addr()
            .map_err(|e| Error::Network(format!("failed to read listener address: {e}")))?;

        let redirect_uri = format!(
            "http://{}:{}{}",
            local.host,
            bound_addr.port(),
            local.callback_path
        );
        let inner = Arc::new(AuthCoordinator::new(config, redirect_uri, storage)?);

        let router = Router::new()
            .route(&local.callback_path, get(callback_handler))
            .with_state(inner.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                tracing::error!(error = %err, "callback listener failed");
            }
        });

        tracing::debug!(addr = %bound_addr, "callback listener started");
        Ok(Self {
            inner,
            local,
            bound_addr,
            shutdown: Mutex::new(Some(shutdown_tx)),
        })
    }

    /// The shared coordinator core.
    pub fn coordinator(&self) -> &Arc<AuthCoordinator> {
        &self.inner
    }

    /// A [`ClientManager`] over this coordinator.
    pub fn client_manager(&self) -> ClientManager {
        ClientManager::new(self.inner.clone())
    }

    /// The address the callback listener is bound to.
    pub fn callback_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// The redirect URI registered with authorization servers.
    pub fn redirect_uri(&self) -> &str {
        self.inner.redirect_uri()
    }

    /// Connect (context, server).
    ///
    /// When authorization is required, opens the browser (unless
    /// suppressed). With `block_until_callback` (the default) this awaits
    /// the callback, then reconnects and returns the final outcome; with it
    /// disabled the challenge is returned immediately and the caller polls
    /// [`AuthCoordinator::get_auth_pending`] until it yields `None`.
    pub async fn connect(&self, context_id: &str, server_name: &str) -> Result<ConnectOutcome> {
        let outcome = self.inner.connect(context_id, server_name).await?;
        let ConnectOutcome::AuthorizationRequired(challenge) = &outcome else {
            return Ok(outcome);
        };

        if self.local.auto_open_browser {
            open_browser(&challenge.authorization_url);
        } else {
            tracing::info!(
                url = %challenge.authorization_url,
                "authorization required; open this URL to continue"
            );
        }

        if !self.local.block_until_callback {
            return Ok(outcome);
        }

        self.wait_for_completion(context_id, server_name).await?;
        self.inner.connect(context_id, server_name).await
    }

    /// Stop the loopback listener.
    pub async fn shutdown(&self) {
        if let Some(sender) = self.shutdown.lock().await.take() {
            let _ = sender.send(());
        }
    }

    async fn wait_for_completion(&self, context_id: &str, server_name: &str) -> Result<()> {
        let wait = async {
            loop {
                if self
                    .inner
                    .get_auth_pending(context_id, server_name)
                    .await?
                    .is_none()
                {
                    return Ok::<(), Error>(());
                }
                tokio::time::sleep(self.local.poll_interval).await;
            }
        };

        match self.local.callback_timeout {
            None => wait.await,
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(result) => result,
                Err(_) => {
                    self.inner
                        .cancel_authorization(context_id, server_name)
                        .await?;
                    Err(Error::Network(
                        "timed out waiting for the authorization callback".to_string(),
                    ))
                }
            },
        }
    }
}

async fn callback_handler(
    State(coordinator): State<Arc<AuthCoordinator>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (status, body) = completion_response(&coordinator, &params).await;
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST),
        Json(body),
    )
        .into_response()
}

/// Open a URL in the user's default browser. Failures are ignored; the URL
/// is always also logged so the user can open it manually.
fn open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    {
        let _ = std::process::Command::new("open").arg(url).spawn();
    }
    #[cfg(target_os = "linux")]
    {
        let _ = std::process::Command::new("xdg-open").arg(url).spawn();
    }
    #[cfg(target_os = "windows")]
    {
        let _ = std::process::Command::new("cmd")
            .args(["/C", "start", "", url])
            .spawn();
    }
    tracing::info!(url = %url, "opening authorization URL in browser");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryStorage;

    #[tokio::test]
    async fn test_start_binds_ephemeral_port_and_builds_redirect_uri() {
        let local = LocalConfig {
            host: "127.0.0.1".to_string(),
            auto_open_browser: false,
            ..LocalConfig::default()
        };
        let coordinator = LocalAuthCoordinator::start(
            CoordinatorConfig::new("Test Client"),
            local,
            Arc::new(MemoryStorage::new()),
        )
        .await
        .unwrap();

        let port = coordinator.callback_addr().port();
        assert_ne!(port, 0);
        assert_eq!(
            coordinator.redirect_uri(),
            format!("http://127.0.0.1:{port}/oauth/callback")
        );

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_callback_endpoint_rejects_unknown_state() {
        let local = LocalConfig {
            host: "127.0.0.1".to_string(),
            auto_open_browser: false,
            ..LocalConfig::default()
        };
        let coordinator = LocalAuthCoordinator::start(
            CoordinatorConfig::new("Test Client"),
            local,
            Arc::new(MemoryStorage::new()),
        )
        .await
        .unwrap();

        let url = format!(
            "http://{}{}?code=abc&state=unknown",
            coordinator.callback_addr(),
            "/oauth/callback"
        );
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status().as_u16(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "invalid_request");

        coordinator.shutdown().await;
    }

    #[test]
    fn test_rejects_relative_callback_path() {
        let local = LocalConfig {
            callback_path: "oauth/callback".to_string(),
            ..LocalConfig::default()
        };
        let result = futures::executor::block_on(LocalAuthCoordinator::start(
            CoordinatorConfig::new("Test Client"),
            local,
            Arc::new(MemoryStorage::new()),
        ));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
