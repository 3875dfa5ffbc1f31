//! Client-side auth coordinator.
//!
//! [`AuthCoordinator`] drives OAuth on behalf of an MCP client talking to
//! one or more upstream MCP servers. It owns the per-(context, server)
//! [`Session`] state machines, performs dynamic client registration against
//! each upstream's authorization server (cached per zone), runs the PKCE
//! authorization-code flow, persists tokens across restarts, and notifies
//! [`CompletionSubscriber`]s when callbacks complete.
//!
//! Two operational profiles wrap the same core:
//!
//! - [`local::LocalAuthCoordinator`] opens the system browser and serves the
//!   redirect on a loopback listener, optionally blocking until the
//!   callback arrives. Single process, CLI and desktop apps.
//! - [`remote::RemoteAuthCoordinator`] never opens a browser: it hands the
//!   authorization URL to the embedding application and exposes a
//!   framework-neutral completion endpoint. Non-blocking, multi-tenant.

pub mod events;
pub mod local;
pub mod remote;
pub mod session;
pub mod storage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use url::Url;

use crate::error::{Error, Result};
use crate::metadata::ProtectedResourceMetadata;
use crate::oauth::pkce::{PkceChallenge, generate_state};
use crate::oauth::types::{
    AuthorizationRequest, ClientConfig, ClientRegistrationRequest, ClientRegistrationResponse,
};
use crate::oauth::{AuthScheme, OAuthClient, RetryPolicy};

// Re-exports
pub use events::{CompletionEvent, CompletionSubscriber};
pub use local::{LocalAuthCoordinator, LocalConfig};
pub use remote::RemoteAuthCoordinator;
pub use session::{Session, SessionStatus};
pub use storage::{
    MemoryStorage, PendingAuthorization, StateIndex, StorageBackend, TokenRecord, keys,
};

use storage::{read_json, take_json, write_json};

/// How the coordinator authenticates to one upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerAuth {
    /// OAuth authorization-code flow with PKCE (the default).
    #[default]
    Oauth,
    /// No authentication; the server is public.
    None,
}

/// Configuration for one upstream MCP server.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    /// The server's MCP endpoint URL.
    pub url: String,
    /// Transport label (e.g. `"streamable-http"`), passed through to the
    /// embedding MCP client; the coordinator does not interpret it.
    pub transport: Option<String>,
    /// How to authenticate to it.
    pub auth: ServerAuth,
}

impl ServerEntry {
    /// An OAuth-protected server.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            transport: None,
            auth: ServerAuth::Oauth,
        }
    }

    /// A public server needing no authentication.
    pub fn public(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            transport: None,
            auth: ServerAuth::None,
        }
    }

    /// Set the transport label.
    pub fn transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = Some(transport.into());
        self
    }
}

/// Client metadata sent during RFC 7591 dynamic registration.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Grant types the registered client will use.
    pub grant_types: Vec<String>,
    /// Response types the registered client will use.
    pub response_types: Vec<String>,
    /// Token endpoint authentication method. `"none"` for public clients.
    pub token_endpoint_auth_method: String,
    /// Scope to request during authorization.
    pub scope: Option<String>,
    /// URL of the client's JSON Web Key Set, for zones that verify client
    /// assertions.
    pub client_jwks_url: Option<String>,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            grant_types: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ],
            response_types: vec!["code".to_string()],
            token_endpoint_auth_method: "none".to_string(),
            scope: None,
            client_jwks_url: None,
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Upstream servers by name.
    pub servers: HashMap<String, ServerEntry>,
    /// Logical application name; keys the registered-client cache.
    pub client_name: String,
    /// Client metadata for dynamic registration.
    pub registration: RegistrationConfig,
    /// How long a pending authorization may await user completion.
    pub pending_ttl: Duration,
    /// Remaining token lifetime below which a refresh or re-auth is
    /// triggered.
    pub safety_margin: Duration,
    /// Backoff policy for MCP probes and OAuth calls.
    pub retry: RetryPolicy,
    /// Per-request deadline for HTTP calls.
    pub http_timeout: Duration,
    /// Route authorization through RFC 9126 PAR when the zone advertises
    /// support. Off by default; the coordinator falls back to a plain
    /// authorization URL when the push fails.
    pub use_par: bool,
}

impl CoordinatorConfig {
    /// Configuration with defaults for everything but the client name.
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            servers: HashMap::new(),
            client_name: client_name.into(),
            registration: RegistrationConfig::default(),
            pending_ttl: Duration::from_secs(600),
            safety_margin: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            http_timeout: Duration::from_secs(30),
            use_par: false,
        }
    }

    /// Add an upstream server.
    pub fn server(mut self, name: impl Into<String>, entry: ServerEntry) -> Self {
        self.servers.insert(name.into(), entry);
        self
    }

    /// Set the pending-authorization TTL.
    pub fn pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    /// Set the token safety margin.
    pub fn safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    /// Enable PAR routing.
    pub fn use_par(mut self, use_par: bool) -> Self {
        self.use_par = use_par;
        self
    }

    /// Set the registration metadata.
    pub fn registration(mut self, registration: RegistrationConfig) -> Self {
        self.registration = registration;
        self
    }
}

/// An authorization the user must complete.
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub context_id: String,
    pub server_name: String,
    /// URL to open in a browser.
    pub authorization_url: String,
    /// The flow's opaque correlation value.
    pub state: String,
}

/// Result of a connection attempt.
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    /// Authenticated (or public); tool calls may proceed.
    Connected,
    /// The user must complete an authorization flow first.
    AuthorizationRequired(AuthChallenge),
    /// The attempt failed; the session is in a retriable failure state.
    Failed {
        status: SessionStatus,
        reason: String,
    },
}

impl ConnectOutcome {
    /// Whether the session reached [`SessionStatus::Connected`].
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectOutcome::Connected)
    }
}

struct ProbeResponse {
    status: u16,
    www_authenticate: Option<String>,
}

/// Shared coordinator core. Construct through
/// [`LocalAuthCoordinator`](local::LocalAuthCoordinator) or
/// [`RemoteAuthCoordinator`](remote::RemoteAuthCoordinator).
pub struct AuthCoordinator {
    config: CoordinatorConfig,
    redirect_uri: String,
    http: reqwest::Client,
    storage: Arc<dyn StorageBackend>,
    sessions: Mutex<HashMap<(String, String), Arc<Mutex<Session>>>>,
    zone_clients: Mutex<HashMap<String, Arc<OAuthClient>>>,
    registration_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events: events::EventDispatcher,
}

impl AuthCoordinator {
    pub(crate) fn new(
        config: CoordinatorConfig,
        redirect_uri: String,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        if config.client_name.is_empty() {
            return Err(Error::config("client_name is required"));
        }
        Url::parse(&redirect_uri)
            .map_err(|e| Error::config(format!("invalid redirect_uri {redirect_uri:?}: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            redirect_uri,
            http,
            storage,
            sessions: Mutex::new(HashMap::new()),
            zone_clients: Mutex::new(HashMap::new()),
            registration_locks: Mutex::new(HashMap::new()),
            events: events::EventDispatcher::new(),
        })
    }

    /// The redirect URI bound to every authorization request.
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// The coordinator configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The storage backend.
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Subscribe to completion events.
    pub async fn subscribe(&self, subscriber: Arc<dyn CompletionSubscriber>) {
        self.events.subscribe(subscriber).await;
    }

    /// The session for (context, server), creating it on first use.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the server name is not configured.
    async fn session(&self, context_id: &str, server_name: &str) -> Result<Arc<Mutex<Session>>> {
        let entry = self
            .config
            .servers
            .get(server_name)
            .ok_or_else(|| Error::config(format!("unknown server {server_name:?}")))?
            .clone();

        let mut sessions = self.sessions.lock().await;
        Ok(sessions
            .entry((context_id.to_string(), server_name.to_string()))
            .or_insert_with(|| {
                Arc::new(Mutex::new(Session::new(context_id, server_name, entry)))
            })
            .clone())
    }

    /// Current session status for (context, server).
    pub async fn session_status(
        &self,
        context_id: &str,
        server_name: &str,
    ) -> Result<SessionStatus> {
        let session = self.session(context_id, server_name).await?;
        let status = session.lock().await.status();
        Ok(status)
    }

    /// Attach opaque metadata to a session; copied onto its completion
    /// events.
    pub async fn set_session_metadata(
        &self,
        context_id: &str,
        server_name: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let session = self.session(context_id, server_name).await?;
        session.lock().await.metadata = metadata;
        Ok(())
    }

    /// Connect (context, server): probe the MCP endpoint with the stored
    /// token, and on a `401` challenge run discovery, registration, and
    /// PKCE setup, leaving the session awaiting user authorization.
    pub async fn connect(&self, context_id: &str, server_name: &str) -> Result<ConnectOutcome> {
        self.expire_stale_pending(context_id, server_name).await?;

        let session = self.session(context_id, server_name).await?;
        let mut session = session.lock().await;

        if session.status() == SessionStatus::AuthPending {
            // An authorization is already in flight; hand back the same
            // challenge rather than minting a new one.
            return Ok(ConnectOutcome::AuthorizationRequired(challenge_of(
                &session,
            )));
        }

        if session.status() != SessionStatus::Connecting {
            session.transition(SessionStatus::Connecting);
        }

        let entry = session.server_config.clone();
        let token = match entry.auth {
            ServerAuth::Oauth => self.valid_access_token(context_id, server_name).await?,
            ServerAuth::None => None,
        };

        let probe = self.probe(&entry.url, token.as_deref()).await;
        match probe {
            Ok(response) if (200..300).contains(&response.status) => {
                session.transition(SessionStatus::Connected);
                Ok(ConnectOutcome::Connected)
            }
            Ok(response) if response.status == 401 && entry.auth == ServerAuth::Oauth => {
                session.transition(SessionStatus::Authenticating);
                match self
                    .begin_authorization(&mut session, &entry, response.www_authenticate.as_deref())
                    .await
                {
                    Ok(challenge) => Ok(ConnectOutcome::AuthorizationRequired(challenge)),
                    Err(err) => {
                        let reason = err.to_string();
                        session.mark_failed(SessionStatus::AuthFailed, reason.clone());
                        Ok(ConnectOutcome::Failed {
                            status: SessionStatus::AuthFailed,
                            reason,
                        })
                    }
                }
            }
            Ok(response) => {
                let reason = format!("server returned status {}", response.status);
                session.mark_failed(SessionStatus::ConnectionFailed, reason.clone());
                Ok(ConnectOutcome::Failed {
                    status: SessionStatus::ConnectionFailed,
                    reason,
                })
            }
            Err(err) => {
                let reason = err.to_string();
                session.mark_failed(SessionStatus::ConnectionFailed, reason.clone());
                Ok(ConnectOutcome::Failed {
                    status: SessionStatus::ConnectionFailed,
                    reason,
                })
            }
        }
    }

    /// A valid access token for (context, server), refreshing or discarding
    /// an expiring record.
    ///
    /// Returns `None` when no usable token exists; the caller should
    /// reconnect to provoke a fresh challenge. Refresh is an optimization:
    /// any refresh failure silently falls back to re-authentication.
    pub async fn valid_access_token(
        &self,
        context_id: &str,
        server_name: &str,
    ) -> Result<Option<String>> {
        let key = keys::token(context_id, server_name);
        let Some(record) = read_json::<TokenRecord>(self.storage.as_ref(), &key).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        let margin = chrono::Duration::from_std(self.config.safety_margin)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));

        if record.is_fresh(now, margin) {
            return Ok(Some(record.access_token));
        }

        if let Some(refresh_token) = &record.refresh_token {
            let zone = self.zone_client(&record.zone_url).await?;
            match zone
                .refresh_token(refresh_token, record.resource.as_deref(), None)
                .await
            {
                Ok(response) => {
                    let mut replacement = TokenRecord::from_response(
                        &response,
                        &record.zone_url,
                        record.resource.clone(),
                        now,
                    );
                    // Zones may omit the refresh token on refresh; keep the
                    // old one so the session stays refreshable.
                    if replacement.refresh_token.is_none() {
                        replacement.refresh_token = record.refresh_token.clone();
                    }
                    let access_token = replacement.access_token.clone();
                    write_json(self.storage.as_ref(), &key, &replacement).await?;
                    tracing::debug!(context_id, server_name, "access token refreshed");
                    return Ok(Some(access_token));
                }
                Err(err) => {
                    tracing::debug!(
                        context_id,
                        server_name,
                        error = %err,
                        "token refresh failed, falling back to re-authentication"
                    );
                }
            }
        }

        // Lazy discard of the expired record.
        self.storage.delete(&key).await?;
        Ok(None)
    }

    /// The pending challenge for (context, server), expiring it first if
    /// its TTL has elapsed.
    pub async fn get_auth_pending(
        &self,
        context_id: &str,
        server_name: &str,
    ) -> Result<Option<AuthChallenge>> {
        self.expire_stale_pending(context_id, server_name).await?;

        let session = self.session(context_id, server_name).await?;
        let session = session.lock().await;
        if session.status() == SessionStatus::AuthPending {
            Ok(Some(challenge_of(&session)))
        } else {
            Ok(None)
        }
    }

    /// Every pending challenge for one context.
    pub async fn get_auth_challenges(&self, context_id: &str) -> Result<Vec<AuthChallenge>> {
        let server_names: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .keys()
                .filter(|(ctx, _)| ctx == context_id)
                .map(|(_, server)| server.clone())
                .collect()
        };

        let mut challenges = Vec::new();
        for server_name in server_names {
            if let Some(challenge) = self.get_auth_pending(context_id, &server_name).await? {
                challenges.push(challenge);
            }
        }
        Ok(challenges)
    }

    /// Cancel a pending authorization: consume its records, fail the
    /// session with cause `cancelled`, and notify subscribers. Idempotent.
    pub async fn cancel_authorization(&self, context_id: &str, server_name: &str) -> Result<()> {
        let pending_key = keys::pending(context_id, server_name);
        let Some(pending) =
            take_json::<PendingAuthorization>(self.storage.as_ref(), &pending_key).await?
        else {
            return Ok(());
        };
        self.storage.take(&keys::state(&pending.state)).await?;

        let session = self.session(context_id, server_name).await?;
        let metadata = {
            let mut session = session.lock().await;
            if session.status() == SessionStatus::AuthPending {
                session.mark_failed(SessionStatus::AuthFailed, "cancelled");
            }
            session.metadata.clone()
        };

        self.events
            .dispatch(&CompletionEvent {
                context_id: context_id.to_string(),
                server_name: server_name.to_string(),
                state: pending.state,
                success: false,
                reason: Some("cancelled".to_string()),
                result: None,
                metadata,
            })
            .await;
        Ok(())
    }

    /// Process an authorization-server callback.
    ///
    /// Looks up the `state` reverse index (single use), consumes the
    /// pending record, redeems the code with the PKCE verifier, durably
    /// stores the token, transitions the session, and publishes a
    /// [`CompletionEvent`]. A replayed or unknown `state` fails with
    /// `invalid_request`.
    pub async fn complete_authorization(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<CompletionEvent> {
        let state = params
            .get("state")
            .ok_or_else(|| invalid_request("missing state parameter"))?;

        let index: StateIndex = take_json(self.storage.as_ref(), &keys::state(state))
            .await?
            .ok_or_else(|| invalid_request("unknown or already used state"))?;

        let pending_key = keys::pending(&index.context_id, &index.server_name);
        let pending: PendingAuthorization = take_json(self.storage.as_ref(), &pending_key)
            .await?
            .ok_or_else(|| invalid_request("no pending authorization"))?;

        let session = self.session(&index.context_id, &index.server_name).await?;
        let mut session_guard = session.lock().await;

        if pending.state != *state {
            session_guard.mark_failed(SessionStatus::AuthFailed, "state mismatch");
            drop(session_guard);
            return Err(invalid_request("state mismatch"));
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.pending_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        if pending.is_expired(now, ttl) {
            session_guard.mark_failed(SessionStatus::AuthFailed, "timeout");
            let event = failure_event(&index, &pending.state, "timeout", &session_guard);
            drop(session_guard);
            self.events.dispatch(&event).await;
            return Err(invalid_request("authorization expired"));
        }

        if let Some(error_code) = params.get("error") {
            let description = params.get("error_description").cloned();
            session_guard.mark_failed(
                SessionStatus::AuthFailed,
                description.clone().unwrap_or_else(|| error_code.clone()),
            );
            let event = failure_event(&index, &pending.state, error_code, &session_guard);
            drop(session_guard);
            self.events.dispatch(&event).await;
            return Err(Error::Protocol {
                code: error_code.clone(),
                description,
                uri: None,
            });
        }

        let code = params
            .get("code")
            .ok_or_else(|| invalid_request("missing code parameter"))?;

        // Callback received: exchanging the code.
        session_guard.transition(SessionStatus::Authenticating);

        let client_secret = read_json::<ClientRegistrationResponse>(
            self.storage.as_ref(),
            &keys::client(&pending.zone_url, &self.config.client_name),
        )
        .await?
        .and_then(|registered| registered.client_secret);

        let zone = self.zone_client(&pending.zone_url).await?;
        let token = match zone
            .exchange_authorization_code(
                code,
                &pending.redirect_uri,
                &pending.client_id,
                &pending.verifier,
                client_secret.as_ref(),
                Some(&pending.resource),
            )
            .await
        {
            Ok(token) => token,
            Err(err) => {
                let reason = err.oauth_code().unwrap_or("server_error").to_string();
                session_guard.mark_failed(SessionStatus::AuthFailed, err.to_string());
                let event = failure_event(&index, &pending.state, &reason, &session_guard);
                drop(session_guard);
                self.events.dispatch(&event).await;
                return Err(err);
            }
        };

        // The token is durably written before the session (and any blocked
        // caller) observes success.
        let record =
            TokenRecord::from_response(&token, &pending.zone_url, Some(pending.resource), now);
        write_json(
            self.storage.as_ref(),
            &keys::token(&index.context_id, &index.server_name),
            &record,
        )
        .await?;

        session_guard.transition(SessionStatus::Connected);
        let event = CompletionEvent {
            context_id: index.context_id.clone(),
            server_name: index.server_name.clone(),
            state: pending.state.clone(),
            success: true,
            reason: None,
            result: Some(serde_json::json!({ "expires_at": record.expires_at })),
            metadata: session_guard.metadata.clone(),
        };
        drop(session_guard);

        tracing::debug!(
            context_id = %index.context_id,
            server_name = %index.server_name,
            "authorization complete"
        );
        self.events.dispatch(&event).await;
        Ok(event)
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    /// Discovery, registration, and PKCE setup after a `401` challenge.
    /// Leaves the session in [`SessionStatus::AuthPending`].
    async fn begin_authorization(
        &self,
        session: &mut Session,
        entry: &ServerEntry,
        www_authenticate: Option<&str>,
    ) -> Result<AuthChallenge> {
        let hint = www_authenticate
            .and_then(parse_resource_metadata)
            .map(Ok)
            .unwrap_or_else(|| derive_metadata_hint(&entry.url))?;

        let document = self.fetch_resource_metadata(&hint).await?;
        let zone_url = document
            .authorization_servers
            .first()
            .cloned()
            .ok_or_else(|| Error::Protocol {
                code: "invalid_resource_metadata".to_string(),
                description: Some(format!(
                    "protected resource metadata at {hint} lists no authorization servers"
                )),
                uri: None,
            })?;

        let zone = self.zone_client(&zone_url).await?;
        let registered = self.ensure_registered_client(&zone).await?;

        let pkce = PkceChallenge::generate();
        let state = generate_state();
        let resource = resource_for(&entry.url)?;

        let request = AuthorizationRequest {
            client_id: registered.client_id.clone(),
            redirect_uri: self.redirect_uri.clone(),
            scope: self.config.registration.scope.clone(),
            state: state.clone(),
            code_challenge: pkce.challenge.clone(),
            resource: Some(resource.clone()),
        };

        let authorization_url = self.build_authorization_url(&zone, &request).await?;

        // The verifier and reverse index are stored before the user is
        // handed the URL, so the callback can always correlate.
        let pending = PendingAuthorization {
            verifier: pkce.verifier,
            state: state.clone(),
            created_at: Utc::now(),
            authorization_url: authorization_url.clone(),
            zone_url,
            client_id: registered.client_id,
            redirect_uri: self.redirect_uri.clone(),
            resource,
        };
        write_json(
            self.storage.as_ref(),
            &keys::pending(&session.context_id, &session.server_name),
            &pending,
        )
        .await?;
        write_json(
            self.storage.as_ref(),
            &keys::state(&state),
            &StateIndex {
                context_id: session.context_id.clone(),
                server_name: session.server_name.clone(),
            },
        )
        .await?;

        session.mark_auth_pending(authorization_url.clone(), state.clone());

        Ok(AuthChallenge {
            context_id: session.context_id.clone(),
            server_name: session.server_name.clone(),
            authorization_url,
            state,
        })
    }

    /// The authorization URL, routed through PAR when configured and
    /// supported, falling back to a plain redirect URL.
    async fn build_authorization_url(
        &self,
        zone: &OAuthClient,
        request: &AuthorizationRequest,
    ) -> Result<String> {
        if self.config.use_par
            && let Ok(metadata) = zone.discover_metadata().await
            && metadata.pushed_authorization_request_endpoint.is_some()
        {
            match zone.push_authorization_request(request).await {
                Ok(par) => {
                    return zone
                        .authorization_url_for_request_uri(request, &par.request_uri)
                        .await;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "PAR push failed, falling back to plain authorization URL");
                }
            }
        }
        zone.authorization_url(request).await
    }

    /// At-most-one registration per (zone, app name): the storage record is
    /// the cache, a per-key lock coalesces concurrent first-callers.
    async fn ensure_registered_client(
        &self,
        zone: &OAuthClient,
    ) -> Result<ClientRegistrationResponse> {
        let key = keys::client(zone.base_url(), &self.config.client_name);

        if let Some(existing) = read_json(self.storage.as_ref(), &key).await? {
            return Ok(existing);
        }

        let lock = {
            let mut locks = self.registration_locks.lock().await;
            locks.entry(key.clone()).or_default().clone()
        };
        let _guard = lock.lock().await;

        // Another task may have registered while we waited for the lock.
        if let Some(existing) = read_json(self.storage.as_ref(), &key).await? {
            return Ok(existing);
        }

        let registration = &self.config.registration;
        let mut request = ClientRegistrationRequest::new(&self.config.client_name)
            .redirect_uri(&self.redirect_uri)
            .token_endpoint_auth_method(&registration.token_endpoint_auth_method);
        for grant_type in &registration.grant_types {
            request = request.grant_type(grant_type);
        }
        for response_type in &registration.response_types {
            request = request.response_type(response_type);
        }
        if let Some(scope) = &registration.scope {
            request = request.scope(scope);
        }
        if let Some(jwks_url) = &registration.client_jwks_url {
            request = request.jwks_uri(jwks_url);
        }

        let response = zone.register_client(&request).await?;
        write_json(self.storage.as_ref(), &key, &response).await?;
        tracing::debug!(zone = %zone.base_url(), client_id = %response.client_id, "registered client");
        Ok(response)
    }

    /// Expire a pending authorization whose TTL has elapsed: consume its
    /// records, fail the session with cause `timeout`, notify subscribers.
    async fn expire_stale_pending(&self, context_id: &str, server_name: &str) -> Result<()> {
        let pending_key = keys::pending(context_id, server_name);
        let Some(pending) =
            read_json::<PendingAuthorization>(self.storage.as_ref(), &pending_key).await?
        else {
            return Ok(());
        };

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.pending_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        if !pending.is_expired(now, ttl) {
            return Ok(());
        }

        // Consume atomically; a racing callback may have beaten us here.
        if take_json::<PendingAuthorization>(self.storage.as_ref(), &pending_key)
            .await?
            .is_none()
        {
            return Ok(());
        }
        self.storage.take(&keys::state(&pending.state)).await?;

        let session = self.session(context_id, server_name).await?;
        let metadata = {
            let mut session = session.lock().await;
            if session.status() == SessionStatus::AuthPending {
                session.mark_failed(SessionStatus::AuthFailed, "timeout");
            }
            session.metadata.clone()
        };

        tracing::debug!(context_id, server_name, "pending authorization expired");
        self.events
            .dispatch(&CompletionEvent {
                context_id: context_id.to_string(),
                server_name: server_name.to_string(),
                state: pending.state,
                success: false,
                reason: Some("timeout".to_string()),
                result: None,
                metadata,
            })
            .await;
        Ok(())
    }

    /// Probe the MCP endpoint. 5xx and transport failures are retried with
    /// backoff; the final response (or error) is returned.
    async fn probe(&self, url: &str, bearer: Option<&str>) -> Result<ProbeResponse> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = async {
                let mut builder = self.http.get(url).timeout(self.config.http_timeout);
                if let Some(token) = bearer {
                    builder = builder.bearer_auth(token);
                }
                let response = builder.send().await?;
                let status = response.status().as_u16();
                if (500..600).contains(&status) {
                    return Err(Error::Http {
                        status,
                        body: response.text().await.unwrap_or_default().chars().take(256).collect(),
                    });
                }
                let www_authenticate = response
                    .headers()
                    .get("www-authenticate")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                Ok(ProbeResponse {
                    status,
                    www_authenticate,
                })
            }
            .await;

            match outcome {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retriable() && attempt < self.config.retry.max_attempts => {
                    let delay = self.config.retry.delay(attempt);
                    tracing::warn!(url, attempt, error = %err, "MCP probe failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fetch_resource_metadata(&self, url: &str) -> Result<ProtectedResourceMetadata> {
        let response = self
            .http
            .get(url)
            .timeout(self.config.http_timeout)
            .send()
            .await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(Error::Http {
                status,
                body: response.text().await.unwrap_or_default().chars().take(256).collect(),
            });
        }
        response.json().await.map_err(|e| Error::Http {
            status,
            body: format!("malformed protected resource metadata: {e}"),
        })
    }

    /// The OAuth client for a zone, cached per zone URL.
    async fn zone_client(&self, zone_url: &str) -> Result<Arc<OAuthClient>> {
        {
            let clients = self.zone_clients.lock().await;
            if let Some(client) = clients.get(zone_url) {
                return Ok(client.clone());
            }
        }

        let client = Arc::new(
            OAuthClient::builder(zone_url)
                .auth(AuthScheme::None)
                .config(ClientConfig {
                    timeout: self.config.http_timeout,
                    retry: self.config.retry.clone(),
                    ..ClientConfig::default()
                })
                .build()?,
        );

        let mut clients = self.zone_clients.lock().await;
        Ok(clients
            .entry(zone_url.to_string())
            .or_insert(client)
            .clone())
    }
}

fn invalid_request(description: &str) -> Error {
    Error::Protocol {
        code: "invalid_request".to_string(),
        description: Some(description.to_string()),
        uri: None,
    }
}

fn challenge_of(session: &Session) -> AuthChallenge {
    AuthChallenge {
        context_id: session.context_id.clone(),
        server_name: session.server_name.clone(),
        authorization_url: session.authorization_url().unwrap_or_default().to_string(),
        state: session.pending_state().unwrap_or_default().to_string(),
    }
}

fn failure_event(
    index: &StateIndex,
    state: &str,
    reason: &str,
    session: &Session,
) -> CompletionEvent {
    CompletionEvent {
        context_id: index.context_id.clone(),
        server_name: index.server_name.clone(),
        state: state.to_string(),
        success: false,
        reason: Some(reason.to_string()),
        result: None,
        metadata: session.metadata.clone(),
    }
}

/// The resource indicator for an MCP server URL: its origin with a trailing
/// slash.
fn resource_for(server_url: &str) -> Result<String> {
    let url = Url::parse(server_url)
        .map_err(|e| Error::config(format!("invalid server URL {server_url:?}: {e}")))?;
    Ok(format!("{}/", url.origin().ascii_serialization()))
}

/// The conventional RFC 9728 metadata location for a server URL, used when
/// the `401` challenge carries no `resource_metadata` hint.
fn derive_metadata_hint(server_url: &str) -> Result<String> {
    let url = Url::parse(server_url)
        .map_err(|e| Error::config(format!("invalid server URL {server_url:?}: {e}")))?;
    let origin = url.origin().ascii_serialization();
    let path = url.path().trim_end_matches('/');
    if path.is_empty() {
        Ok(format!("{origin}/.well-known/oauth-protected-resource"))
    } else {
        Ok(format!(
            "{origin}/.well-known/oauth-protected-resource{path}"
        ))
    }
}

/// Parse the `resource_metadata` parameter out of a `WWW-Authenticate`
/// challenge header.
fn parse_resource_metadata(www_authenticate: &str) -> Option<String> {
    let key = "resource_metadata=";
    let position = www_authenticate.find(key)?;
    let rest = &www_authenticate[position + key.len()..];

    if let Some(inner) = rest.strip_prefix('"') {
        let end = inner.find('"')?;
        Some(inner[..end].to_string())
    } else {
        let end = rest
            .find(|c: char| c.is_whitespace() || c == ',')
            .unwrap_or(rest.len());
        Some(rest[..end].to_string())
    }
}

/// Owns coordinator-bound clients keyed by context.
///
/// Each [`CoordinatorClient`] is pinned to one `context_id`; every storage
/// key it touches is prefixed with that context, so two contexts never
/// observe each other's tokens or pending records.
pub struct ClientManager {
    coordinator: Arc<AuthCoordinator>,
    clients: Mutex<HashMap<String, Arc<CoordinatorClient>>>,
}

impl ClientManager {
    /// A manager over the given coordinator.
    pub fn new(coordinator: Arc<AuthCoordinator>) -> Self {
        Self {
            coordinator,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// The client for a context, created on first use.
    pub async fn client(&self, context_id: &str) -> Arc<CoordinatorClient> {
        let mut clients = self.clients.lock().await;
        clients
            .entry(context_id.to_string())
            .or_insert_with(|| {
                Arc::new(CoordinatorClient {
                    context_id: context_id.to_string(),
                    coordinator: self.coordinator.clone(),
                })
            })
            .clone()
    }
}

/// A coordinator handle pinned to one context.
pub struct CoordinatorClient {
    context_id: String,
    coordinator: Arc<AuthCoordinator>,
}

impl CoordinatorClient {
    /// This client's context.
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Connect to a named server within this context.
    pub async fn connect(&self, server_name: &str) -> Result<ConnectOutcome> {
        self.coordinator.connect(&self.context_id, server_name).await
    }

    /// A valid access token for a named server within this context.
    pub async fn access_token(&self, server_name: &str) -> Result<Option<String>> {
        self.coordinator
            .valid_access_token(&self.context_id, server_name)
            .await
    }

    /// Pending challenges for this context only.
    pub async fn auth_challenges(&self) -> Result<Vec<AuthChallenge>> {
        self.coordinator.get_auth_challenges(&self.context_id).await
    }

    /// Session status for a named server within this context.
    pub async fn session_status(&self, server_name: &str) -> Result<SessionStatus> {
        self.coordinator
            .session_status(&self.context_id, server_name)
            .await
    }

    /// Cancel a pending authorization within this context.
    pub async fn cancel(&self, server_name: &str) -> Result<()> {
        self.coordinator
            .cancel_authorization(&self.context_id, server_name)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resource_metadata_quoted() {
        let header = r#"Bearer error="invalid_token", resource_metadata="http://srv:8000/.well-known/oauth-protected-resource/mcp""#;
        assert_eq!(
            parse_resource_metadata(header).as_deref(),
            Some("http://srv:8000/.well-known/oauth-protected-resource/mcp")
        );
    }

    #[test]
    fn test_parse_resource_metadata_unquoted() {
        let header = "Bearer resource_metadata=http://srv:8000/.well-known/oauth-protected-resource, error=invalid_token";
        assert_eq!(
            parse_resource_metadata(header).as_deref(),
            Some("http://srv:8000/.well-known/oauth-protected-resource")
        );
    }

    #[test]
    fn test_parse_resource_metadata_absent() {
        assert!(parse_resource_metadata("Bearer error=\"invalid_token\"").is_none());
    }

    #[test]
    fn test_resource_for_strips_path() {
        assert_eq!(
            resource_for("http://srv:8000/mcp").unwrap(),
            "http://srv:8000/"
        );
        assert_eq!(
            resource_for("https://mcp.example.com/").unwrap(),
            "https://mcp.example.com/"
        );
    }

    #[test]
    fn test_derive_metadata_hint() {
        assert_eq!(
            derive_metadata_hint("http://srv:8000/mcp").unwrap(),
            "http://srv:8000/.well-known/oauth-protected-resource/mcp"
        );
        assert_eq!(
            derive_metadata_hint("http://srv:8000/").unwrap(),
            "http://srv:8000/.well-known/oauth-protected-resource"
        );
    }

    #[test]
    fn test_registration_defaults_are_public_client() {
        let registration = RegistrationConfig::default();
        assert_eq!(registration.token_endpoint_auth_method, "none");
        assert!(
            registration
                .grant_types
                .contains(&"authorization_code".to_string())
        );
        assert!(
            registration
                .grant_types
                .contains(&"refresh_token".to_string())
        );
        assert_eq!(registration.response_types, vec!["code"]);
    }

    #[tokio::test]
    async fn test_unknown_server_is_config_error() {
        let coordinator = AuthCoordinator::new(
            CoordinatorConfig::new("Test Client"),
            "http://localhost:8080/oauth/callback".to_string(),
            Arc::new(MemoryStorage::new()),
        )
        .unwrap();

        let err = coordinator.connect("alice", "nope").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_new_rejects_bad_redirect_uri() {
        let result = AuthCoordinator::new(
            CoordinatorConfig::new("Test Client"),
            "not a uri".to_string(),
            Arc::new(MemoryStorage::new()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_client_manager_caches_per_context() {
        let coordinator = Arc::new(
            AuthCoordinator::new(
                CoordinatorConfig::new("Test Client"),
                "http://localhost:8080/oauth/callback".to_string(),
                Arc::new(MemoryStorage::new()),
            )
            .unwrap(),
        );
        let manager = ClientManager::new(coordinator);

        let alice = manager.client("alice").await;
        let alice_again = manager.client("alice").await;
        let bob = manager.client("bob").await;

        assert!(Arc::ptr_eq(&alice, &alice_again));
        assert!(!Arc::ptr_eq(&alice, &bob));
        assert_eq!(alice.context_id(), "alice");
        assert_eq!(bob.context_id(), "bob");
    }

    #[tokio::test]
    async fn test_callback_with_unknown_state_is_invalid_request() {
        let coordinator = AuthCoordinator::new(
            CoordinatorConfig::new("Test Client"),
            "http://localhost:8080/oauth/callback".to_string(),
            Arc::new(MemoryStorage::new()),
        )
        .unwrap();

        let mut params = HashMap::new();
        params.insert("code".to_string(), "abc".to_string());
        params.insert("state".to_string(), "never-issued".to_string());

        let err = coordinator.complete_authorization(&params).await.unwrap_err();
        assert_eq!(err.oauth_code(), Some("invalid_request"));
    }
}
