//! Server-side delegation provider.
//!
//! [`DelegationProvider`] wraps a protected MCP server with bearer-token
//! authentication and on-demand RFC 8693 token exchange:
//!
//! - [`DelegationProvider::authenticate`] validates an inbound bearer token
//!   and returns the caller's identity or an RFC 6750 challenge.
//! - A [`Grant`] declares that a tool needs downstream tokens for one or
//!   more resources. Before the tool body runs,
//!   [`DelegationProvider::delegate`] exchanges the inbound token for each
//!   declared resource and materializes the results into an
//!   [`AccessContext`]. Exchange failures never abort the tool: per-resource
//!   rejections and global transport failures are recorded in the context
//!   and the tool decides what to do.
//! - [`DelegationProvider::app`] composes the discovery metadata endpoints,
//!   the bearer middleware, and a caller-supplied MCP application mounted on
//!   the protected path.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mcp_delegate::provider::{DelegationProvider, Grant, ProviderConfig};
//! use mcp_delegate::oauth::AuthScheme;
//! use mcp_delegate::Zone;
//!
//! # async fn example() -> mcp_delegate::Result<()> {
//! let provider = Arc::new(DelegationProvider::new(
//!     ProviderConfig::new(
//!         Zone::from_url("https://acme.zones.example"),
//!         "My MCP Server",
//!         "http://srv:8000",
//!     )
//!     .credential(AuthScheme::basic("server-client", "server-secret")),
//! )?);
//!
//! let grant = Grant::new("https://api.github.com");
//! # let authenticated: mcp_delegate::provider::Authenticated = todo!();
//! let access = provider.delegate(&grant, &authenticated).await;
//! if !access.has_errors() {
//!     let token = &access.access("https://api.github.com").unwrap().access_token;
//!     // call the downstream API with `token`
//! }
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod middleware;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::Request;
use axum::response::IntoResponse;
use futures::StreamExt as _;
use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::metadata::{MetadataState, ProtectedResourceMetadata, resource_metadata_url, well_known_router};
use crate::oauth::{AuthScheme, ClientConfig, OAuthClient, TokenExchangeRequest};
use crate::verifier::{TokenVerifier, VerifyError};
use crate::zone::Zone;

// Re-exports
pub use access::{AccessContext, AccessError, AccessStatus, ResourceAccess};
pub use middleware::{Authenticated, BearerAuthLayer, BearerAuthService, extract_bearer_token};

/// Declares that a tool needs downstream access tokens before its body
/// runs.
///
/// Attach a `Grant` to a tool's metadata and run
/// [`DelegationProvider::delegate`] as the pre-handler stage of the tool
/// invocation pipeline.
#[derive(Debug, Clone)]
pub struct Grant {
    resources: Vec<String>,
    max_concurrency: Option<usize>,
}

impl Grant {
    /// A grant for a single downstream resource.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resources: vec![resource.into()],
            max_concurrency: None,
        }
    }

    /// A grant for several resources; exchanges run concurrently.
    pub fn multi<I, S>(resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resources: resources.into_iter().map(Into::into).collect(),
            max_concurrency: None,
        }
    }

    /// Cap the number of concurrent exchanges for this grant.
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    /// The declared resource URLs.
    pub fn resources(&self) -> &[String] {
        &self.resources
    }
}

/// Configuration for a [`DelegationProvider`].
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// The authorization-server tenant this server trusts.
    pub zone: Zone,
    /// Human-readable MCP server name, reported by `/status`.
    pub mcp_server_name: String,
    /// Scheme + host (+ port) the protected server is reachable at.
    pub mcp_base_url: String,
    /// Path the MCP application is mounted on. Default `/mcp`.
    pub mount_path: String,
    /// The provider's own client credentials, used to authenticate token
    /// exchanges.
    pub credential: AuthScheme,
    /// JWKS cache TTL. Default 15 minutes.
    pub jwks_cache_ttl: Duration,
    /// Allowed clock skew for token validation, at most 60 seconds.
    pub clock_skew: Duration,
    /// How long discovered zone metadata stays fresh.
    pub discovery_ttl: Duration,
    /// Scopes every inbound token must carry.
    pub required_scopes: Vec<String>,
    /// Zone JWKS URL override; discovered from zone metadata when unset.
    pub jwks_uri: Option<String>,
    /// Default cap on concurrent exchanges for multi-resource grants.
    pub exchange_concurrency: usize,
}

impl ProviderConfig {
    /// Configuration with defaults for everything but the identifying
    /// fields.
    pub fn new(
        zone: Zone,
        mcp_server_name: impl Into<String>,
        mcp_base_url: impl Into<String>,
    ) -> Self {
        Self {
            zone,
            mcp_server_name: mcp_server_name.into(),
            mcp_base_url: mcp_base_url.into(),
            mount_path: "/mcp".to_string(),
            credential: AuthScheme::None,
            jwks_cache_ttl: Duration::from_secs(15 * 60),
            clock_skew: Duration::from_secs(60),
            discovery_ttl: Duration::from_secs(300),
            required_scopes: Vec::new(),
            jwks_uri: None,
            exchange_concurrency: 8,
        }
    }

    /// Set the provider's exchange credentials.
    pub fn credential(mut self, credential: AuthScheme) -> Self {
        self.credential = credential;
        self
    }

    /// Set the protected mount path.
    pub fn mount_path(mut self, path: impl Into<String>) -> Self {
        self.mount_path = path.into();
        self
    }

    /// Override the zone's JWKS URL.
    pub fn jwks_uri(mut self, uri: impl Into<String>) -> Self {
        self.jwks_uri = Some(uri.into());
        self
    }

    /// Require a scope on every inbound token.
    pub fn required_scope(mut self, scope: impl Into<String>) -> Self {
        self.required_scopes.push(scope.into());
        self
    }

    /// Set the allowed clock skew (clamped to 60 seconds).
    pub fn clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }
}

/// Wraps a protected MCP server with bearer auth and per-tool token
/// exchange.
pub struct DelegationProvider {
    config: ProviderConfig,
    zone_url: String,
    oauth: Arc<OAuthClient>,
    verifier: OnceCell<Arc<TokenVerifier>>,
}

impl DelegationProvider {
    /// Create a provider.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the zone or base URL is invalid. No network
    /// I/O happens here; the zone's JWKS location is resolved lazily on the
    /// first `authenticate` call unless [`ProviderConfig::jwks_uri`] is set.
    pub fn new(config: ProviderConfig) -> Result<Self> {
        if config.mcp_base_url.is_empty() {
            return Err(Error::config("mcp_base_url is required"));
        }
        if !config.mount_path.starts_with('/') {
            return Err(Error::config(format!(
                "mount_path must start with '/', got {:?}",
                config.mount_path
            )));
        }

        let zone_url = config.zone.url()?;
        let mut builder = OAuthClient::builder(&zone_url)
            .auth(config.credential.clone())
            .config(ClientConfig {
                discovery_ttl: config.discovery_ttl,
                ..ClientConfig::default()
            });
        // Per-zone credentials are selected by the zone ID.
        if let Some(zone_id) = config.zone.id() {
            builder = builder.zone_id(zone_id);
        }
        let oauth = Arc::new(builder.build()?);

        Ok(Self {
            config,
            zone_url,
            oauth,
            verifier: OnceCell::new(),
        })
    }

    /// The resolved zone URL.
    pub fn zone_url(&self) -> &str {
        &self.zone_url
    }

    /// The resource URL inbound tokens must be addressed to: the base URL
    /// with a trailing slash.
    pub fn resource_url(&self) -> String {
        format!("{}/", self.config.mcp_base_url.trim_end_matches('/'))
    }

    /// Absolute URL of the protected path's RFC 9728 metadata document,
    /// used as the `resource_metadata` challenge hint.
    pub fn resource_metadata_url(&self) -> String {
        resource_metadata_url(&self.config.mcp_base_url, &self.config.mount_path)
    }

    /// The provider's OAuth client (exchange, discovery).
    pub fn oauth(&self) -> &Arc<OAuthClient> {
        &self.oauth
    }

    /// The token verifier, building it on first use.
    ///
    /// Resolution of the zone's `jwks_uri` goes through discovery unless an
    /// override is configured, so the first call may perform network I/O.
    pub async fn verifier(&self) -> Result<Arc<TokenVerifier>> {
        self.verifier
            .get_or_try_init(|| async {
                let jwks_uri = match &self.config.jwks_uri {
                    Some(uri) => uri.clone(),
                    None => self.oauth.jwks_uri().await?,
                };

                let mut builder = TokenVerifier::builder(&self.zone_url, self.resource_url())
                    .jwks_uri(jwks_uri)
                    .clock_skew(self.config.clock_skew)
                    .cache_ttl(self.config.jwks_cache_ttl);
                for scope in &self.config.required_scopes {
                    builder = builder.required_scope(scope);
                }
                builder.build().map(Arc::new)
            })
            .await
            .cloned()
    }

    /// Validate the `Authorization` header of an inbound request.
    ///
    /// Returns the verified claims together with the raw token (the future
    /// `subject_token`), or the [`VerifyError`] to convert into an RFC 6750
    /// challenge.
    pub async fn authenticate(
        &self,
        authorization: Option<&str>,
    ) -> std::result::Result<Authenticated, VerifyError> {
        let token = authorization
            .and_then(extract_bearer_token)
            .ok_or(VerifyError::MissingToken)?;

        let verifier = self.verifier().await.map_err(|err| {
            tracing::error!(error = %err, "token verifier unavailable");
            VerifyError::InvalidToken {
                description: "token verifier unavailable".to_string(),
            }
        })?;

        let claims = verifier.verify(token).await?;
        Ok(Authenticated {
            claims,
            token: token.into(),
        })
    }

    /// Run the delegation stage for a grant: exchange the inbound token for
    /// every declared resource, concurrently, and materialize the outcomes.
    ///
    /// This never fails: rejections land in the per-resource slots,
    /// terminal transport or configuration failures land in the global
    /// error slot. The returned context is complete when this returns, so
    /// the tool body observes every declared resource as either granted or
    /// denied.
    pub async fn delegate(&self, grant: &Grant, authenticated: &Authenticated) -> AccessContext {
        let mut context = AccessContext::new();
        if grant.resources.is_empty() {
            return context;
        }

        let limit = grant
            .max_concurrency
            .unwrap_or(self.config.exchange_concurrency)
            .clamp(1, grant.resources.len());

        let subject_token = authenticated.token.expose();
        let outcomes: Vec<(String, Result<crate::oauth::TokenResponse>)> =
            futures::stream::iter(grant.resources.iter().map(|resource| {
                let request =
                    TokenExchangeRequest::for_access_token(subject_token).resource(resource);
                async move {
                    let outcome = self.oauth.exchange_token(&request).await;
                    (resource.clone(), outcome)
                }
            }))
            .buffer_unordered(limit)
            .collect()
            .await;

        for (resource, outcome) in outcomes {
            match outcome {
                Ok(token) => {
                    if !token.is_access_token() {
                        tracing::debug!(
                            resource = %resource,
                            issued_token_type = token.issued_token_type.as_deref().unwrap_or(""),
                            "exchange issued a non-access token"
                        );
                    }
                    context.insert_token(resource, token);
                }
                Err(err @ (Error::Protocol { .. } | Error::TokenExchange { .. })) => {
                    let code = err.oauth_code().unwrap_or("exchange_failed").to_string();
                    tracing::debug!(resource = %resource, error = %err, "token exchange rejected");
                    context.insert_error(resource, AccessError::new(code, err.to_string()));
                }
                Err(err @ Error::Config(_)) => {
                    tracing::error!(error = %err, "exchange client misconfigured");
                    context.set_global_error(AccessError::new(
                        "server_configuration",
                        err.to_string(),
                    ));
                }
                Err(err) => {
                    // Transport failures arrive here only after the retry
                    // budget is exhausted.
                    tracing::warn!(resource = %resource, error = %err, "token exchange unavailable");
                    context.set_global_error(AccessError::new(
                        "exchange_unavailable",
                        err.to_string(),
                    ));
                }
            }
        }

        context
    }

    /// Run the delegation stage, then the tool body, handing it the fully
    /// materialized [`AccessContext`].
    pub async fn with_grant<F, Fut, T>(
        &self,
        grant: &Grant,
        authenticated: &Authenticated,
        handler: F,
    ) -> T
    where
        F: FnOnce(AccessContext) -> Fut,
        Fut: Future<Output = T>,
    {
        let context = self.delegate(grant, authenticated).await;
        handler(context).await
    }

    /// Compose the full HTTP application: well-known metadata endpoints,
    /// `/status`, and the MCP application mounted on the protected path
    /// behind bearer authentication.
    pub fn app<S>(self: &Arc<Self>, mcp: S) -> Router
    where
        S: tower_service::Service<Request<Body>, Error = std::convert::Infallible>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: IntoResponse,
        S::Future: Send + 'static,
    {
        let state = Arc::new(MetadataState {
            resource_base: self.config.mcp_base_url.trim_end_matches('/').to_string(),
            document: ProtectedResourceMetadata::new(self.resource_url())
                .authorization_server(self.zone_url.clone()),
            oauth: self.oauth.clone(),
            service: self.config.mcp_server_name.clone(),
            identity: self.zone_url.clone(),
        });

        Router::new()
            .merge(well_known_router(state))
            .nest_service(&self.config.mount_path, mcp)
            .layer(BearerAuthLayer::new(self.clone()))
    }
}
