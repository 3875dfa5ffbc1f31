//! Async OAuth 2.0 client.
//!
//! [`OAuthClient`] issues requests against one authorization server (one
//! zone). Endpoints resolve with strict precedence: explicit override, then
//! RFC 8414 discovery (when enabled), then the conventional default path
//! relative to the base URL (`/oauth2/token`, `/oauth2/register`, ...).
//!
//! Failures are classified into the crate taxonomy before the retry loop
//! sees them: transport problems and retriable HTTP statuses are retried
//! with full-jitter backoff, RFC 6749 error documents are returned
//! immediately and never resent.

use std::time::Instant;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::oauth::auth::AuthScheme;
use crate::oauth::types::{
    AuthorizationRequest, ClientConfig, ClientRegistrationRequest, ClientRegistrationResponse,
    Endpoints, IntrospectionResponse, ParResponse, ServerMetadata, TokenExchangeRequest,
    TokenResponse,
};
use crate::secret::SecretString;

/// Well-known path for RFC 8414 authorization-server metadata.
pub(crate) const DISCOVERY_PATH: &str = "/.well-known/oauth-authorization-server";

/// Where a resolved endpoint URL came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSource {
    /// Explicit override on the client.
    Configured,
    /// RFC 8414 discovery document.
    Discovered,
    /// Conventional default path relative to the base URL.
    Default,
}

/// A resolved endpoint URL and its provenance, for diagnostics.
#[derive(Debug, Clone)]
pub struct EndpointInfo {
    pub url: String,
    pub source: EndpointSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointKind {
    Authorize,
    Token,
    Register,
    Introspect,
    Revoke,
    Par,
}

impl EndpointKind {
    fn name(self) -> &'static str {
        match self {
            EndpointKind::Authorize => "authorize",
            EndpointKind::Token => "token",
            EndpointKind::Register => "register",
            EndpointKind::Introspect => "introspect",
            EndpointKind::Revoke => "revoke",
            EndpointKind::Par => "par",
        }
    }

    fn default_path(self) -> &'static str {
        match self {
            EndpointKind::Authorize => "/oauth2/authorize",
            EndpointKind::Token => "/oauth2/token",
            EndpointKind::Register => "/oauth2/register",
            EndpointKind::Introspect => "/oauth2/introspect",
            EndpointKind::Revoke => "/oauth2/revoke",
            EndpointKind::Par => "/oauth2/par",
        }
    }

    fn override_of<'a>(self, endpoints: &'a Endpoints) -> Option<&'a String> {
        match self {
            EndpointKind::Authorize => endpoints.authorize.as_ref(),
            EndpointKind::Token => endpoints.token.as_ref(),
            EndpointKind::Register => endpoints.register.as_ref(),
            EndpointKind::Introspect => endpoints.introspect.as_ref(),
            EndpointKind::Revoke => endpoints.revoke.as_ref(),
            EndpointKind::Par => endpoints.par.as_ref(),
        }
    }

    fn discovered_of(self, metadata: &ServerMetadata) -> Option<&String> {
        match self {
            EndpointKind::Authorize => metadata.authorization_endpoint.as_ref(),
            EndpointKind::Token => metadata.token_endpoint.as_ref(),
            EndpointKind::Register => metadata.registration_endpoint.as_ref(),
            EndpointKind::Introspect => metadata.introspection_endpoint.as_ref(),
            EndpointKind::Revoke => metadata.revocation_endpoint.as_ref(),
            EndpointKind::Par => metadata.pushed_authorization_request_endpoint.as_ref(),
        }
    }
}

#[derive(Debug)]
struct CachedMetadata {
    metadata: ServerMetadata,
    fetched_at: Instant,
}

/// Async OAuth 2.0 client bound to one authorization server.
///
/// # Example
///
/// ```rust,no_run
/// use mcp_delegate::oauth::{OAuthClient, AuthScheme};
///
/// # async fn example() -> mcp_delegate::Result<()> {
/// let client = OAuthClient::builder("https://acme.zones.example")
///     .auth(AuthScheme::basic("my-client", "my-secret"))
///     .build()?;
///
/// let metadata = client.discover_metadata().await?;
/// println!("issuer: {}", metadata.issuer);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct OAuthClient {
    base_url: String,
    zone_id: Option<String>,
    http: reqwest::Client,
    auth: AuthScheme,
    overrides: Endpoints,
    config: ClientConfig,
    discovered: RwLock<Option<CachedMetadata>>,
}

/// Builder for [`OAuthClient`].
pub struct OAuthClientBuilder {
    base_url: String,
    zone_id: Option<String>,
    auth: AuthScheme,
    overrides: Endpoints,
    config: ClientConfig,
    http: Option<reqwest::Client>,
}

impl OAuthClientBuilder {
    /// Set the authentication strategy. Defaults to [`AuthScheme::None`].
    pub fn auth(mut self, auth: AuthScheme) -> Self {
        self.auth = auth;
        self
    }

    /// Zone ID used to select per-zone credentials.
    pub fn zone_id(mut self, zone_id: impl Into<String>) -> Self {
        self.zone_id = Some(zone_id.into());
        self
    }

    /// Explicit endpoint overrides. Overrides win over discovery and
    /// defaults.
    pub fn endpoints(mut self, endpoints: Endpoints) -> Self {
        self.overrides = endpoints;
        self
    }

    /// Client configuration (timeouts, retries, discovery).
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a pre-built `reqwest::Client` (proxies, TLS settings, pooling).
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the base URL is empty or unparseable.
    pub fn build(self) -> Result<OAuthClient> {
        if self.base_url.is_empty() {
            return Err(Error::config("base_url is required"));
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| Error::config(format!("invalid base_url {:?}: {e}", self.base_url)))?;

        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder()
                .timeout(self.config.timeout)
                .build()
                .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?,
        };

        Ok(OAuthClient {
            base_url: self.base_url.trim_end_matches('/').to_string(),
            zone_id: self.zone_id,
            http,
            auth: self.auth,
            overrides: self.overrides,
            config: self.config,
            discovered: RwLock::new(None),
        })
    }
}

impl OAuthClient {
    /// Start building a client for the given zone base URL.
    pub fn builder(base_url: impl Into<String>) -> OAuthClientBuilder {
        OAuthClientBuilder {
            base_url: base_url.into(),
            zone_id: None,
            auth: AuthScheme::None,
            overrides: Endpoints::default(),
            config: ClientConfig::default(),
            http: None,
        }
    }

    /// The zone base URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The zone ID used for per-zone credential selection, if any.
    pub fn zone_id(&self) -> Option<&str> {
        self.zone_id.as_deref()
    }

    /// Fetch the RFC 8414 authorization-server metadata document, caching it
    /// for [`ClientConfig::discovery_ttl`].
    pub async fn discover_metadata(&self) -> Result<ServerMetadata> {
        {
            let cache = self.discovered.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < self.config.discovery_ttl
            {
                return Ok(cached.metadata.clone());
            }
        }

        let mut cache = self.discovered.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = cache.as_ref()
            && cached.fetched_at.elapsed() < self.config.discovery_ttl
        {
            return Ok(cached.metadata.clone());
        }

        let url = format!("{}{DISCOVERY_PATH}", self.base_url);
        tracing::debug!(url = %url, "fetching authorization server metadata");
        let value = self
            .execute_json("discover_metadata", || Ok(self.http.get(&url)))
            .await?;
        let metadata: ServerMetadata = parse_document("authorization server metadata", value)?;

        *cache = Some(CachedMetadata {
            metadata: metadata.clone(),
            fetched_at: Instant::now(),
        });
        Ok(metadata)
    }

    /// The zone's `jwks_uri` from discovery.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the discovery document does not advertise one.
    pub async fn jwks_uri(&self) -> Result<String> {
        let metadata = self.discover_metadata().await?;
        metadata.jwks_uri.ok_or_else(|| {
            Error::config(format!(
                "authorization server {} does not advertise a jwks_uri",
                self.base_url
            ))
        })
    }

    /// Register a client via RFC 7591 dynamic client registration.
    pub async fn register_client(
        &self,
        request: &ClientRegistrationRequest,
    ) -> Result<ClientRegistrationResponse> {
        let endpoint = self.endpoint(EndpointKind::Register).await?;
        tracing::debug!(endpoint = %endpoint, client_name = %request.client_name, "registering client");
        let value = self
            .execute_json("register_client", || {
                self.auth
                    .apply(self.http.post(&endpoint).json(request), self.zone_id())
            })
            .await?;
        parse_document("client registration response", value)
    }

    /// Perform an RFC 8693 token exchange.
    ///
    /// Protocol errors are reported as [`Error::TokenExchange`], carrying
    /// the resource or audience the exchange targeted.
    pub async fn exchange_token(&self, request: &TokenExchangeRequest) -> Result<TokenResponse> {
        let endpoint = self.endpoint(EndpointKind::Token).await?;
        let form = request.form();
        tracing::debug!(
            endpoint = %endpoint,
            resource = request.resource.as_deref().unwrap_or(""),
            "exchanging token"
        );
        let value = self
            .execute_json("exchange_token", || {
                self.auth
                    .apply(self.http.post(&endpoint).form(&form), self.zone_id())
            })
            .await
            .map_err(|err| match err {
                Error::Protocol {
                    code, description, ..
                } => Error::TokenExchange {
                    code,
                    description,
                    resource: request.resource.clone().or_else(|| request.audience.clone()),
                },
                other => other,
            })?;
        parse_document("token response", value)
    }

    /// Redeem an authorization code (RFC 6749 Section 4.1.3 with PKCE).
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        redirect_uri: &str,
        client_id: &str,
        code_verifier: &str,
        client_secret: Option<&SecretString>,
        resource: Option<&str>,
    ) -> Result<TokenResponse> {
        let endpoint = self.endpoint(EndpointKind::Token).await?;

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("client_id", client_id.to_string()),
            ("code_verifier", code_verifier.to_string()),
        ];
        if let Some(secret) = client_secret {
            form.push(("client_secret", secret.expose().to_string()));
        }
        if let Some(resource) = resource {
            form.push(("resource", resource.to_string()));
        }

        tracing::debug!(endpoint = %endpoint, client_id = %client_id, "redeeming authorization code");
        let value = self
            .execute_json("exchange_authorization_code", || {
                Ok(self.http.post(&endpoint).form(&form))
            })
            .await?;
        parse_document("token response", value)
    }

    /// Exchange a refresh token for a new access token.
    pub async fn refresh_token(
        &self,
        refresh_token: &str,
        resource: Option<&str>,
        scope: Option<&str>,
    ) -> Result<TokenResponse> {
        let endpoint = self.endpoint(EndpointKind::Token).await?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        if let Some(resource) = resource {
            form.push(("resource", resource.to_string()));
        }
        if let Some(scope) = scope {
            form.push(("scope", scope.to_string()));
        }

        tracing::debug!(endpoint = %endpoint, "refreshing token");
        let value = self
            .execute_json("refresh_token", || {
                self.auth
                    .apply(self.http.post(&endpoint).form(&form), self.zone_id())
            })
            .await?;
        parse_document("token response", value)
    }

    /// Introspect a token (RFC 7662).
    pub async fn introspect(
        &self,
        token: &str,
        token_type_hint: Option<&str>,
    ) -> Result<IntrospectionResponse> {
        let endpoint = self.endpoint(EndpointKind::Introspect).await?;

        let mut form = vec![("token", token.to_string())];
        if let Some(hint) = token_type_hint {
            form.push(("token_type_hint", hint.to_string()));
        }

        tracing::debug!(endpoint = %endpoint, "introspecting token");
        let value = self
            .execute_json("introspect", || {
                self.auth
                    .apply(self.http.post(&endpoint).form(&form), self.zone_id())
            })
            .await?;
        parse_document("introspection response", value)
    }

    /// Revoke a token (RFC 7009).
    ///
    /// Revocation is idempotent: the server answers 200 even for unknown or
    /// already-revoked tokens, and this method returns `Ok(())` for any
    /// success status.
    pub async fn revoke(&self, token: &str, token_type_hint: Option<&str>) -> Result<()> {
        let endpoint = self.endpoint(EndpointKind::Revoke).await?;

        let mut form = vec![("token", token.to_string())];
        if let Some(hint) = token_type_hint {
            form.push(("token_type_hint", hint.to_string()));
        }

        tracing::debug!(endpoint = %endpoint, "revoking token");
        self.execute_json("revoke", || {
            self.auth
                .apply(self.http.post(&endpoint).form(&form), self.zone_id())
        })
        .await?;
        Ok(())
    }

    /// Push an authorization request (RFC 9126) and obtain a `request_uri`.
    pub async fn push_authorization_request(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<ParResponse> {
        let endpoint = self.endpoint(EndpointKind::Par).await?;
        let params = request.params();

        tracing::debug!(endpoint = %endpoint, client_id = %request.client_id, "pushing authorization request");
        let value = self
            .execute_json("push_authorization_request", || {
                self.auth
                    .apply(self.http.post(&endpoint).form(&params), self.zone_id())
            })
            .await?;
        parse_document("pushed authorization response", value)
    }

    /// Build the authorization redirect URL for the given request.
    pub async fn authorization_url(&self, request: &AuthorizationRequest) -> Result<String> {
        let endpoint = self.endpoint(EndpointKind::Authorize).await?;
        request.url(&endpoint)
    }

    /// Build the redirect URL referencing a pushed authorization request
    /// (RFC 9126 Section 4).
    pub async fn authorization_url_for_request_uri(
        &self,
        request: &AuthorizationRequest,
        request_uri: &str,
    ) -> Result<String> {
        let endpoint = self.endpoint(EndpointKind::Authorize).await?;
        request.url_for_request_uri(&endpoint, request_uri)
    }

    /// Diagnostic summary of every resolved endpoint and its provenance.
    pub async fn endpoints_summary(&self) -> Vec<(&'static str, EndpointInfo)> {
        let mut summary = Vec::new();
        for kind in [
            EndpointKind::Authorize,
            EndpointKind::Token,
            EndpointKind::Register,
            EndpointKind::Introspect,
            EndpointKind::Revoke,
            EndpointKind::Par,
        ] {
            if let Ok(info) = self.endpoint_info(kind).await {
                summary.push((kind.name(), info));
            }
        }
        summary
    }

    async fn endpoint(&self, kind: EndpointKind) -> Result<String> {
        Ok(self.endpoint_info(kind).await?.url)
    }

    /// Resolve an endpoint with strict precedence: override, discovery,
    /// default path.
    async fn endpoint_info(&self, kind: EndpointKind) -> Result<EndpointInfo> {
        if let Some(url) = kind.override_of(&self.overrides) {
            return Ok(EndpointInfo {
                url: url.clone(),
                source: EndpointSource::Configured,
            });
        }

        if self.config.enable_discovery {
            match self.discover_metadata().await {
                Ok(metadata) => {
                    if let Some(url) = kind.discovered_of(&metadata) {
                        return Ok(EndpointInfo {
                            url: url.clone(),
                            source: EndpointSource::Discovered,
                        });
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        endpoint = kind.name(),
                        error = %err,
                        "metadata discovery failed, falling back to default endpoint"
                    );
                }
            }
        }

        Ok(EndpointInfo {
            url: format!("{}{}", self.base_url, kind.default_path()),
            source: EndpointSource::Default,
        })
    }

    /// Issue a request, classify the outcome, and retry retriable failures
    /// with backoff. The `build` closure is invoked fresh for each attempt;
    /// protocol-level rejections are never resent.
    async fn execute_json<F>(&self, op: &'static str, build: F) -> Result<serde_json::Value>
    where
        F: Fn() -> Result<reqwest::RequestBuilder>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(&build).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() && attempt < self.config.retry.max_attempts => {
                    let delay = self.config.retry.delay(attempt);
                    tracing::warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying OAuth request"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once<F>(&self, build: &F) -> Result<serde_json::Value>
    where
        F: Fn() -> Result<reqwest::RequestBuilder>,
    {
        let response = build()?.timeout(self.config.timeout).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        if (200..300).contains(&status) {
            if body.trim().is_empty() {
                return Ok(serde_json::Value::Null);
            }
            serde_json::from_str(&body).map_err(|e| Error::Http {
                status,
                body: format!("unparseable response body: {e}"),
            })
        } else {
            Err(classify_error_body(status, &body))
        }
    }
}

/// Parse a success body into its typed document.
fn parse_document<T: DeserializeOwned>(what: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Http {
        status: 200,
        body: format!("malformed {what}: {e}"),
    })
}

/// Classify a non-success response: RFC 6749 error documents on 4xx become
/// protocol errors; everything else stays an HTTP error (retriable for
/// transient statuses).
fn classify_error_body(status: u16, body: &str) -> Error {
    #[derive(Deserialize)]
    struct OAuthErrorBody {
        error: String,
        #[serde(default)]
        error_description: Option<String>,
        #[serde(default)]
        error_uri: Option<String>,
    }

    if (400..500).contains(&status) && status != 429 {
        if let Ok(parsed) = serde_json::from_str::<OAuthErrorBody>(body) {
            return Error::Protocol {
                code: parsed.error,
                description: parsed.error_description,
                uri: parsed.error_uri,
            };
        }
    }

    let truncated: String = body.chars().take(512).collect();
    Error::Http {
        status,
        body: truncated,
    }
}
