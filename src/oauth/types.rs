//! Typed OAuth 2.0 request and response records.
//!
//! Wire documents for the endpoints the client layer talks to. Response
//! types normalize the fields servers are sloppy about (`scope` as string or
//! list, `aud` as string or list) and preserve unknown fields in an `extra`
//! map so vendor extensions survive a round-trip.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::oauth::retry::RetryPolicy;
use crate::secret::SecretString;

/// Token-type and grant-type URNs from RFC 8693.
pub mod urn {
    /// `grant_type` for RFC 8693 token exchange.
    pub const GRANT_TYPE_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
    /// An OAuth 2.0 access token.
    pub const TOKEN_TYPE_ACCESS_TOKEN: &str = "urn:ietf:params:oauth:token-type:access_token";
    /// An OAuth 2.0 refresh token.
    pub const TOKEN_TYPE_REFRESH_TOKEN: &str = "urn:ietf:params:oauth:token-type:refresh_token";
    /// A JWT that is not necessarily an access token.
    pub const TOKEN_TYPE_JWT: &str = "urn:ietf:params:oauth:token-type:jwt";
}

/// Deserialize a scope field that may arrive as a space-delimited string or
/// as a JSON list.
fn scope_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ScopeField {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match Option::<ScopeField>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(ScopeField::List(list)) => list,
        Some(ScopeField::Joined(joined)) => {
            joined.split_whitespace().map(String::from).collect()
        }
    })
}

/// Audience claim value: a single string or an array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// A single audience string.
    Single(String),
    /// Multiple audience strings.
    Multiple(Vec<String>),
}

impl Audience {
    /// Check if the audience contains a specific value.
    pub fn contains(&self, value: &str) -> bool {
        match self {
            Audience::Single(s) => s == value,
            Audience::Multiple(v) => v.iter().any(|s| s == value),
        }
    }
}

/// Authorization Server Metadata per RFC 8414 Section 2.
///
/// Fetched from `/.well-known/oauth-authorization-server` and cached per
/// zone; never mutated after fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMetadata {
    /// The authorization server's issuer identifier URL.
    pub issuer: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introspection_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushed_authorization_request_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grant_types_supported: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_challenge_methods_supported: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub token_endpoint_auth_methods_supported: Vec<String>,

    /// Fields not covered above, preserved verbatim.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ServerMetadata {
    /// Whether the server advertises PKCE S256 support.
    pub fn supports_s256(&self) -> bool {
        self.code_challenge_methods_supported
            .iter()
            .any(|m| m == "S256")
    }
}

/// Token endpoint response: RFC 6749 Section 5.1 plus the RFC 8693 token
/// exchange fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The issued token (opaque to this crate).
    pub access_token: String,

    /// Token type, normally `"Bearer"`.
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Lifetime of the token in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Granted scopes, normalized from string or list form.
    #[serde(default, deserialize_with = "scope_list", skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,

    /// RFC 8693 `issued_token_type`. Only
    /// [`urn::TOKEN_TYPE_ACCESS_TOKEN`] results are usable for downstream
    /// API calls; other issued types are surfaced but not used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_token_type: Option<String>,

    /// Fields not covered above, preserved verbatim.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenResponse {
    /// Whether the issued token is usable as an access token for downstream
    /// calls. True when `issued_token_type` is absent (plain RFC 6749
    /// response) or names the access-token URN.
    pub fn is_access_token(&self) -> bool {
        match self.issued_token_type.as_deref() {
            None => true,
            Some(t) => t == urn::TOKEN_TYPE_ACCESS_TOKEN,
        }
    }

    /// Absolute expiry instant derived from `expires_in`, relative to `now`.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in
            .map(|secs| now + chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX)))
    }
}

/// Dynamic Client Registration request per RFC 7591 Section 2.
#[derive(Debug, Clone, Serialize)]
pub struct ClientRegistrationRequest {
    pub client_name: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub redirect_uris: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub grant_types: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_types: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,
}

impl ClientRegistrationRequest {
    /// Start a registration request with just a client name.
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            redirect_uris: Vec::new(),
            grant_types: Vec::new(),
            response_types: Vec::new(),
            token_endpoint_auth_method: None,
            scope: None,
            jwks_uri: None,
        }
    }

    /// Add a redirect URI.
    pub fn redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.redirect_uris.push(uri.into());
        self
    }

    /// Add a grant type the client will use.
    pub fn grant_type(mut self, grant_type: impl Into<String>) -> Self {
        self.grant_types.push(grant_type.into());
        self
    }

    /// Add a response type the client will use.
    pub fn response_type(mut self, response_type: impl Into<String>) -> Self {
        self.response_types.push(response_type.into());
        self
    }

    /// Set the token endpoint authentication method.
    pub fn token_endpoint_auth_method(mut self, method: impl Into<String>) -> Self {
        self.token_endpoint_auth_method = Some(method.into());
        self
    }

    /// Set the requested scope string.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Point the server at the client's JSON Web Key Set.
    pub fn jwks_uri(mut self, uri: impl Into<String>) -> Self {
        self.jwks_uri = Some(uri.into());
        self
    }
}

/// Dynamic Client Registration response per RFC 7591 Section 3.2.1.
///
/// Serializable so registered clients can be persisted by the coordinator.
/// The secret is wrapped in [`SecretString`] and never appears in logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegistrationResponse {
    pub client_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<SecretString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirect_uris: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grant_types: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,

    #[serde(default, deserialize_with = "scope_list", skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// Fields not covered above, preserved verbatim.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Token introspection response per RFC 7662 Section 2.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntrospectionResponse {
    /// Whether the token is currently active.
    #[serde(default)]
    pub active: bool,

    #[serde(default, deserialize_with = "scope_list", skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,

    /// Fields not covered above, preserved verbatim.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Pushed Authorization Request response per RFC 9126 Section 2.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParResponse {
    /// Opaque URI referencing the pushed request.
    pub request_uri: String,
    /// Seconds the `request_uri` stays valid.
    pub expires_in: u64,
}

/// Parameters of an authorization request, used both for building the
/// redirect URL and for pushing the request via PAR.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: Option<String>,
    pub state: String,
    pub code_challenge: String,
    pub resource: Option<String>,
}

impl AuthorizationRequest {
    /// The request as form/query parameters, in a stable order.
    pub(crate) fn params(&self) -> Vec<(&'static str, &str)> {
        let mut params = vec![
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("response_type", "code"),
            ("code_challenge", self.code_challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("state", self.state.as_str()),
        ];
        if let Some(scope) = &self.scope {
            params.push(("scope", scope));
        }
        if let Some(resource) = &self.resource {
            params.push(("resource", resource));
        }
        params
    }

    /// Build the full authorization URL against the given endpoint.
    pub fn url(&self, authorization_endpoint: &str) -> Result<String> {
        let mut url = Url::parse(authorization_endpoint).map_err(|e| {
            Error::config(format!(
                "invalid authorization endpoint {authorization_endpoint:?}: {e}"
            ))
        })?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in self.params() {
                query.append_pair(key, value);
            }
        }
        Ok(url.to_string())
    }

    /// Build a redirect URL carrying only `client_id` and a PAR
    /// `request_uri` (RFC 9126 Section 4).
    pub fn url_for_request_uri(
        &self,
        authorization_endpoint: &str,
        request_uri: &str,
    ) -> Result<String> {
        let mut url = Url::parse(authorization_endpoint).map_err(|e| {
            Error::config(format!(
                "invalid authorization endpoint {authorization_endpoint:?}: {e}"
            ))
        })?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("request_uri", request_uri);
        Ok(url.to_string())
    }
}

/// RFC 8693 token exchange request.
///
/// Built with [`TokenExchangeRequest::for_access_token`] for the common case
/// of delegating an inbound access token to a downstream resource.
#[derive(Debug, Clone)]
pub struct TokenExchangeRequest {
    pub subject_token: String,
    pub subject_token_type: String,
    pub actor_token: Option<String>,
    pub actor_token_type: Option<String>,
    pub resource: Option<String>,
    pub audience: Option<String>,
    pub scope: Option<String>,
    pub requested_token_type: Option<String>,
}

impl TokenExchangeRequest {
    /// Exchange an access token (`subject_token_type` =
    /// `urn:ietf:params:oauth:token-type:access_token`).
    pub fn for_access_token(subject_token: impl Into<String>) -> Self {
        Self {
            subject_token: subject_token.into(),
            subject_token_type: urn::TOKEN_TYPE_ACCESS_TOKEN.to_string(),
            actor_token: None,
            actor_token_type: None,
            resource: None,
            audience: None,
            scope: None,
            requested_token_type: None,
        }
    }

    /// Target resource URL (RFC 8693 `resource`).
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Target audience (RFC 8693 `audience`). When both `resource` and
    /// `audience` are set, both are sent verbatim and the authorization
    /// server chooses.
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Requested scope.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Requested token type URN.
    pub fn requested_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.requested_token_type = Some(token_type.into());
        self
    }

    /// Attach an actor token identifying the acting party.
    pub fn actor(mut self, token: impl Into<String>, token_type: impl Into<String>) -> Self {
        self.actor_token = Some(token.into());
        self.actor_token_type = Some(token_type.into());
        self
    }

    /// The request as `application/x-www-form-urlencoded` pairs.
    pub(crate) fn form(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("grant_type", urn::GRANT_TYPE_TOKEN_EXCHANGE.to_string()),
            ("subject_token", self.subject_token.clone()),
            ("subject_token_type", self.subject_token_type.clone()),
        ];
        if let Some(actor_token) = &self.actor_token {
            form.push(("actor_token", actor_token.clone()));
        }
        if let Some(actor_token_type) = &self.actor_token_type {
            form.push(("actor_token_type", actor_token_type.clone()));
        }
        if let Some(resource) = &self.resource {
            form.push(("resource", resource.clone()));
        }
        if let Some(audience) = &self.audience {
            form.push(("audience", audience.clone()));
        }
        if let Some(scope) = &self.scope {
            form.push(("scope", scope.clone()));
        }
        if let Some(requested) = &self.requested_token_type {
            form.push(("requested_token_type", requested.clone()));
        }
        form
    }
}

/// Explicit endpoint overrides. Any endpoint left `None` falls back to
/// discovery (when enabled) and then to the conventional default path.
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    pub authorize: Option<String>,
    pub token: Option<String>,
    pub register: Option<String>,
    pub introspect: Option<String>,
    pub revoke: Option<String>,
    pub par: Option<String>,
}

/// OAuth client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-request deadline.
    pub timeout: Duration,
    /// Backoff policy for retriable failures.
    pub retry: RetryPolicy,
    /// Whether to consult RFC 8414 discovery when resolving endpoints.
    pub enable_discovery: bool,
    /// How long a fetched discovery document stays fresh.
    pub discovery_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            enable_discovery: true,
            discovery_ttl: Duration::from_secs(300),
        }
    }
}
