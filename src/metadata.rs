//! Discovery metadata endpoints.
//!
//! Serves the two well-known documents a protected MCP server must expose:
//!
//! - `/.well-known/oauth-protected-resource[/<path>]` -- Protected Resource
//!   Metadata per RFC 9728 Section 3. When multiple protected paths share a
//!   host, each path gets its own document per Section 3.3.
//! - `/.well-known/oauth-authorization-server` -- a mirror of the upstream
//!   zone's RFC 8414 document, fetched (and cached) through the OAuth
//!   client.
//!
//! Plus a `/status` health endpoint reporting the service name and zone
//! identity.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde::{Deserialize, Serialize};

use crate::oauth::OAuthClient;

/// Protected Resource Metadata per RFC 9728 Section 3.
///
/// # Example
///
/// ```rust
/// use mcp_delegate::ProtectedResourceMetadata;
///
/// let metadata = ProtectedResourceMetadata::new("http://srv:8000/mcp")
///     .authorization_server("https://acme.zones.example")
///     .scope("mcp:read");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// The protected resource's identifier URL.
    pub resource: String,

    /// Authorization servers that can issue tokens for this resource.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorization_servers: Vec<String>,

    /// URL of the resource's JSON Web Key Set, when it publishes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// OAuth scopes supported by this resource.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,

    /// Methods supported for sending bearer tokens. `["header"]` per
    /// RFC 6750.
    #[serde(default = "default_bearer_methods")]
    pub bearer_methods_supported: Vec<String>,
}

fn default_bearer_methods() -> Vec<String> {
    vec!["header".to_string()]
}

impl ProtectedResourceMetadata {
    /// Create metadata for the given resource identifier URL.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            authorization_servers: Vec::new(),
            jwks_uri: None,
            scopes_supported: Vec::new(),
            bearer_methods_supported: default_bearer_methods(),
        }
    }

    /// Add an authorization server issuer URL.
    pub fn authorization_server(mut self, issuer_url: impl Into<String>) -> Self {
        self.authorization_servers.push(issuer_url.into());
        self
    }

    /// Set the resource's JWKS URL.
    pub fn jwks_uri(mut self, uri: impl Into<String>) -> Self {
        self.jwks_uri = Some(uri.into());
        self
    }

    /// Add a supported scope.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes_supported.push(scope.into());
        self
    }

    /// Rebind the document to a specific resource URL, keeping everything
    /// else. Used to emit per-path documents per RFC 9728 Section 3.3.
    pub fn for_resource(&self, resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..self.clone()
        }
    }

    /// The well-known path prefix for protected-resource metadata.
    pub fn well_known_path() -> &'static str {
        "/.well-known/oauth-protected-resource"
    }
}

/// Absolute URL of the protected-resource metadata document for a protected
/// path, suitable for the `resource_metadata` challenge parameter.
pub fn resource_metadata_url(resource_base: &str, protected_path: &str) -> String {
    let base = resource_base.trim_end_matches('/');
    let path = protected_path.trim_end_matches('/');
    if path.is_empty() {
        format!("{base}{}", ProtectedResourceMetadata::well_known_path())
    } else {
        format!(
            "{base}{}{path}",
            ProtectedResourceMetadata::well_known_path()
        )
    }
}

/// `GET /status` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Always `"healthy"` when the process is serving.
    pub status: String,
    /// Configured MCP server name.
    pub service: String,
    /// The zone URL this server authenticates against.
    pub identity: String,
    /// Crate version.
    pub version: String,
}

/// Shared state behind the well-known routes.
pub(crate) struct MetadataState {
    /// Scheme + host of the protected server, no trailing slash.
    pub resource_base: String,
    /// Template document; per-path documents rebind `resource`.
    pub document: ProtectedResourceMetadata,
    /// OAuth client used to mirror the zone's RFC 8414 document.
    pub oauth: Arc<OAuthClient>,
    /// Service name for `/status`.
    pub service: String,
    /// Zone URL for `/status`.
    pub identity: String,
}

/// Build the router serving the well-known documents and `/status`.
pub(crate) fn well_known_router(state: Arc<MetadataState>) -> Router {
    Router::new()
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource_root),
        )
        .route(
            "/.well-known/oauth-protected-resource/{*path}",
            get(protected_resource_for_path),
        )
        .route(
            "/.well-known/oauth-authorization-server",
            get(authorization_server_mirror),
        )
        .route("/status", get(status))
        .with_state(state)
}

async fn protected_resource_root(State(state): State<Arc<MetadataState>>) -> Response {
    let doc = state
        .document
        .for_resource(format!("{}/", state.resource_base));
    Json(doc).into_response()
}

async fn protected_resource_for_path(
    State(state): State<Arc<MetadataState>>,
    Path(path): Path<String>,
) -> Response {
    let doc = state
        .document
        .for_resource(format!("{}/{}", state.resource_base, path));
    Json(doc).into_response()
}

async fn authorization_server_mirror(State(state): State<Arc<MetadataState>>) -> Response {
    match state.oauth.discover_metadata().await {
        Ok(metadata) => Json(metadata).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to mirror authorization server metadata");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({
                    "error": "metadata_unavailable",
                    "error_description": err.to_string(),
                })),
            )
                .into_response()
        }
    }
}

async fn status(State(state): State<Arc<MetadataState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "healthy".to_string(),
        service: state.service.clone(),
        identity: state.identity.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
