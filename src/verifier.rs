//! Bearer token verification.
//!
//! [`TokenVerifier`] validates inbound JWT bearer tokens for one protected
//! resource: signature via the zone's JWKS, `iss` against the configured
//! issuer, `aud` against the resource URL (exact match), and `exp`/`nbf`
//! with a bounded clock skew. Verification failures map to RFC 6750
//! challenges via [`VerifyError::www_authenticate`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::jwks::JwksCache;
use crate::oauth::types::Audience;

/// Upper bound on the configurable clock skew.
const MAX_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Why a presented bearer token was rejected.
///
/// Each variant maps to an HTTP status and `WWW-Authenticate` value per
/// RFC 6750 Section 3.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VerifyError {
    /// No bearer token was provided.
    #[error("missing bearer token")]
    MissingToken,

    /// The token is malformed, has a bad signature, an unknown key, or a
    /// wrong issuer.
    #[error("invalid token: {description}")]
    InvalidToken {
        /// Human-readable reason, included in the challenge.
        description: String,
    },

    /// The token's audience does not cover this resource.
    #[error("token audience does not match this resource")]
    InvalidAudience,

    /// The token expired more than the allowed clock skew ago.
    #[error("token has expired")]
    ExpiredToken,

    /// The token lacks a required scope.
    #[error("insufficient scope: required [{}]", .required.join(", "))]
    InsufficientScope {
        /// Scopes the resource requires.
        required: Vec<String>,
        /// Scopes present in the token.
        provided: Vec<String>,
    },
}

impl VerifyError {
    /// The HTTP status for this rejection: 403 for insufficient scope,
    /// 401 otherwise.
    pub fn status_code(&self) -> u16 {
        match self {
            VerifyError::InsufficientScope { .. } => 403,
            _ => 401,
        }
    }

    /// Build the `WWW-Authenticate` header value.
    ///
    /// A missing token carries no error code per RFC 6750 Section 3.1; all
    /// other rejections carry `error="invalid_token"` (or
    /// `insufficient_scope`). When `resource_metadata_url` is given it is
    /// appended per RFC 9728 Section 5.1 so clients can discover the
    /// authorization server.
    pub fn www_authenticate(&self, resource_metadata_url: Option<&str>) -> String {
        let mut parts: Vec<String> = Vec::new();

        match self {
            VerifyError::MissingToken => {}
            VerifyError::InvalidToken { description } => {
                parts.push("error=\"invalid_token\"".to_string());
                parts.push(format!(
                    "error_description=\"{}\"",
                    description.replace('"', "'")
                ));
            }
            VerifyError::InvalidAudience => {
                parts.push("error=\"invalid_token\"".to_string());
                parts.push(
                    "error_description=\"The token audience does not match this resource\""
                        .to_string(),
                );
            }
            VerifyError::ExpiredToken => {
                parts.push("error=\"invalid_token\"".to_string());
                parts.push("error_description=\"The access token has expired\"".to_string());
            }
            VerifyError::InsufficientScope { required, .. } => {
                parts.push("error=\"insufficient_scope\"".to_string());
                if !required.is_empty() {
                    parts.push(format!("scope=\"{}\"", required.join(" ")));
                }
            }
        }

        if let Some(url) = resource_metadata_url {
            parts.push(format!("resource_metadata=\"{url}\""));
        }

        if parts.is_empty() {
            "Bearer".to_string()
        } else {
            format!("Bearer {}", parts.join(", "))
        }
    }
}

/// Claims extracted from a successfully verified token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedClaims {
    /// Subject (end-user or client identifier).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Issuer URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Audience(s) the token was issued for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,

    /// Expiration time (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,

    /// Not-before time (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,

    /// Issued-at time (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,

    /// Space-delimited scope string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// OAuth client ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Ordered list of service identities that handled the request,
    /// preserved verbatim across token exchanges. The upstream zone defines
    /// its wire format; this crate does not interpret it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation_chain: Option<serde_json::Value>,

    /// Claims not covered by the standard fields.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl VerifiedClaims {
    /// The scope string split into individual scopes.
    pub fn scopes(&self) -> HashSet<String> {
        self.scope
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
            .map(String::from)
            .collect()
    }

    /// Whether the token carries a specific scope.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes().contains(scope)
    }
}

/// Validates inbound bearer tokens for one protected resource.
///
/// # Example
///
/// ```rust,no_run
/// use mcp_delegate::TokenVerifier;
///
/// # fn example() -> mcp_delegate::Result<()> {
/// let verifier = TokenVerifier::builder(
///     "https://acme.zones.example",
///     "http://srv:8000/",
/// )
/// .jwks_uri("https://acme.zones.example/.well-known/jwks.json")
/// .build()?;
/// # Ok(())
/// # }
/// ```
pub struct TokenVerifier {
    issuer: String,
    resource: String,
    jwks_uri: String,
    jwks: JwksCache,
    clock_skew: Duration,
    required_scopes: Vec<String>,
}

/// Builder for [`TokenVerifier`].
pub struct TokenVerifierBuilder {
    issuer: String,
    resource: String,
    jwks_uri: Option<String>,
    clock_skew: Duration,
    cache_ttl: Duration,
    required_scopes: Vec<String>,
    http: Option<reqwest::Client>,
}

impl TokenVerifierBuilder {
    /// URL of the zone's JSON Web Key Set. Required.
    pub fn jwks_uri(mut self, uri: impl Into<String>) -> Self {
        self.jwks_uri = Some(uri.into());
        self
    }

    /// Allowed clock skew for `exp`/`nbf`, clamped to 60 seconds.
    pub fn clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew.min(MAX_CLOCK_SKEW);
        self
    }

    /// JWKS cache TTL. Defaults to 15 minutes.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Require a scope on every verified token.
    pub fn required_scope(mut self, scope: impl Into<String>) -> Self {
        self.required_scopes.push(scope.into());
        self
    }

    /// Use a pre-built `reqwest::Client` for JWKS fetching.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Build the verifier.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Config`] when no `jwks_uri` was provided.
    pub fn build(self) -> crate::Result<TokenVerifier> {
        let jwks_uri = self
            .jwks_uri
            .ok_or_else(|| crate::Error::Config("jwks_uri is required".to_string()))?;

        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| crate::Error::Config(format!("failed to build HTTP client: {e}")))?,
        };

        Ok(TokenVerifier {
            issuer: self.issuer,
            resource: self.resource,
            jwks_uri,
            jwks: JwksCache::new(http, self.cache_ttl),
            clock_skew: self.clock_skew,
            required_scopes: self.required_scopes,
        })
    }
}

impl TokenVerifier {
    /// Start building a verifier for tokens issued by `issuer` and addressed
    /// to `resource`.
    pub fn builder(
        issuer: impl Into<String>,
        resource: impl Into<String>,
    ) -> TokenVerifierBuilder {
        TokenVerifierBuilder {
            issuer: issuer.into(),
            resource: resource.into(),
            jwks_uri: None,
            clock_skew: MAX_CLOCK_SKEW,
            cache_ttl: JwksCache::DEFAULT_TTL,
            required_scopes: Vec::new(),
            http: None,
        }
    }

    /// The resource URL tokens must be addressed to.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The expected issuer.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Verify a bearer token and return its claims.
    ///
    /// Validation order: parse the header, find the key by `kid` (fetching
    /// the JWKS on a miss, with one forced refresh for unknown `kid`),
    /// verify the signature per the key's algorithm, then check `iss`,
    /// `aud` (exact match against the resource URL), and `exp`/`nbf` with
    /// the configured skew.
    pub async fn verify(&self, token: &str) -> Result<VerifiedClaims, VerifyError> {
        let header =
            jsonwebtoken::decode_header(token).map_err(|e| VerifyError::InvalidToken {
                description: format!("failed to decode token header: {e}"),
            })?;

        let key = self
            .jwks
            .decoding_key(&self.jwks_uri, header.kid.as_deref())
            .await
            .map_err(|e| VerifyError::InvalidToken {
                description: e.to_string(),
            })?;

        let mut validation = jsonwebtoken::Validation::new(key.algorithm);
        validation.leeway = self.clock_skew.as_secs();
        validation.validate_nbf = true;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.resource]);

        let data = jsonwebtoken::decode::<VerifiedClaims>(token, &key.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => VerifyError::ExpiredToken,
                jsonwebtoken::errors::ErrorKind::InvalidAudience => VerifyError::InvalidAudience,
                jsonwebtoken::errors::ErrorKind::InvalidIssuer => VerifyError::InvalidToken {
                    description: "token issuer does not match this zone".to_string(),
                },
                jsonwebtoken::errors::ErrorKind::ImmatureSignature => VerifyError::InvalidToken {
                    description: "token is not yet valid".to_string(),
                },
                _ => VerifyError::InvalidToken {
                    description: e.to_string(),
                },
            })?;

        let claims = data.claims;

        if !self.required_scopes.is_empty() {
            let scopes = claims.scopes();
            if !self.required_scopes.iter().all(|s| scopes.contains(s)) {
                return Err(VerifyError::InsufficientScope {
                    required: self.required_scopes.clone(),
                    provided: scopes.into_iter().collect(),
                });
            }
        }

        Ok(claims)
    }
}
