//! Bearer-token middleware for protected MCP paths.
//!
//! [`BearerAuthLayer`] wraps a service with RFC 6750 bearer authentication.
//! For each request it extracts the `Authorization: Bearer` token, verifies
//! it through the provider, and either injects [`Authenticated`] into the
//! request extensions or answers `401`/`403` with a `WWW-Authenticate`
//! challenge that carries the `resource_metadata` discovery hint (RFC 9728
//! Section 5.1).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tower::Layer;

use crate::provider::DelegationProvider;
use crate::secret::SecretString;
use crate::verifier::{VerifiedClaims, VerifyError};

/// The verified identity of an inbound request, injected into request
/// extensions by [`BearerAuthService`].
///
/// Carries the claims and the raw token so delegated handlers can use the
/// inbound token as the `subject_token` of a downstream exchange. The raw
/// token is wrapped in [`SecretString`] and never appears in logs.
#[derive(Debug, Clone)]
pub struct Authenticated {
    /// Verified claims from the bearer token.
    pub claims: VerifiedClaims,
    /// The raw bearer token, for use as an exchange `subject_token`.
    pub token: SecretString,
}

/// Extract a bearer token from an `Authorization` header value.
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header.trim().strip_prefix("Bearer ").map(|t| t.trim())
}

/// Tower layer applying bearer authentication via a
/// [`DelegationProvider`].
#[derive(Clone)]
pub struct BearerAuthLayer {
    provider: Arc<DelegationProvider>,
    public_paths: Vec<String>,
}

impl BearerAuthLayer {
    /// Create a layer that authenticates every request through `provider`.
    ///
    /// The well-known metadata paths and `/status` are always public.
    pub fn new(provider: Arc<DelegationProvider>) -> Self {
        Self {
            provider,
            public_paths: vec!["/status".to_string()],
        }
    }

    /// Add a path prefix that does not require authentication.
    pub fn public_path(mut self, path: impl Into<String>) -> Self {
        self.public_paths.push(path.into());
        self
    }
}

impl<S> Layer<S> for BearerAuthLayer {
    type Service = BearerAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BearerAuthService {
            inner,
            provider: self.provider.clone(),
            public_paths: self.public_paths.clone(),
        }
    }
}

/// Tower service created by [`BearerAuthLayer`].
#[derive(Clone)]
pub struct BearerAuthService<S> {
    inner: S,
    provider: Arc<DelegationProvider>,
    public_paths: Vec<String>,
}

impl<S> tower_service::Service<Request<Body>> for BearerAuthService<S>
where
    S: tower_service::Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<crate::BoxError> + Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let path = req.uri().path().to_string();
        let provider = self.provider.clone();
        let public_paths = self.public_paths.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            // Discovery documents and health stay reachable without a token.
            if path.contains("/.well-known/")
                || public_paths.iter().any(|p| path.starts_with(p.as_str()))
            {
                return inner.call(req).await;
            }

            let authorization = req
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());

            match provider.authenticate(authorization.as_deref()).await {
                Ok(authenticated) => {
                    let mut req = req;
                    req.extensions_mut().insert(authenticated);
                    inner.call(req).await
                }
                Err(error) => Ok(challenge_response(
                    &error,
                    &provider.resource_metadata_url(),
                )),
            }
        })
    }
}

/// Build the HTTP challenge response for a rejected request.
pub(crate) fn challenge_response(error: &VerifyError, resource_metadata_url: &str) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::UNAUTHORIZED);
    let www_authenticate = error.www_authenticate(Some(resource_metadata_url));

    let body = match error {
        VerifyError::MissingToken => serde_json::json!({
            "error_description": "authentication required",
        }),
        VerifyError::InsufficientScope { required, .. } => serde_json::json!({
            "error": "insufficient_scope",
            "error_description": format!("required scopes: {}", required.join(" ")),
        }),
        other => serde_json::json!({
            "error": "invalid_token",
            "error_description": other.to_string(),
        }),
    };

    let mut response = (status, axum::Json(body)).into_response();
    response.headers_mut().insert(
        "WWW-Authenticate",
        www_authenticate
            .parse()
            .unwrap_or_else(|_| "Bearer".parse().expect("static header value")),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(extract_bearer_token("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer_token(" Bearer  abc123 "), Some("abc123"));
        // Case sensitive per RFC 6750 syntax used by the upstream zones.
        assert_eq!(extract_bearer_token("bearer abc123"), None);
        assert_eq!(extract_bearer_token("Basic dXNlcjpwdw=="), None);
        assert_eq!(extract_bearer_token("abc123"), None);
    }

    #[test]
    fn test_challenge_response_missing_token() {
        let response = challenge_response(
            &VerifyError::MissingToken,
            "http://srv:8000/.well-known/oauth-protected-resource/mcp",
        );
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let www = response
            .headers()
            .get("WWW-Authenticate")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(www.contains("resource_metadata="));
        assert!(!www.contains("error="));
    }

    #[test]
    fn test_challenge_response_invalid_token() {
        let response = challenge_response(
            &VerifyError::ExpiredToken,
            "http://srv:8000/.well-known/oauth-protected-resource/mcp",
        );
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let www = response
            .headers()
            .get("WWW-Authenticate")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(www.contains("error=\"invalid_token\""));
        assert!(www.contains("resource_metadata=\"http://srv:8000/.well-known/oauth-protected-resource/mcp\""));
    }

    #[test]
    fn test_challenge_response_insufficient_scope_is_403() {
        let response = challenge_response(
            &VerifyError::InsufficientScope {
                required: vec!["mcp:write".to_string()],
                provided: vec![],
            },
            "http://srv:8000/.well-known/oauth-protected-resource/mcp",
        );
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
