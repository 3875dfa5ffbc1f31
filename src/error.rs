//! Error types for mcp-delegate
//!
//! The error taxonomy mirrors the OAuth 2.0 failure surface:
//!
//! | Variant | Meaning | Retriable |
//! |---------|---------|-----------|
//! | `Config` | Missing or contradictory configuration, detected before I/O | no |
//! | `Network` | DNS, TLS, socket, or read/write failure | yes |
//! | `Http` | Non-OAuth 4xx/5xx response | 408, 425, 429, 5xx only |
//! | `Protocol` | RFC 6749 error response body | no |
//! | `TokenExchange` | RFC 8693 error from the token endpoint | no |
//! | `Authentication` | A presented bearer token was rejected | no |
//! | `Storage` | The storage backend failed | no |
//!
//! Retriability drives the backoff loop in [`crate::oauth::OAuthClient`]:
//! only [`Error::is_retriable`] errors are retried, and request bodies are
//! never resent after a protocol-level rejection.

use crate::verifier::VerifyError;

/// Type-erased error type used at middleware boundaries.
///
/// This is the standard error type in the tower ecosystem, used by
/// [`tower`](https://docs.rs/tower) and other tower-compatible crates.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// HTTP status codes below 500 that indicate a transient condition.
const RETRIABLE_STATUSES: [u16; 3] = [408, 425, 429];

/// mcp-delegate error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing required configuration, unresolvable endpoint, or an auth
    /// strategy that cannot serve the requested zone. Raised before any
    /// network I/O.
    #[error("configuration error: {0}")]
    Config(String),

    /// DNS, TLS, socket, or read/write failure while talking to an OAuth
    /// endpoint or an MCP server.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-success status and a body that is not
    /// an RFC 6749 error document.
    #[error("HTTP error {status}: {body}")]
    Http {
        /// Response status code.
        status: u16,
        /// Response body, truncated for display.
        body: String,
    },

    /// An RFC 6749 Section 5.2 error response (`error`, `error_description`,
    /// `error_uri`).
    #[error("OAuth error \"{code}\"{}", .description.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    Protocol {
        /// The `error` code, e.g. `invalid_grant` or `invalid_client_metadata`.
        code: String,
        /// Optional human-readable `error_description`.
        description: Option<String>,
        /// Optional `error_uri` pointing at documentation.
        uri: Option<String>,
    },

    /// An RFC 6749 error from the token endpoint during an RFC 8693 token
    /// exchange. Carries the resource the exchange was targeting so callers
    /// can attribute the failure.
    #[error("token exchange for {resource:?} failed with \"{code}\"{}", .description.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    TokenExchange {
        /// The `error` code, e.g. `invalid_grant` or `invalid_target`.
        code: String,
        /// Optional human-readable `error_description`.
        description: Option<String>,
        /// The `resource`/`audience` value the exchange targeted.
        resource: Option<String>,
    },

    /// The token verifier rejected a presented bearer token. Surfaces as an
    /// RFC 6750 challenge on the protected endpoint.
    #[error("authentication failed: {0}")]
    Authentication(#[from] VerifyError),

    /// The storage backend failed a read or write.
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether the operation that produced this error may be retried.
    ///
    /// Transport failures are always retriable. HTTP errors are retriable
    /// only for 408, 425, 429, and 5xx. Protocol-level rejections are final:
    /// the authorization server understood the request and said no.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Http { status, .. } => {
                RETRIABLE_STATUSES.contains(status) || (500..=599).contains(status)
            }
            _ => false,
        }
    }

    /// The OAuth error code carried by this error, when there is one.
    pub fn oauth_code(&self) -> Option<&str> {
        match self {
            Error::Protocol { code, .. } | Error::TokenExchange { code, .. } => Some(code),
            _ => None,
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // Status-bearing errors are produced by our own response handling;
        // anything reqwest surfaces directly is a transport problem.
        Error::Network(err.to_string())
    }
}

/// Result type alias for mcp-delegate
pub type Result<T> = std::result::Result<T, Error>;
