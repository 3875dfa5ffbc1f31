//! # mcp-delegate
//!
//! Identity and delegation SDK for building authenticated MCP servers and
//! clients.
//!
//! The crate is a four-layer stack, leaves first:
//!
//! - [`oauth`] -- an OAuth 2.0 client: RFC 8693 token exchange, RFC 7591
//!   dynamic client registration, RFC 8414 discovery, RFC 7636 PKCE, plus
//!   introspection, revocation, and PAR. Typed records, pluggable
//!   authentication strategies, and a retriable/non-retriable error
//!   taxonomy.
//! - [`verifier`] + [`jwks`] + [`metadata`] -- JWKS-backed JWT validation
//!   (issuer, audience, expiry with bounded clock skew) and the RFC 9728 /
//!   RFC 8414 discovery documents a protected server publishes.
//! - [`provider`] -- the server side: wrap a protected MCP application with
//!   bearer authentication, declare per-tool [`provider::Grant`]s, and hand
//!   tool bodies an [`provider::AccessContext`] of downstream tokens
//!   obtained by exchanging the caller's inbound token.
//! - [`coordinator`] -- the client side: drive the PKCE authorization-code
//!   flow against any number of upstream MCP servers, own the per-(context,
//!   server) session state machine, persist tokens, and notify subscribers
//!   when authorizations complete. [`coordinator::LocalAuthCoordinator`]
//!   serves a loopback redirect and opens the system browser;
//!   [`coordinator::RemoteAuthCoordinator`] hands the authorization URL to
//!   the embedding application.
//!
//! The MCP wire protocol itself is not in this crate: the provider mounts a
//! caller-supplied MCP application, and the coordinator hands tokens to a
//! caller-supplied MCP client.
//!
//! ## Server example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mcp_delegate::provider::{DelegationProvider, Grant, ProviderConfig};
//! use mcp_delegate::oauth::AuthScheme;
//! use mcp_delegate::Zone;
//!
//! # async fn example(mcp_app: axum::Router) -> mcp_delegate::Result<()> {
//! let provider = Arc::new(DelegationProvider::new(
//!     ProviderConfig::new(
//!         Zone::from_url("https://acme.zones.example"),
//!         "My MCP Server",
//!         "http://srv:8000",
//!     )
//!     .credential(AuthScheme::basic("server-client", "server-secret")),
//! )?);
//!
//! let app = provider.app(mcp_app);
//! // serve `app` with axum::serve on the configured base address
//! # let _ = app;
//! # Ok(())
//! # }
//! ```
//!
//! ## Client example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mcp_delegate::coordinator::{
//!     CoordinatorConfig, LocalAuthCoordinator, LocalConfig, MemoryStorage, ServerEntry,
//! };
//!
//! # async fn example() -> mcp_delegate::Result<()> {
//! let coordinator = LocalAuthCoordinator::start(
//!     CoordinatorConfig::new("My MCP Client")
//!         .server("srv", ServerEntry::new("http://srv:8000/mcp")),
//!     LocalConfig::default(),
//!     Arc::new(MemoryStorage::new()),
//! )
//! .await?;
//!
//! let outcome = coordinator.connect("default", "srv").await?;
//! if outcome.is_connected() {
//!     let token = coordinator
//!         .coordinator()
//!         .valid_access_token("default", "srv")
//!         .await?;
//!     // hand `token` to the MCP transport
//! }
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod error;
pub mod jwks;
pub mod metadata;
pub mod oauth;
pub mod provider;
pub mod secret;
pub mod verifier;
pub mod zone;

// Re-exports
pub use error::{BoxError, Error, Result};
pub use jwks::JwksError;
pub use metadata::{ProtectedResourceMetadata, StatusResponse, resource_metadata_url};
pub use secret::SecretString;
pub use verifier::{TokenVerifier, VerifiedClaims, VerifyError};
pub use zone::Zone;
