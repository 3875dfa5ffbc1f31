//! OAuth 2.0 client layer.
//!
//! Stateless request builders and HTTP callers for the standardized OAuth
//! endpoints: `/token` (authorization-code, refresh, RFC 8693 token
//! exchange), `/register` (RFC 7591), `/introspect` (RFC 7662), `/revoke`
//! (RFC 7009), `/par` (RFC 9126), and RFC 8414 metadata discovery at
//! `/.well-known/oauth-authorization-server`.
//!
//! # Architecture
//!
//! - **Typed records** ([`types`]): request/response models for every
//!   endpoint, preserving vendor extensions in an `extra` map.
//! - **Auth strategies** ([`AuthScheme`]): how the client authenticates to
//!   the authorization server. Strategies mutate outbound headers only.
//! - **PKCE** ([`pkce`]): verifier, S256 challenge, and `state` generation
//!   per RFC 7636.
//! - **Retries** ([`RetryPolicy`]): exponential backoff with full jitter,
//!   applied only to transport failures and retriable HTTP statuses.
//! - **Client** ([`OAuthClient`]): resolves endpoints (override > discovery
//!   > default), applies the auth strategy, and classifies failures into the
//!   crate error taxonomy.
//!
//! # Example
//!
//! ```rust,no_run
//! use mcp_delegate::oauth::{OAuthClient, AuthScheme, TokenExchangeRequest};
//!
//! # async fn example() -> mcp_delegate::Result<()> {
//! let client = OAuthClient::builder("https://acme.zones.example")
//!     .auth(AuthScheme::basic("server-client", "server-secret"))
//!     .build()?;
//!
//! let exchanged = client
//!     .exchange_token(
//!         &TokenExchangeRequest::for_access_token("inbound-token")
//!             .resource("https://api.github.com"),
//!     )
//!     .await?;
//! println!("downstream token: {}", exchanged.access_token);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod pkce;
pub mod retry;
pub mod types;

// Re-exports
pub use auth::AuthScheme;
pub use client::{EndpointInfo, EndpointSource, OAuthClient, OAuthClientBuilder};
pub use pkce::{PkceChallenge, generate_state};
pub use retry::RetryPolicy;
pub use types::{
    Audience, AuthorizationRequest, ClientConfig, ClientRegistrationRequest,
    ClientRegistrationResponse, Endpoints, IntrospectionResponse, ParResponse, ServerMetadata,
    TokenExchangeRequest, TokenResponse, urn,
};
