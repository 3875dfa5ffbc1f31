//! Zone addressing for authorization-server tenants.
//!
//! A zone is one tenant of an authorization server. It is addressed either
//! by an explicit URL or by a zone ID that is combined with a base domain:
//! `zone_id` + `https://keyring.example` yields
//! `https://zone_id.keyring.example`. Default ports (80 for http, 443 for
//! https) are elided from the rendered URL.

use url::Url;

use crate::error::{Error, Result};

/// A logical authorization-server tenant.
///
/// Configured once per provider or per upstream-server entry and immutable
/// afterwards.
///
/// # Example
///
/// ```rust
/// use mcp_delegate::Zone;
///
/// let by_url = Zone::from_url("https://acme.zones.example");
/// assert_eq!(by_url.url().unwrap(), "https://acme.zones.example");
///
/// let by_id = Zone::from_id("acme", "https://zones.example");
/// assert_eq!(by_id.url().unwrap(), "https://acme.zones.example");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Zone {
    /// Explicit zone URL.
    Url(String),
    /// Zone ID resolved against a base domain.
    Id {
        /// Tenant identifier, becomes the leftmost host label.
        zone_id: String,
        /// Base URL whose host the zone ID is prefixed to.
        base_url: String,
    },
}

impl Zone {
    /// Address a zone by its full URL.
    pub fn from_url(url: impl Into<String>) -> Self {
        Zone::Url(url.into().trim_end_matches('/').to_string())
    }

    /// Address a zone by ID relative to a base domain.
    pub fn from_id(zone_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Zone::Id {
            zone_id: zone_id.into(),
            base_url: base_url.into(),
        }
    }

    /// The zone ID, when this zone is addressed by ID.
    pub fn id(&self) -> Option<&str> {
        match self {
            Zone::Url(_) => None,
            Zone::Id { zone_id, .. } => Some(zone_id),
        }
    }

    /// Resolve the zone base URL.
    ///
    /// For [`Zone::Id`] the ID is prepended to the base host:
    /// `{scheme}://{zone_id}.{host}[:port]`, eliding default ports.
    pub fn url(&self) -> Result<String> {
        match self {
            Zone::Url(url) => Ok(url.clone()),
            Zone::Id { zone_id, base_url } => {
                if zone_id.is_empty() {
                    return Err(Error::config("zone_id must not be empty"));
                }
                let base = Url::parse(base_url)
                    .map_err(|e| Error::config(format!("invalid zone base URL {base_url:?}: {e}")))?;
                let host = base
                    .host_str()
                    .ok_or_else(|| Error::config(format!("zone base URL {base_url:?} has no host")))?;

                let port_part = match (base.scheme(), base.port()) {
                    (_, None) => String::new(),
                    ("https", Some(443)) | ("http", Some(80)) => String::new(),
                    (_, Some(port)) => format!(":{port}"),
                };

                Ok(format!("{}://{zone_id}.{host}{port_part}", base.scheme()))
            }
        }
    }
}
