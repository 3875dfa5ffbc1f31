//! Authentication strategies for outbound OAuth requests.
//!
//! An [`AuthScheme`] decides how the client identifies itself to the
//! authorization server. Strategies mutate outbound request headers only;
//! they never inspect responses.
//!
//! [`AuthScheme::PerZoneBasic`] carries one credential pair per zone for
//! multi-tenant deployments. Selecting a zone that has no configured
//! credentials is a configuration error, raised before any network call.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::secret::SecretString;

/// How the OAuth client authenticates to the authorization server.
#[derive(Debug, Clone, Default)]
pub enum AuthScheme {
    /// No client authentication (public clients, anonymous registration).
    #[default]
    None,

    /// HTTP Basic with a single client credential pair.
    Basic {
        client_id: String,
        client_secret: SecretString,
    },

    /// A static bearer token (e.g. an initial registration access token).
    Bearer { token: SecretString },

    /// HTTP Basic with per-zone credential pairs, keyed by zone ID.
    PerZoneBasic {
        zones: HashMap<String, (String, SecretString)>,
    },
}

impl AuthScheme {
    /// HTTP Basic with a single credential pair.
    pub fn basic(client_id: impl Into<String>, client_secret: impl Into<SecretString>) -> Self {
        AuthScheme::Basic {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// A static bearer token.
    pub fn bearer(token: impl Into<SecretString>) -> Self {
        AuthScheme::Bearer {
            token: token.into(),
        }
    }

    /// Per-zone HTTP Basic credentials.
    pub fn per_zone_basic<I, Z, C, S>(zones: I) -> Self
    where
        I: IntoIterator<Item = (Z, (C, S))>,
        Z: Into<String>,
        C: Into<String>,
        S: Into<SecretString>,
    {
        AuthScheme::PerZoneBasic {
            zones: zones
                .into_iter()
                .map(|(zone, (id, secret))| (zone.into(), (id.into(), secret.into())))
                .collect(),
        }
    }

    /// Whether this strategy has credentials for the given zone.
    pub fn has_zone(&self, zone_id: &str) -> bool {
        match self {
            AuthScheme::PerZoneBasic { zones } => zones.contains_key(zone_id),
            _ => false,
        }
    }

    /// Zone IDs this strategy is configured for, sorted.
    pub fn configured_zones(&self) -> Vec<&str> {
        match self {
            AuthScheme::PerZoneBasic { zones } => {
                let mut ids: Vec<&str> = zones.keys().map(String::as_str).collect();
                ids.sort_unstable();
                ids
            }
            _ => Vec::new(),
        }
    }

    /// Apply this strategy to an outbound request.
    ///
    /// `zone_id` selects the credential pair for [`AuthScheme::PerZoneBasic`]
    /// and is ignored by the other strategies.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when a per-zone strategy is used without a zone, or
    /// with a zone it has no credentials for.
    pub fn apply(
        &self,
        builder: reqwest::RequestBuilder,
        zone_id: Option<&str>,
    ) -> Result<reqwest::RequestBuilder> {
        match self {
            AuthScheme::None => Ok(builder),
            AuthScheme::Basic {
                client_id,
                client_secret,
            } => Ok(builder.basic_auth(client_id, Some(client_secret.expose()))),
            AuthScheme::Bearer { token } => Ok(builder.bearer_auth(token.expose())),
            AuthScheme::PerZoneBasic { zones } => {
                let zone_id = zone_id.ok_or_else(|| {
                    Error::config("per-zone credentials require a zone_id on the client")
                })?;
                let (client_id, client_secret) = zones.get(zone_id).ok_or_else(|| {
                    Error::config(format!(
                        "no credentials configured for zone {zone_id:?}; configured zones: {:?}",
                        self.configured_zones()
                    ))
                })?;
                Ok(builder.basic_auth(client_id, Some(client_secret.expose())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> reqwest::RequestBuilder {
        reqwest::Client::new().get("http://localhost/")
    }

    fn built_headers(builder: reqwest::RequestBuilder) -> reqwest::header::HeaderMap {
        builder.build().unwrap().headers().clone()
    }

    #[test]
    fn test_none_adds_no_headers() {
        let scheme = AuthScheme::None;
        let headers = built_headers(scheme.apply(builder(), None).unwrap());
        assert!(!headers.contains_key("authorization"));
    }

    #[test]
    fn test_basic_sets_authorization_header() {
        let scheme = AuthScheme::basic("c1", "s1");
        let headers = built_headers(scheme.apply(builder(), None).unwrap());
        let value = headers.get("authorization").unwrap().to_str().unwrap();
        assert!(value.starts_with("Basic "));
    }

    #[test]
    fn test_bearer_sets_authorization_header() {
        let scheme = AuthScheme::bearer("tok-1");
        let headers = built_headers(scheme.apply(builder(), None).unwrap());
        let value = headers.get("authorization").unwrap().to_str().unwrap();
        assert_eq!(value, "Bearer tok-1");
    }

    #[test]
    fn test_per_zone_selects_matching_zone() {
        let scheme = AuthScheme::per_zone_basic([
            ("zone1", ("id1", "secret1")),
            ("zone2", ("id2", "secret2")),
        ]);
        assert!(scheme.has_zone("zone1"));
        assert!(!scheme.has_zone("zone3"));

        let headers = built_headers(scheme.apply(builder(), Some("zone2")).unwrap());
        assert!(headers.contains_key("authorization"));
    }

    #[test]
    fn test_per_zone_without_zone_is_config_error() {
        let scheme = AuthScheme::per_zone_basic([("zone1", ("id1", "secret1"))]);
        let err = scheme.apply(builder(), None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_per_zone_unknown_zone_names_configured_zones() {
        let scheme = AuthScheme::per_zone_basic([
            ("zone1", ("id1", "secret1")),
            ("zone2", ("id2", "secret2")),
        ]);
        let err = scheme.apply(builder(), Some("zone9")).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("zone9"));
        assert!(message.contains("zone1"));
        assert!(message.contains("zone2"));
    }

    #[test]
    fn test_debug_never_shows_secrets() {
        let scheme = AuthScheme::per_zone_basic([("zone1", ("id1", "hunter2"))]);
        let debug = format!("{:?}", scheme);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }
}
