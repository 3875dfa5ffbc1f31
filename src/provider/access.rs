//! Per-call delegation results.
//!
//! An [`AccessContext`] is the read-only projection a delegated tool
//! receives: for every resource the tool declared, exactly one of a granted
//! token or a failure reason, plus a global error slot for failures that are
//! not specific to any resource (client misconfiguration, exhausted
//! transport retries). It is constructed by the provider before the tool
//! body runs and discarded at tool exit.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::oauth::types::TokenResponse;

/// Why a delegation failed, for one resource or globally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessError {
    /// Stable machine-readable code (`invalid_target`, `invalid_grant`,
    /// `server_configuration`, `exchange_unavailable`, ...).
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl AccessError {
    /// Create a failure reason.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Outcome of one resource's token exchange: a token or a reason, never
/// both.
#[derive(Debug, Clone)]
pub enum ResourceAccess {
    /// The exchange succeeded.
    Granted(TokenResponse),
    /// The exchange was rejected.
    Denied(AccessError),
}

/// Overall status of an [`AccessContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    /// Every requested resource has a token.
    Success,
    /// Some resources failed, others succeeded.
    PartialError,
    /// A global error prevented delegation outright.
    Error,
}

/// Per-call map of `resource_url -> token or failure`, plus a global error
/// slot.
#[derive(Debug, Clone, Default)]
pub struct AccessContext {
    resources: HashMap<String, ResourceAccess>,
    global_error: Option<AccessError>,
}

impl AccessContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a granted token for a resource, clearing any prior failure.
    pub fn insert_token(&mut self, resource: impl Into<String>, token: TokenResponse) {
        self.resources
            .insert(resource.into(), ResourceAccess::Granted(token));
    }

    /// Record a failure for a resource, discarding any prior token.
    pub fn insert_error(&mut self, resource: impl Into<String>, error: AccessError) {
        self.resources
            .insert(resource.into(), ResourceAccess::Denied(error));
    }

    /// Record a failure that is not specific to any resource.
    pub fn set_global_error(&mut self, error: AccessError) {
        self.global_error = Some(error);
    }

    /// The token for a resource.
    ///
    /// # Errors
    ///
    /// The global error when one is set, the resource's failure reason when
    /// its exchange was denied, or a `not_granted` reason when the resource
    /// was never requested.
    pub fn access(&self, resource: &str) -> Result<&TokenResponse, AccessError> {
        if let Some(error) = &self.global_error {
            return Err(error.clone());
        }
        match self.resources.get(resource) {
            Some(ResourceAccess::Granted(token)) => Ok(token),
            Some(ResourceAccess::Denied(error)) => Err(error.clone()),
            None => Err(AccessError::new(
                "not_granted",
                format!("no delegation was requested for {resource}"),
            )),
        }
    }

    /// Whether a global error is set.
    pub fn has_error(&self) -> bool {
        self.global_error.is_some()
    }

    /// Whether any error is present, global or per-resource.
    pub fn has_errors(&self) -> bool {
        self.has_error()
            || self
                .resources
                .values()
                .any(|access| matches!(access, ResourceAccess::Denied(_)))
    }

    /// Whether a specific resource failed.
    pub fn has_resource_error(&self, resource: &str) -> bool {
        matches!(
            self.resources.get(resource),
            Some(ResourceAccess::Denied(_))
        )
    }

    /// The global error, if set.
    pub fn global_error(&self) -> Option<&AccessError> {
        self.global_error.as_ref()
    }

    /// The failure reason for a specific resource, if it failed.
    pub fn get_resource_errors(&self, resource: &str) -> Option<&AccessError> {
        match self.resources.get(resource) {
            Some(ResourceAccess::Denied(error)) => Some(error),
            _ => None,
        }
    }

    /// Every failure in the context: the global error under `None`,
    /// per-resource failures under their resource URL.
    pub fn get_errors(&self) -> Vec<(Option<&str>, &AccessError)> {
        let mut errors: Vec<(Option<&str>, &AccessError)> = Vec::new();
        if let Some(error) = &self.global_error {
            errors.push((None, error));
        }
        for (resource, access) in &self.resources {
            if let ResourceAccess::Denied(error) = access {
                errors.push((Some(resource.as_str()), error));
            }
        }
        errors
    }

    /// Overall status of the delegation stage.
    pub fn status(&self) -> AccessStatus {
        if self.has_error() {
            AccessStatus::Error
        } else if self.has_errors() {
            AccessStatus::PartialError
        } else {
            AccessStatus::Success
        }
    }

    /// Resources with a granted token.
    pub fn successful_resources(&self) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|(_, access)| matches!(access, ResourceAccess::Granted(_)))
            .map(|(resource, _)| resource.as_str())
            .collect()
    }

    /// Resources whose exchange failed.
    pub fn failed_resources(&self) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|(_, access)| matches!(access, ResourceAccess::Denied(_)))
            .map(|(resource, _)| resource.as_str())
            .collect()
    }

    /// Iterate all per-resource outcomes.
    pub fn resources(&self) -> impl Iterator<Item = (&str, &ResourceAccess)> {
        self.resources
            .iter()
            .map(|(resource, access)| (resource.as_str(), access))
    }

    /// Number of resources with an outcome.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether the context holds no per-resource outcomes.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(value: &str) -> TokenResponse {
        serde_json::from_value(serde_json::json!({
            "access_token": value,
            "token_type": "Bearer",
            "expires_in": 3600
        }))
        .unwrap()
    }

    #[test]
    fn test_empty_context_has_no_errors() {
        let ctx = AccessContext::new();
        assert!(!ctx.has_errors());
        assert_eq!(ctx.status(), AccessStatus::Success);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_granted_resource_is_accessible() {
        let mut ctx = AccessContext::new();
        ctx.insert_token("https://api.github.com", token("T2"));

        assert_eq!(
            ctx.access("https://api.github.com").unwrap().access_token,
            "T2"
        );
        assert!(!ctx.has_errors());
        assert_eq!(ctx.successful_resources(), vec!["https://api.github.com"]);
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_exactly_one_arm_per_resource() {
        let mut ctx = AccessContext::new();

        // Error then token: token wins, error is gone.
        ctx.insert_error("https://a.example", AccessError::new("invalid_target", "nope"));
        ctx.insert_token("https://a.example", token("T"));
        assert!(ctx.access("https://a.example").is_ok());
        assert!(!ctx.has_resource_error("https://a.example"));

        // Token then error: error wins, token is gone.
        ctx.insert_error("https://a.example", AccessError::new("invalid_grant", "no"));
        assert!(ctx.access("https://a.example").is_err());
        assert!(ctx.has_resource_error("https://a.example"));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_partial_failure_status() {
        let mut ctx = AccessContext::new();
        ctx.insert_token("https://a.example", token("TA"));
        ctx.insert_error(
            "https://b.example",
            AccessError::new("invalid_target", "unknown audience"),
        );

        assert!(ctx.has_errors());
        assert!(!ctx.has_error());
        assert_eq!(ctx.status(), AccessStatus::PartialError);
        assert!(ctx.has_resource_error("https://b.example"));
        assert!(!ctx.has_resource_error("https://a.example"));
        assert!(ctx.access("https://a.example").is_ok());
        assert_eq!(
            ctx.get_resource_errors("https://b.example").unwrap().code,
            "invalid_target"
        );
        assert_eq!(ctx.failed_resources(), vec!["https://b.example"]);
    }

    #[test]
    fn test_global_error_blocks_all_access() {
        let mut ctx = AccessContext::new();
        ctx.insert_token("https://a.example", token("TA"));
        ctx.set_global_error(AccessError::new(
            "server_configuration",
            "exchange client not configured",
        ));

        assert!(ctx.has_error());
        assert!(ctx.has_errors());
        assert_eq!(ctx.status(), AccessStatus::Error);
        let err = ctx.access("https://a.example").unwrap_err();
        assert_eq!(err.code, "server_configuration");
    }

    #[test]
    fn test_unrequested_resource_is_not_granted() {
        let ctx = AccessContext::new();
        let err = ctx.access("https://never.example").unwrap_err();
        assert_eq!(err.code, "not_granted");
    }

    #[test]
    fn test_get_errors_collects_global_and_per_resource() {
        let mut ctx = AccessContext::new();
        ctx.insert_error("https://b.example", AccessError::new("invalid_target", "no"));
        ctx.set_global_error(AccessError::new("exchange_unavailable", "5xx"));

        let errors = ctx.get_errors();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|(resource, _)| resource.is_none()));
        assert!(
            errors
                .iter()
                .any(|(resource, _)| *resource == Some("https://b.example"))
        );
    }
}
