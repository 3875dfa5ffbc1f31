//! Session state machine.
//!
//! One [`Session`] tracks the coordinator's view of a single
//! (context, server) pair as it moves through connection, authentication,
//! operation, and recovery. Transitions are total-ordered within a session
//! (the coordinator mutates it under a lock) and follow a fixed table; a
//! session never regresses to `Initializing`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ServerEntry;

/// Lifecycle state of a (context, server) session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session created, nothing attempted.
    Initializing,
    /// HTTP connection to the MCP server in progress.
    Connecting,
    /// Discovery and client registration in progress.
    Authenticating,
    /// Awaiting user completion of the authorization-code flow.
    AuthPending,
    /// Authenticated; tool calls permitted.
    Connected,
    /// Authentication attempt failed; retriable.
    AuthFailed,
    /// Connection attempt failed; retriable.
    ConnectionFailed,
}

impl SessionStatus {
    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Initializing, Connecting)
                | (Connecting, Connected)
                | (Connecting, Authenticating)
                | (Connecting, ConnectionFailed)
                | (Authenticating, AuthPending)
                | (Authenticating, AuthFailed)
                | (Authenticating, Connected)
                | (AuthPending, Authenticating)
                | (AuthPending, AuthFailed)
                | (Connected, Connecting)
                | (Connected, ConnectionFailed)
                | (AuthFailed, Connecting)
                | (ConnectionFailed, Connecting)
        )
    }

    /// Tool calls are permitted.
    pub fn is_operational(self) -> bool {
        self == SessionStatus::Connected
    }

    /// The user must complete an authorization flow.
    pub fn requires_user_action(self) -> bool {
        self == SessionStatus::AuthPending
    }

    /// The last attempt ended in a failure state.
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            SessionStatus::AuthFailed | SessionStatus::ConnectionFailed
        )
    }

    /// A new connection attempt may be started.
    pub fn can_retry(self) -> bool {
        self.is_failed()
    }
}

/// Coordinator state for one (context, server) pair.
#[derive(Debug, Clone)]
pub struct Session {
    /// Context this session belongs to.
    pub context_id: String,
    /// Upstream server name.
    pub server_name: String,
    /// The server's configuration entry.
    pub server_config: ServerEntry,
    status: SessionStatus,
    /// Authorization URL awaiting user completion. Present exactly while
    /// the session is [`SessionStatus::AuthPending`].
    authorization_url: Option<String>,
    /// The `state` value of the pending authorization.
    pending_state: Option<String>,
    /// Reason for the most recent failure.
    pub last_error: Option<String>,
    /// Opaque application-supplied data, copied onto completion events.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Session {
    /// A new session in [`SessionStatus::Initializing`].
    pub fn new(
        context_id: impl Into<String>,
        server_name: impl Into<String>,
        server_config: ServerEntry,
    ) -> Self {
        Self {
            context_id: context_id.into(),
            server_name: server_name.into(),
            server_config,
            status: SessionStatus::Initializing,
            authorization_url: None,
            pending_state: None,
            last_error: None,
            metadata: HashMap::new(),
        }
    }

    /// Current state.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// The authorization URL the user must visit, while
    /// [`SessionStatus::AuthPending`].
    pub fn authorization_url(&self) -> Option<&str> {
        self.authorization_url.as_deref()
    }

    /// The `state` value of the pending authorization, while
    /// [`SessionStatus::AuthPending`].
    pub fn pending_state(&self) -> Option<&str> {
        self.pending_state.as_deref()
    }

    /// Move to `next` if the transition table allows it.
    ///
    /// Leaving [`SessionStatus::AuthPending`] clears the authorization URL
    /// and pending state, maintaining the invariant that they are present
    /// exactly in that state. Returns `false` (and changes nothing) for an
    /// illegal transition.
    pub fn transition(&mut self, next: SessionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                context_id = %self.context_id,
                server_name = %self.server_name,
                from = ?self.status,
                to = ?next,
                "illegal session transition refused"
            );
            return false;
        }

        tracing::debug!(
            context_id = %self.context_id,
            server_name = %self.server_name,
            from = ?self.status,
            to = ?next,
            "session transition"
        );
        self.status = next;
        if next != SessionStatus::AuthPending {
            self.authorization_url = None;
            self.pending_state = None;
        }
        if !next.is_failed() {
            self.last_error = None;
        }
        true
    }

    /// Enter [`SessionStatus::AuthPending`] with the authorization URL and
    /// its `state` value.
    pub fn mark_auth_pending(&mut self, authorization_url: String, state: String) -> bool {
        if !self.transition(SessionStatus::AuthPending) {
            return false;
        }
        self.authorization_url = Some(authorization_url);
        self.pending_state = Some(state);
        true
    }

    /// Enter a failure state with a reason.
    pub fn mark_failed(&mut self, status: SessionStatus, reason: impl Into<String>) -> bool {
        debug_assert!(status.is_failed());
        if !self.transition(status) {
            return false;
        }
        self.last_error = Some(reason.into());
        true
    }
}
