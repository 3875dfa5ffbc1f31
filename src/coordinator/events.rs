//! Completion events and subscriber fan-out.
//!
//! After the coordinator processes an authorization-server callback it
//! publishes one [`CompletionEvent`] to every subscriber. Delivery is
//! best-effort and serialized per coordinator: events go out in completion
//! order, a failing subscriber is logged and never blocks progress.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::BoxError;

/// Outcome of one authorization callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    /// Context the authorization belongs to.
    pub context_id: String,
    /// Upstream server the authorization was for.
    pub server_name: String,
    /// The opaque `state` correlation value of the flow.
    pub state: String,
    /// Whether the flow produced a stored token.
    pub success: bool,
    /// Machine-readable reason on failure (`timeout`, `cancelled`,
    /// `access_denied`, an OAuth error code, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Success payload (e.g. token expiry), when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Application-supplied session metadata, copied verbatim.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Receives completion events.
#[async_trait]
pub trait CompletionSubscriber: Send + Sync + 'static {
    /// Handle one event. Errors are logged by the dispatcher and do not
    /// affect other subscribers or the coordinator.
    async fn on_completion(&self, event: &CompletionEvent) -> Result<(), BoxError>;
}

/// Fan-out of completion events to subscribers, serialized per
/// coordinator.
#[derive(Default)]
pub(crate) struct EventDispatcher {
    subscribers: RwLock<Vec<Arc<dyn CompletionSubscriber>>>,
    /// Serializes deliveries so subscribers observe completion order.
    delivery: Mutex<()>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn CompletionSubscriber>) {
        self.subscribers.write().await.push(subscriber);
    }

    pub async fn dispatch(&self, event: &CompletionEvent) {
        let _serialized = self.delivery.lock().await;
        let subscribers = self.subscribers.read().await.clone();
        for subscriber in subscribers {
            if let Err(err) = subscriber.on_completion(event).await {
                tracing::warn!(
                    context_id = %event.context_id,
                    server_name = %event.server_name,
                    error = %err,
                    "completion subscriber failed"
                );
            }
        }
    }
}
