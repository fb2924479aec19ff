//! Process-wide client notifications.
//!
//! The UI layer subscribes and reacts (upgrade prompt, login redirect,
//! toasts). Delivery is fire-and-forget: sending never waits for a receiver.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 32;

/// Payload the server attaches to a 402 response.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct BillingLimit {
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub limit: Option<f64>,
    #[serde(default)]
    pub current: Option<f64>,
}

impl BillingLimit {
    /// Lenient parse: a body that is not the expected JSON still produces
    /// an (empty) payload so the signal is never lost.
    pub fn from_body(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    BillingLimitReached(BillingLimit),
    /// The session could not be recovered and was cleared.
    SessionInvalidated,
    LoggedOut,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        tracing::debug!("event: {:?}", event);
        let _ = self.tx.send(event);
    }
}
