//! Real-time event bus: per-topic broadcast with at-least-once delivery from
//! the outbox and best-effort delivery for state events.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use numio_core::UserId;

/// One bus event. `user` routes per-user channels; `topic` is the event-type
/// vocabulary string.
#[derive(Clone, Debug, Serialize)]
pub struct BusEvent {
    pub topic: String,
    pub user: Option<UserId>,
    pub payload: serde_json::Value,
}

/// Cheap to clone; all clones share the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish; delivery is best-effort and never fails the caller.
    pub fn publish(&self, topic: &str, user: Option<&UserId>, payload: serde_json::Value) {
        let event = BusEvent {
            topic: topic.to_string(),
            user: user.cloned(),
            payload,
        };
        if self.tx.send(event).is_err() {
            debug!(topic, "no bus subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
