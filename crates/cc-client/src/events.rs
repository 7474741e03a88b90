//! Typed event surface.
//!
//! Rather than duck-typed event emitters, the event set is closed and each
//! variant carries a concrete payload. Subscribers register through
//! [`EventBus::subscribe`] rather than reflecting over event names.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// A verified, decrypted direct message arrived.
    Message {
        sender: String,
        message_id: Uuid,
        timestamp: DateTime<Utc>,
        payload: serde_json::Value,
        verified: bool,
    },
    /// A verified, decrypted group message arrived.
    GroupMessage {
        group_id: String,
        sender: String,
        message_id: Uuid,
        timestamp: DateTime<Utc>,
        payload: serde_json::Value,
    },
    /// A signed admin broadcast arrived.
    Broadcast {
        id: String,
        kind: String,
        payload: serde_json::Value,
    },
    /// An incoming contact request; never auto-accepted.
    ContactRequest {
        from: String,
        greeting: Option<String>,
    },
    /// A retry-queue entry changed status.
    DeliveryStatus {
        message_id: Uuid,
        recipient: String,
        status: String,
    },
    /// A community's active relay changed.
    CommunityStatus { community: String, status: String },
    /// A key-rotation fan-out completed with partial failure.
    KeyRotationPartial {
        failed_communities: Vec<String>,
    },
    /// A peer's cached public key changed from what was previously trusted.
    KeyChanged { username: String, community: String },
}

pub type Handler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// A minimal in-process pub/sub bus. Handlers run synchronously and must not
/// block; long work should be spawned onto the runtime by the handler itself.
#[derive(Default, Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    pub fn emit(&self, event: ClientEvent) {
        for handler in self.handlers.read().iter() {
            handler(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(ClientEvent::CommunityStatus {
            community: "home".into(),
            status: "failover".into(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
