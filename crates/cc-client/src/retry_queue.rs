//! Bounded retry queue for P2P deliveries that could not be made immediately.
//!
//! A background scanner ([`crate::runtime::AgentRuntime`], ticking every 1s)
//! pulls due entries with [`RetryQueue::take_due`], hands each to
//! [`crate::pipeline::MessagePipeline::attempt_retry`], and sweeps stale ones
//! with [`RetryQueue::expire_stale`]. Entries advance `pending -> sending ->
//! {delivered, expired, failed}`, emitting a [`ClientEvent::DeliveryStatus`]
//! at every transition.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use cc_crypto::envelope::Envelope;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::events::{ClientEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Sending,
    Delivered,
    Expired,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub message_id: Uuid,
    pub community: String,
    pub recipient: String,
    pub envelope: Envelope,
    pub next_attempt_at: DateTime<Utc>,
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
    pub status: QueueStatus,
}

pub struct RetryQueueConfig {
    pub max_len: usize,
    pub offsets: Vec<Duration>,
    pub max_attempts: u32,
    pub horizon: Duration,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            max_len: 100,
            offsets: vec![
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(90),
            ],
            max_attempts: 3,
            horizon: Duration::from_secs(60 * 60),
        }
    }
}

pub struct RetryQueue {
    config: RetryQueueConfig,
    entries: Mutex<VecDeque<RetryEntry>>,
    events: EventBus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    Delivered,
    Retryable,
}

impl RetryQueue {
    pub fn new(config: RetryQueueConfig, events: EventBus) -> Self {
        Self {
            config,
            entries: Mutex::new(VecDeque::new()),
            events,
        }
    }

    /// Enqueue a new message for retry. Rejects when at capacity.
    pub fn enqueue(&self, community: String, recipient: String, envelope: Envelope) -> Result<Uuid, ()> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.config.max_len {
            return Err(());
        }
        let message_id = envelope.body.message_id;
        let now = Utc::now();
        let entry = RetryEntry {
            message_id,
            community,
            recipient: recipient.clone(),
            envelope,
            next_attempt_at: now
                + chrono::Duration::from_std(self.config.offsets[0])
                    .unwrap_or(chrono::Duration::seconds(10)),
            attempts_made: 0,
            enqueued_at: now,
            status: QueueStatus::Pending,
        };
        entries.push_back(entry);
        drop(entries);
        self.events.emit(ClientEvent::DeliveryStatus {
            message_id,
            recipient,
            status: "pending".into(),
        });
        Ok(message_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Pull entries that are due for an attempt right now, marking them
    /// `sending` so a concurrent scan does not double-attempt them.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<RetryEntry> {
        let mut entries = self.entries.lock();
        let mut due = Vec::new();
        for entry in entries.iter_mut() {
            if entry.status == QueueStatus::Pending && entry.next_attempt_at <= now {
                entry.status = QueueStatus::Sending;
                due.push(entry.clone());
            }
        }
        drop(entries);
        for entry in &due {
            self.events.emit(ClientEvent::DeliveryStatus {
                message_id: entry.message_id,
                recipient: entry.recipient.clone(),
                status: "sending".into(),
            });
        }
        due
    }

    /// Expire entries whose age exceeds the retry horizon.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut entries = self.entries.lock();
        let mut expired = Vec::new();
        entries.retain(|e| {
            let age = now - e.enqueued_at;
            let too_old = age
                > chrono::Duration::from_std(self.config.horizon)
                    .expect("configured retry horizon fits in chrono::Duration");
            if too_old && e.status != QueueStatus::Sending {
                expired.push(e.message_id);
                false
            } else {
                true
            }
        });
        drop(entries);
        for id in &expired {
            self.events.emit(ClientEvent::DeliveryStatus {
                message_id: *id,
                recipient: String::new(),
                status: "expired".into(),
            });
        }
        expired
    }

    /// Record the outcome of an attempt taken via [`RetryQueue::take_due`].
    pub fn record_attempt(&self, message_id: Uuid, result: AttemptResult) {
        let mut entries = self.entries.lock();
        let Some(pos) = entries.iter().position(|e| e.message_id == message_id) else {
            return;
        };
        match result {
            AttemptResult::Delivered => {
                let entry = entries
                    .remove(pos)
                    .expect("pos was just located by position() above");
                drop(entries);
                self.events.emit(ClientEvent::DeliveryStatus {
                    message_id,
                    recipient: entry.recipient,
                    status: "delivered".into(),
                });
            }
            AttemptResult::Retryable => {
                let entry = &mut entries[pos];
                entry.attempts_made += 1;
                if entry.attempts_made >= self.config.max_attempts {
                    let recipient = entry.recipient.clone();
                    entries.remove(pos);
                    drop(entries);
                    self.events.emit(ClientEvent::DeliveryStatus {
                        message_id,
                        recipient,
                        status: "failed".into(),
                    });
                } else {
                    let offset = self
                        .config
                        .offsets
                        .get(entry.attempts_made as usize)
                        .copied()
                        .unwrap_or_else(|| {
                            *self
                                .config
                                .offsets
                                .last()
                                .expect("retry offsets configured with at least one entry")
                        });
                    entry.next_attempt_at = Utc::now()
                        + chrono::Duration::from_std(offset)
                            .expect("configured retry offset fits in chrono::Duration");
                    entry.status = QueueStatus::Pending;
                    let recipient = entry.recipient.clone();
                    drop(entries);
                    self.events.emit(ClientEvent::DeliveryStatus {
                        message_id,
                        recipient,
                        status: "pending".into(),
                    });
                }
            }
        }
    }

    pub fn entries_snapshot(&self) -> Vec<RetryEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}

pub type SharedRetryQueue = Arc<RetryQueue>;

#[cfg(test)]
mod tests {
    use super::*;
    use cc_crypto::envelope::{Envelope, EnvelopeBody, EnvelopePayload, ENVELOPE_VERSION};
    use cc_crypto::identity::Identity;

    fn dummy_envelope() -> Envelope {
        let identity = Identity::generate();
        let body = EnvelopeBody {
            version: ENVELOPE_VERSION.to_string(),
            kind: cc_crypto::envelope::EnvelopeType::Direct,
            message_id: Uuid::new_v4(),
            sender: "alice".into(),
            recipient: "bob".into(),
            timestamp: Utc::now(),
            group_id: None,
            payload: EnvelopePayload::Plain(serde_json::json!({})),
        };
        Envelope::sign(body, identity.sign_key()).unwrap()
    }

    #[test]
    fn enqueue_rejects_when_full() {
        let queue = RetryQueue::new(
            RetryQueueConfig {
                max_len: 1,
                ..Default::default()
            },
            EventBus::new(),
        );
        queue.enqueue("home".into(), "bob".into(), dummy_envelope()).unwrap();
        assert!(queue.enqueue("home".into(), "bob".into(), dummy_envelope()).is_err());
    }

    #[test]
    fn three_failed_attempts_mark_failed_and_remove_entry() {
        let queue = RetryQueue::new(RetryQueueConfig::default(), EventBus::new());
        let id = queue.enqueue("home".into(), "bob".into(), dummy_envelope()).unwrap();
        for _ in 0..3 {
            queue.record_attempt(id, AttemptResult::Retryable);
        }
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn delivered_attempt_removes_entry() {
        let queue = RetryQueue::new(RetryQueueConfig::default(), EventBus::new());
        let id = queue.enqueue("home".into(), "bob".into(), dummy_envelope()).unwrap();
        queue.record_attempt(id, AttemptResult::Delivered);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn stale_entries_expire() {
        let queue = RetryQueue::new(
            RetryQueueConfig {
                horizon: Duration::from_secs(0),
                ..Default::default()
            },
            EventBus::new(),
        );
        queue.enqueue("home".into(), "bob".into(), dummy_envelope()).unwrap();
        let expired = queue.expire_stale(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(queue.len(), 0);
    }
}
