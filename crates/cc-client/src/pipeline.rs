//! E2E message pipeline: send and receive.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine};
use cc_crypto::dedup::DedupSet;
use cc_crypto::envelope::{
    decrypt_payload, derive_message_key, encrypt_payload, Envelope, EnvelopeBody, EnvelopePayload,
    EnvelopeType, ENVELOPE_VERSION,
};
use cc_crypto::identity::Identity;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::community::CommunityManager;
use crate::contact_cache::ContactEntry;
use crate::delivery_report::{DeliveryAttempt, DeliveryReports};
use crate::errors::{ClientError, SendOutcome};
use crate::events::{ClientEvent, EventBus};
use crate::member_cache::GroupMemberCache;
use crate::relay_client::RelayTransport;
use crate::retry_queue::{AttemptResult, RetryQueue};

/// Low-level direct-to-peer HTTP delivery, abstracted for testability.
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    async fn post_envelope(
        &self,
        endpoint: &str,
        envelope: &Envelope,
        timeout: Duration,
    ) -> Result<u16, ClientError>;
}

pub struct ReqwestPeerTransport {
    client: reqwest::Client,
}

impl Default for ReqwestPeerTransport {
    fn default() -> Self {
        Self {
            client: reqwest::Client::builder()
                .build()
                .expect("reqwest client builds with default TLS config"),
        }
    }
}

#[async_trait::async_trait]
impl PeerTransport for ReqwestPeerTransport {
    async fn post_envelope(
        &self,
        endpoint: &str,
        envelope: &Envelope,
        timeout: Duration,
    ) -> Result<u16, ClientError> {
        let resp = self
            .client
            .post(format!("{}/inbox", endpoint.trim_end_matches('/')))
            .timeout(timeout)
            .json(envelope)
            .send()
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))?;
        Ok(resp.status().as_u16())
    }
}

pub struct DedupSets {
    pub direct: Mutex<DedupSet>,
    pub group: Mutex<DedupSet>,
    pub broadcast: Mutex<DedupSet>,
}

impl DedupSets {
    pub fn new(cap: usize) -> Self {
        Self {
            direct: Mutex::new(DedupSet::new(cap)),
            group: Mutex::new(DedupSet::new(cap)),
            broadcast: Mutex::new(DedupSet::new(cap)),
        }
    }
}

pub struct MessagePipeline<T: RelayTransport, P: PeerTransport = ReqwestPeerTransport> {
    pub community_manager: Arc<CommunityManager<T>>,
    pub retry_queue: Arc<RetryQueue>,
    pub delivery_reports: Arc<DeliveryReports>,
    pub dedup: Arc<DedupSets>,
    pub events: EventBus,
    pub agent_name: String,
    pub identity: Arc<Identity>,
    member_cache: Arc<GroupMemberCache>,
    peer_transport: P,
    p2p_timeout: Duration,
    contact_stale_after: chrono::Duration,
}

impl<T: RelayTransport> MessagePipeline<T, ReqwestPeerTransport> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        community_manager: Arc<CommunityManager<T>>,
        retry_queue: Arc<RetryQueue>,
        delivery_reports: Arc<DeliveryReports>,
        dedup: Arc<DedupSets>,
        events: EventBus,
        agent_name: String,
        identity: Arc<Identity>,
        member_cache: Arc<GroupMemberCache>,
        p2p_timeout: Duration,
        contact_stale_after: chrono::Duration,
    ) -> Self {
        Self::with_peer_transport(
            community_manager,
            retry_queue,
            delivery_reports,
            dedup,
            events,
            agent_name,
            identity,
            member_cache,
            ReqwestPeerTransport::default(),
            p2p_timeout,
            contact_stale_after,
        )
    }
}

impl<T: RelayTransport, P: PeerTransport> MessagePipeline<T, P> {
    #[allow(clippy::too_many_arguments)]
    pub fn with_peer_transport(
        community_manager: Arc<CommunityManager<T>>,
        retry_queue: Arc<RetryQueue>,
        delivery_reports: Arc<DeliveryReports>,
        dedup: Arc<DedupSets>,
        events: EventBus,
        agent_name: String,
        identity: Arc<Identity>,
        member_cache: Arc<GroupMemberCache>,
        peer_transport: P,
        p2p_timeout: Duration,
        contact_stale_after: chrono::Duration,
    ) -> Self {
        Self {
            community_manager,
            retry_queue,
            delivery_reports,
            dedup,
            events,
            agent_name,
            identity,
            member_cache,
            peer_transport,
            p2p_timeout,
            contact_stale_after,
        }
    }

    /// Validate that `sender` belongs to `group_id`:
    /// consult the shared member cache first, and only fall back to a relay
    /// refresh when the sender is not found, so a routine group send does
    /// not pay a relay round-trip per receive.
    async fn is_group_member(&self, community: &str, group_id: &str, sender: &str) -> bool {
        if let Some(members) = self.member_cache.get_fresh(community, group_id) {
            if members.iter().any(|m| m.username == sender) {
                return true;
            }
        }
        let resp = self
            .community_manager
            .call_api(community, "GET", &format!("/groups/{group_id}/members"), None)
            .await;
        let Ok(resp) = resp else { return false };
        if !resp.is_success() {
            return false;
        }
        let Ok(members) =
            serde_json::from_value::<Vec<crate::member_cache::GroupMember>>(resp.body)
        else {
            return false;
        };
        let found = members.iter().any(|m| m.username == sender);
        self.member_cache.put(community, group_id, members);
        found
    }

    /// Resolve and freshen a recipient's cached contact entry, refreshing
    /// from the relay on a miss or stale entry.
    async fn load_recipient(
        &self,
        community: &str,
        username: &str,
    ) -> Result<ContactEntry, ClientError> {
        let state = self
            .community_manager
            .community(community)
            .ok_or_else(|| ClientError::UnknownCommunity(community.to_string()))?;

        let stale = state.cache.read().await.is_stale(self.contact_stale_after);
        if stale {
            if let Err(err) = self.community_manager.refresh_contacts(community).await {
                warn!(community, %err, "contact refresh failed, using stale cache entry if present");
            }
        }

        state
            .cache
            .read()
            .await
            .get(username)
            .cloned()
            .ok_or(ClientError::NotAContact)
    }

    /// Send a message to `recipient`. `recipient` may be an
    /// unqualified username or a `user@hostname` qualified name.
    pub async fn send(
        &self,
        recipient: &str,
        payload: serde_json::Value,
    ) -> Result<SendOutcome, ClientError> {
        let (community, username) = self.community_manager.resolve_recipient(recipient).await?;
        let contact = match self.load_recipient(&community, &username).await {
            Ok(c) => c,
            Err(ClientError::NotAContact) => return Ok(SendOutcome::failed("not a contact")),
            Err(e) => return Err(e),
        };

        let state = self
            .community_manager
            .community(&community)
            .expect("resolve_recipient only returns communities the manager holds");
        let message_id = Uuid::new_v4();

        let sign_pub_bytes = STANDARD
            .decode(&contact.public_key)
            .map_err(|_| ClientError::Crypto("invalid cached public key".into()))?;
        let sign_pub: [u8; 32] = sign_pub_bytes
            .try_into()
            .map_err(|_| ClientError::Crypto("invalid cached public key length".into()))?;
        let peer_kex_pub = cc_crypto::birational::derive_x25519_public(
            &ed25519_dalek::VerifyingKey::from_bytes(&sign_pub)
                .map_err(|_| ClientError::Crypto("invalid cached public key".into()))?,
        )
        .map_err(|_| ClientError::Crypto("cached public key is not a valid curve point".into()))?;

        let shared = state.identity.key_exchange(peer_kex_pub.as_bytes());
        let key = derive_message_key(&shared, &self.agent_name, &username);
        let plaintext = serde_json::to_vec(&payload).map_err(|e| ClientError::Validation(e.to_string()))?;
        let encrypted = encrypt_payload(&key, message_id, &plaintext)
            .map_err(|e| ClientError::Crypto(e.to_string()))?;

        let body = EnvelopeBody {
            version: ENVELOPE_VERSION.to_string(),
            kind: EnvelopeType::Direct,
            message_id,
            sender: self.agent_name.clone(),
            recipient: username.clone(),
            timestamp: Utc::now(),
            group_id: None,
            payload: encrypted,
        };
        let envelope = Envelope::sign(body, state.identity.sign_key())
            .map_err(|e| ClientError::Crypto(e.to_string()))?;

        if contact.online {
            let started = Instant::now();
            match self
                .peer_transport
                .post_envelope(&contact.endpoint, &envelope, self.p2p_timeout)
                .await
            {
                Ok(status) if (200..300).contains(&status) => {
                    self.delivery_reports.record(
                        message_id,
                        DeliveryAttempt {
                            timestamp: Utc::now(),
                            presence_check: true,
                            endpoint: contact.endpoint.clone(),
                            http_status: Some(status),
                            error: None,
                            duration_ms: started.elapsed().as_millis() as u64,
                        },
                    );
                    self.delivery_reports.set_final_status(message_id, "delivered");
                    return Ok(SendOutcome::delivered(message_id));
                }
                Ok(status) if (400..500).contains(&status) => {
                    self.delivery_reports.record(
                        message_id,
                        DeliveryAttempt {
                            timestamp: Utc::now(),
                            presence_check: true,
                            endpoint: contact.endpoint.clone(),
                            http_status: Some(status),
                            error: None,
                            duration_ms: started.elapsed().as_millis() as u64,
                        },
                    );
                    self.delivery_reports.set_final_status(message_id, "failed");
                    return Ok(SendOutcome::failed(format!("peer rejected with {status}")));
                }
                Ok(status) => {
                    self.delivery_reports.record(
                        message_id,
                        DeliveryAttempt {
                            timestamp: Utc::now(),
                            presence_check: true,
                            endpoint: contact.endpoint.clone(),
                            http_status: Some(status),
                            error: None,
                            duration_ms: started.elapsed().as_millis() as u64,
                        },
                    );
                }
                Err(err) => {
                    self.delivery_reports.record(
                        message_id,
                        DeliveryAttempt {
                            timestamp: Utc::now(),
                            presence_check: true,
                            endpoint: contact.endpoint.clone(),
                            http_status: None,
                            error: Some(err.to_string()),
                            duration_ms: started.elapsed().as_millis() as u64,
                        },
                    );
                }
            }
        }

        match self.retry_queue.enqueue(community, username, envelope) {
            Ok(id) => Ok(SendOutcome::queued(id)),
            Err(()) => Ok(SendOutcome::failed("queue full")),
        }
    }

    /// Exposed so [`crate::group::GroupFanout`] can reuse this pipeline's
    /// configured peer transport for per-member deliveries.
    pub async fn post_envelope_for_group(
        &self,
        endpoint: &str,
        envelope: &Envelope,
        timeout: Duration,
    ) -> Result<u16, ClientError> {
        self.peer_transport.post_envelope(endpoint, envelope, timeout).await
    }

    /// Attempt redelivery of one retry-queue entry (driven by the
    /// background scanner every 1s).
    pub async fn attempt_retry(&self, entry: &crate::retry_queue::RetryEntry) {
        let state = match self.community_manager.community(&entry.community) {
            Some(s) => s,
            None => return,
        };
        let contact = state.cache.read().await.get(&entry.recipient).cloned();
        let online = contact.as_ref().is_some_and(|c| c.online);
        if !online {
            self.retry_queue
                .record_attempt(entry.message_id, AttemptResult::Retryable);
            return;
        }
        let endpoint = contact.expect("checked online above, online implies present").endpoint;
        let started = Instant::now();
        let result = self
            .peer_transport
            .post_envelope(&endpoint, &entry.envelope, self.p2p_timeout)
            .await;
        match result {
            Ok(status) if (200..300).contains(&status) => {
                self.delivery_reports.record(
                    entry.message_id,
                    DeliveryAttempt {
                        timestamp: Utc::now(),
                        presence_check: true,
                        endpoint,
                        http_status: Some(status),
                        error: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                    },
                );
                self.retry_queue
                    .record_attempt(entry.message_id, AttemptResult::Delivered);
            }
            _ => {
                self.retry_queue
                    .record_attempt(entry.message_id, AttemptResult::Retryable);
            }
        }
    }

    /// Receive an inbound envelope at this agent's HTTPS inbox.
    /// Returns `Ok(None)` for a silently-dropped duplicate.
    pub async fn receive(
        &self,
        community: &str,
        envelope: Envelope,
    ) -> Result<Option<()>, ClientError> {
        envelope
            .validate_framing(&self.agent_name, Utc::now())
            .map_err(|e| ClientError::Validation(e.to_string()))?;

        let state = self
            .community_manager
            .community(community)
            .ok_or_else(|| ClientError::UnknownCommunity(community.to_string()))?;

        // Broadcasts are signed by an admin key, not necessarily a contact's
        // identity key, so they verify against the admin-key cache instead
        // of the generic sender lookup below.
        if matches!(envelope.body.kind, EnvelopeType::Broadcast) {
            return self.receive_broadcast(community, &state, envelope).await;
        }

        // Group senders need not be direct contacts, so membership and the
        // sender's public key are resolved from the group member cache
        // rather than the contact cache.
        if matches!(envelope.body.kind, EnvelopeType::Group) {
            return self.receive_group(community, &state, envelope).await;
        }

        let sender = envelope.body.sender.clone();
        let mut sender_key = state.cache.read().await.get(&sender).map(|c| c.public_key.clone());
        if sender_key.is_none() {
            let _ = self.community_manager.refresh_contacts(community).await;
            sender_key = state.cache.read().await.get(&sender).map(|c| c.public_key.clone());
        }
        let sender_key = sender_key.ok_or_else(|| ClientError::NotFound(sender.clone()))?;
        let sign_pub_bytes = STANDARD
            .decode(&sender_key)
            .map_err(|_| ClientError::Crypto("invalid sender public key".into()))?;
        let sign_pub: [u8; 32] = sign_pub_bytes
            .try_into()
            .map_err(|_| ClientError::Crypto("invalid sender public key length".into()))?;

        envelope
            .verify(&sign_pub)
            .map_err(|e| ClientError::Crypto(e.to_string()))?;

        match envelope.body.kind {
            EnvelopeType::Direct => self.receive_direct(&state, envelope).await,
            EnvelopeType::ContactRequest => {
                self.receive_contact_request(envelope);
                Ok(Some(()))
            }
            _ => Err(ClientError::Validation(format!(
                "unsupported envelope type for direct inbox: {:?}",
                envelope.body.kind
            ))),
        }
    }

    async fn receive_direct(
        &self,
        state: &crate::community::CommunityState,
        envelope: Envelope,
    ) -> Result<Option<()>, ClientError> {
        let message_id = envelope.body.message_id;
        if !self.dedup.direct.lock().record(message_id) {
            return Ok(None);
        }

        let sender_pub = state
            .cache
            .read()
            .await
            .get(&envelope.body.sender)
            .and_then(|c| STANDARD.decode(&c.public_key).ok())
            .ok_or_else(|| ClientError::NotFound(envelope.body.sender.clone()))?;
        let sender_pub: [u8; 32] = sender_pub
            .try_into()
            .map_err(|_| ClientError::Crypto("invalid sender key".into()))?;
        let peer_kex_pub = cc_crypto::birational::derive_x25519_public(
            &ed25519_dalek::VerifyingKey::from_bytes(&sender_pub)
                .map_err(|_| ClientError::Crypto("invalid sender key".into()))?,
        )
        .map_err(|_| ClientError::Crypto("sender key is not a valid curve point".into()))?;
        let shared = state.identity.key_exchange(peer_kex_pub.as_bytes());
        let key = derive_message_key(&shared, &self.agent_name, &envelope.body.sender);

        let plaintext = decrypt_payload(&key, message_id, &envelope.body.payload)
            .map_err(|e| ClientError::Crypto(e.to_string()))?;
        let payload: serde_json::Value =
            serde_json::from_slice(&plaintext).map_err(|e| ClientError::Validation(e.to_string()))?;

        self.events.emit(ClientEvent::Message {
            sender: envelope.body.sender,
            message_id,
            timestamp: envelope.body.timestamp,
            payload,
            verified: true,
        });
        Ok(Some(()))
    }

    async fn receive_group(
        &self,
        community: &str,
        state: &crate::community::CommunityState,
        envelope: Envelope,
    ) -> Result<Option<()>, ClientError> {
        let group_id = envelope
            .body
            .group_id
            .clone()
            .ok_or_else(|| ClientError::Validation("group envelope missing groupId".into()))?;

        if !self
            .is_group_member(community, &group_id, &envelope.body.sender)
            .await
        {
            return Err(ClientError::NotFound(format!(
                "{} is not a member of group {group_id}",
                envelope.body.sender
            )));
        }

        let message_id = envelope.body.message_id;
        if !self.dedup.group.lock().record(message_id) {
            return Ok(None);
        }

        let sender_pub = self
            .member_cache
            .get_fresh(community, &group_id)
            .and_then(|members| {
                members
                    .into_iter()
                    .find(|m| m.username == envelope.body.sender)
            })
            .and_then(|m| STANDARD.decode(&m.public_key).ok())
            .ok_or_else(|| ClientError::NotFound(envelope.body.sender.clone()))?;
        let sender_pub: [u8; 32] = sender_pub
            .try_into()
            .map_err(|_| ClientError::Crypto("invalid sender key".into()))?;

        envelope
            .verify(&sender_pub)
            .map_err(|e| ClientError::Crypto(e.to_string()))?;
        let peer_kex_pub = cc_crypto::birational::derive_x25519_public(
            &ed25519_dalek::VerifyingKey::from_bytes(&sender_pub)
                .map_err(|_| ClientError::Crypto("invalid sender key".into()))?,
        )
        .map_err(|_| ClientError::Crypto("sender key is not a valid curve point".into()))?;
        let shared = state.identity.key_exchange(peer_kex_pub.as_bytes());
        let key = derive_message_key(&shared, &self.agent_name, &envelope.body.sender);
        let plaintext = decrypt_payload(&key, message_id, &envelope.body.payload)
            .map_err(|e| ClientError::Crypto(e.to_string()))?;
        let payload: serde_json::Value =
            serde_json::from_slice(&plaintext).map_err(|e| ClientError::Validation(e.to_string()))?;

        self.events.emit(ClientEvent::GroupMessage {
            group_id,
            sender: envelope.body.sender,
            message_id,
            timestamp: envelope.body.timestamp,
            payload,
        });
        Ok(Some(()))
    }

    /// Verify and process an incoming `broadcast` envelope. Verification
    /// tries every cached admin public key for
    /// `community`; if none match, the cache is refreshed once from the
    /// relay before giving up.
    async fn receive_broadcast(
        &self,
        community: &str,
        state: &crate::community::CommunityState,
        envelope: Envelope,
    ) -> Result<Option<()>, ClientError> {
        if !self.verify_against_admin_keys(community, state, &envelope).await {
            return Err(ClientError::Crypto("broadcast signature does not match any known admin key".into()));
        }

        let message_id = envelope.body.message_id;
        if !self.dedup.broadcast.lock().record(message_id) {
            return Ok(None);
        }
        let payload = match envelope.body.payload {
            EnvelopePayload::Plain(v) => v,
            EnvelopePayload::Encrypted { .. } => {
                return Err(ClientError::Validation("broadcasts are never encrypted".into()))
            }
        };
        self.events.emit(ClientEvent::Broadcast {
            id: message_id.to_string(),
            kind: "broadcast".into(),
            payload,
        });
        Ok(Some(()))
    }

    async fn verify_against_admin_keys(
        &self,
        community: &str,
        state: &crate::community::CommunityState,
        envelope: &Envelope,
    ) -> bool {
        let matches = |keys: &[String]| {
            keys.iter().any(|k| {
                STANDARD
                    .decode(k)
                    .ok()
                    .and_then(|b| b.try_into().ok())
                    .is_some_and(|pk: [u8; 32]| envelope.verify(&pk).is_ok())
            })
        };

        if matches(&state.admin_keys.read().await) {
            return true;
        }
        let _ = self.community_manager.refresh_admin_keys(community).await;
        matches(&state.admin_keys.read().await)
    }

    fn receive_contact_request(&self, envelope: Envelope) {
        let greeting = match &envelope.body.payload {
            EnvelopePayload::Plain(v) => v
                .get("greeting")
                .and_then(|g| g.as_str())
                .map(|s| s.to_string()),
            _ => None,
        };
        info!(sender = %envelope.body.sender, "incoming contact request");
        self.events.emit(ClientEvent::ContactRequest {
            from: envelope.body.sender,
            greeting,
        });
    }
}
