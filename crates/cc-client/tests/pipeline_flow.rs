//! End-to-end tests of the message pipeline covering direct send while
//! online, offline-then-queue, and group membership enforcement on
//! receive, exercised through the public `MessagePipeline` API with a
//! scripted peer transport standing in for the real P2P HTTPS delivery.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cc_client::community::CommunityManager;
use cc_client::config::{CommunityConfig, Settings};
use cc_client::contact_cache::ContactEntry;
use cc_client::delivery_report::DeliveryReports;
use cc_client::errors::{ClientError, SendStatus};
use cc_client::events::{ClientEvent, EventBus};
use cc_client::member_cache::GroupMemberCache;
use cc_client::pipeline::{DedupSets, MessagePipeline, PeerTransport};
use cc_client::relay_client::{RelayResponse, RelayTransport};
use cc_client::retry_queue::{RetryQueue, RetryQueueConfig};
use cc_crypto::envelope::Envelope;
use cc_crypto::identity::Identity;

/// A relay transport that is never expected to be called in these tests:
/// contacts and group members are seeded directly into the caches so the
/// pipeline never needs to reach the network.
#[derive(Default)]
struct UnusedRelayTransport;

#[async_trait::async_trait]
impl RelayTransport for UnusedRelayTransport {
    async fn send(
        &self,
        _base_url: &str,
        _method: &str,
        _path: &str,
        _headers: Vec<(String, String)>,
        _body: Option<Vec<u8>>,
        _timeout: Duration,
    ) -> Result<RelayResponse, ClientError> {
        panic!("test seeded caches directly; no relay call should have been necessary")
    }
}

/// Captures the last envelope posted to a peer endpoint and reports a
/// scripted HTTP status, standing in for the real P2P delivery. The
/// `Arc<Mutex<..>>` is shared with the test so the captured envelope can be
/// inspected after `send()` returns without the pipeline exposing its
/// transport.
#[derive(Clone, Default)]
struct CapturingPeerTransport {
    captured: Arc<Mutex<Option<Envelope>>>,
    respond_online: bool,
}

#[async_trait::async_trait]
impl PeerTransport for CapturingPeerTransport {
    async fn post_envelope(
        &self,
        _endpoint: &str,
        envelope: &Envelope,
        _timeout: Duration,
    ) -> Result<u16, ClientError> {
        *self.captured.lock().unwrap() = Some(envelope.clone());
        if self.respond_online {
            Ok(200)
        } else {
            Err(ClientError::Transient("peer unreachable".into()))
        }
    }
}

fn settings_for(agent_name: &str, data_dir: &std::path::Path) -> Settings {
    Settings {
        agent_name: agent_name.to_string(),
        endpoint: format!("https://{agent_name}.example"),
        data_dir: data_dir.to_path_buf(),
        communities: vec![CommunityConfig {
            name: "home".into(),
            primary_api: "https://relay.example".into(),
            failover_api: None,
            key_override_seed_b64: None,
        }],
        default_community: Some("home".into()),
        ..Settings::default()
    }
}

fn contact_for(username: &str, identity: &Identity, endpoint: &str, online: bool) -> ContactEntry {
    use base64::{engine::general_purpose::STANDARD, Engine};
    ContactEntry {
        username: username.to_string(),
        public_key: STANDARD.encode(identity.sign_pub()),
        endpoint: endpoint.to_string(),
        added_at: chrono::Utc::now(),
        online,
        last_seen: Some(chrono::Utc::now()),
        key_updated_at: chrono::Utc::now(),
        recovery_in_progress: false,
    }
}

async fn build_pipeline(
    agent_name: &str,
    identity: Arc<Identity>,
    data_dir: &std::path::Path,
    peer_transport: CapturingPeerTransport,
    member_cache: Arc<GroupMemberCache>,
) -> (
    Arc<CommunityManager<UnusedRelayTransport>>,
    MessagePipeline<UnusedRelayTransport, CapturingPeerTransport>,
    EventBus,
) {
    let events = EventBus::new();
    let settings = settings_for(agent_name, data_dir);
    let manager = Arc::new(
        CommunityManager::with_transport(
            UnusedRelayTransport::default(),
            &settings,
            identity.clone(),
            events.clone(),
        )
        .await,
    );
    let retry_queue = Arc::new(RetryQueue::new(RetryQueueConfig::default(), events.clone()));
    let pipeline = MessagePipeline::with_peer_transport(
        manager.clone(),
        retry_queue,
        Arc::new(DeliveryReports::new(500)),
        Arc::new(DedupSets::new(1000)),
        events.clone(),
        agent_name.to_string(),
        identity,
        member_cache,
        peer_transport,
        Duration::from_secs(5),
        chrono::Duration::hours(1),
    );
    (manager, pipeline, events)
}

#[tokio::test]
async fn s3_direct_send_online_receiver_emits_message_and_dedupes() {
    let alice_identity = Arc::new(Identity::generate());
    let bob_identity = Arc::new(Identity::generate());

    let alice_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();

    let alice_transport = CapturingPeerTransport {
        respond_online: true,
        ..Default::default()
    };
    let captured = alice_transport.captured.clone();
    let (alice_manager, alice_pipeline, _alice_events) = build_pipeline(
        "alice",
        alice_identity.clone(),
        alice_dir.path(),
        alice_transport,
        Arc::new(GroupMemberCache::new(Duration::from_secs(60))),
    )
    .await;
    alice_manager
        .community("home")
        .unwrap()
        .cache
        .write()
        .await
        .replace_all(vec![contact_for(
            "bob",
            &bob_identity,
            "https://bob.example",
            true,
        )]);

    let (bob_manager, bob_pipeline, bob_events) = build_pipeline(
        "bob",
        bob_identity,
        bob_dir.path(),
        CapturingPeerTransport::default(),
        Arc::new(GroupMemberCache::new(Duration::from_secs(60))),
    )
    .await;
    bob_manager
        .community("home")
        .unwrap()
        .cache
        .write()
        .await
        .replace_all(vec![contact_for(
            "alice",
            &alice_identity,
            "https://alice.example",
            true,
        )]);

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    bob_events.subscribe(move |event| {
        if let ClientEvent::Message {
            sender, payload, verified, ..
        } = event
        {
            received2
                .lock()
                .unwrap()
                .push((sender.clone(), payload.clone(), *verified));
        }
    });

    let outcome = alice_pipeline
        .send("bob", serde_json::json!({"text": "hi"}))
        .await
        .unwrap();
    assert_eq!(outcome.status, SendStatus::Delivered);

    let envelope = captured
        .lock()
        .unwrap()
        .clone()
        .expect("send() should have posted an envelope to the peer transport");

    let result = bob_pipeline.receive("home", envelope.clone()).await.unwrap();
    assert!(result.is_some());
    {
        let events = received.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "alice");
        assert_eq!(events[0].1, serde_json::json!({"text": "hi"}));
        assert!(events[0].2);
    }

    // Redelivering the identical envelope is silently dropped by dedup.
    let dup = bob_pipeline.receive("home", envelope).await.unwrap();
    assert!(dup.is_none());
    assert_eq!(received.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn s4_offline_recipient_is_queued_not_delivered() {
    let alice_identity = Arc::new(Identity::generate());
    let bob_identity = Arc::new(Identity::generate());
    let alice_dir = tempfile::tempdir().unwrap();

    let (alice_manager, alice_pipeline, _events) = build_pipeline(
        "alice",
        alice_identity,
        alice_dir.path(),
        CapturingPeerTransport::default(),
        Arc::new(GroupMemberCache::new(Duration::from_secs(60))),
    )
    .await;
    alice_manager
        .community("home")
        .unwrap()
        .cache
        .write()
        .await
        .replace_all(vec![contact_for(
            "bob",
            &bob_identity,
            "https://bob.example",
            false, // offline
        )]);

    let outcome = alice_pipeline
        .send("bob", serde_json::json!({"text": "hi"}))
        .await
        .unwrap();
    assert_eq!(outcome.status, SendStatus::Queued);
}

/// Answers `GET /groups/:id/members` with a fixed roster and panics on any
/// other call, standing in for the relay's membership endpoint consulted by
/// the receive path's membership check.
struct RosterOnlyTransport {
    roster: serde_json::Value,
}

#[async_trait::async_trait]
impl RelayTransport for RosterOnlyTransport {
    async fn send(
        &self,
        _base_url: &str,
        method: &str,
        path: &str,
        _headers: Vec<(String, String)>,
        _body: Option<Vec<u8>>,
        _timeout: Duration,
    ) -> Result<RelayResponse, ClientError> {
        assert_eq!(method, "GET");
        assert!(path.ends_with("/members"), "unexpected relay call to {path}");
        Ok(RelayResponse {
            status: 200,
            rate_limit_remaining: None,
            rate_limit_reset: None,
            body: self.roster.clone(),
        })
    }
}

#[tokio::test]
async fn group_receive_rejects_sender_not_in_member_cache() {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let alice_identity = Arc::new(Identity::generate());
    let carol_identity = Arc::new(Identity::generate());
    let bob_identity = Arc::new(Identity::generate());
    let bob_dir = tempfile::tempdir().unwrap();

    // Only alice is a known member of "team"; carol is not, even after the
    // membership check refreshes from the relay.
    let roster = serde_json::json!([{
        "username": "alice",
        "public_key": STANDARD.encode(alice_identity.sign_pub()),
    }]);

    let events = EventBus::new();
    let settings = settings_for("bob", bob_dir.path());
    let manager = Arc::new(
        CommunityManager::with_transport(
            RosterOnlyTransport { roster },
            &settings,
            bob_identity.clone(),
            events.clone(),
        )
        .await,
    );
    let retry_queue = Arc::new(RetryQueue::new(RetryQueueConfig::default(), events.clone()));
    let bob_pipeline = MessagePipeline::with_peer_transport(
        manager,
        retry_queue,
        Arc::new(DeliveryReports::new(500)),
        Arc::new(DedupSets::new(1000)),
        events,
        "bob".to_string(),
        bob_identity,
        Arc::new(GroupMemberCache::new(Duration::from_secs(60))),
        CapturingPeerTransport::default(),
        Duration::from_secs(5),
        chrono::Duration::hours(1),
    );

    let envelope = build_signed_group_envelope(&carol_identity, "carol", "bob", "team", b"{}");
    let result = bob_pipeline.receive("home", envelope).await;
    assert!(matches!(result, Err(ClientError::NotFound(_))));
}

fn build_signed_group_envelope(
    sender_identity: &Identity,
    sender: &str,
    recipient: &str,
    group_id: &str,
    plaintext: &[u8],
) -> Envelope {
    use cc_crypto::envelope::{
        derive_message_key, encrypt_payload, EnvelopeBody, EnvelopeType, ENVELOPE_VERSION,
    };

    // The plaintext content does not matter here since membership is
    // rejected before decryption is attempted; any valid AEAD payload under
    // an arbitrary key will do.
    let key = derive_message_key(&[0u8; 32], sender, recipient);
    let message_id = uuid::Uuid::new_v4();
    let payload = encrypt_payload(&key, message_id, plaintext).unwrap();
    let body = EnvelopeBody {
        version: ENVELOPE_VERSION.to_string(),
        kind: EnvelopeType::Group,
        message_id,
        sender: sender.to_string(),
        recipient: recipient.to_string(),
        timestamp: chrono::Utc::now(),
        group_id: Some(group_id.to_string()),
        payload,
    };
    Envelope::sign(body, sender_identity.sign_key()).unwrap()
}
