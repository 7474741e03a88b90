//! Group fan-out: per-member pairwise encryption with
//! concurrency-bounded delivery, backed by a short-TTL member cache.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use cc_crypto::envelope::{derive_message_key, encrypt_payload, Envelope, EnvelopeBody, EnvelopeType, ENVELOPE_VERSION};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use uuid::Uuid;

use crate::community::CommunityManager;
use crate::errors::ClientError;
use crate::member_cache::{GroupMember, GroupMemberCache};
use crate::pipeline::{MessagePipeline, PeerTransport};
use crate::relay_client::RelayTransport;

#[derive(Debug, Clone, serde::Serialize)]
pub struct GroupSendResult {
    pub message_id: Uuid,
    pub delivered: Vec<String>,
    pub queued: Vec<String>,
    pub failed: Vec<String>,
}

pub struct GroupFanout<T: RelayTransport, P: PeerTransport = crate::pipeline::ReqwestPeerTransport> {
    community_manager: Arc<CommunityManager<T>>,
    member_cache: Arc<GroupMemberCache>,
    pipeline: Arc<MessagePipeline<T, P>>,
    concurrency: usize,
    p2p_timeout: Duration,
}

impl<T: RelayTransport, P: PeerTransport> GroupFanout<T, P> {
    pub fn new(
        community_manager: Arc<CommunityManager<T>>,
        member_cache: Arc<GroupMemberCache>,
        pipeline: Arc<MessagePipeline<T, P>>,
        concurrency: usize,
        p2p_timeout: Duration,
    ) -> Self {
        Self {
            community_manager,
            member_cache,
            pipeline,
            concurrency,
            p2p_timeout,
        }
    }

    async fn members(&self, community: &str, group_id: &str) -> Result<Vec<GroupMember>, ClientError> {
        if let Some(cached) = self.member_cache.get_fresh(community, group_id) {
            return Ok(cached);
        }
        let resp = self
            .community_manager
            .call_api(community, "GET", &format!("/groups/{group_id}/members"), None)
            .await?;
        if !resp.is_success() {
            return Err(resp.as_error());
        }
        let members: Vec<GroupMember> =
            serde_json::from_value(resp.body).map_err(|e| ClientError::Validation(e.to_string()))?;
        self.member_cache.put(community, group_id, members.clone());
        Ok(members)
    }

    /// Send `payload` to every member of `group_id`, excluding self. Each
    /// recipient gets an individually ECDH-encrypted envelope sharing one
    /// `messageId` for the batch.
    pub async fn send_to_group(
        &self,
        community: &str,
        group_id: &str,
        self_username: &str,
        payload: serde_json::Value,
    ) -> Result<GroupSendResult, ClientError> {
        let members = self.members(community, group_id).await?;
        let state = self
            .community_manager
            .community(community)
            .ok_or_else(|| ClientError::UnknownCommunity(community.to_string()))?;

        let message_id = Uuid::new_v4();
        let plaintext = serde_json::to_vec(&payload).map_err(|e| ClientError::Validation(e.to_string()))?;

        let mut tasks = FuturesUnordered::new();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.concurrency));

        for member in members.into_iter().filter(|m| m.username != self_username) {
            let state = state.clone();
            let plaintext = plaintext.clone();
            let self_username = self_username.to_string();
            let group_id = group_id.to_string();
            let semaphore = semaphore.clone();
            let pipeline = self.pipeline.clone();
            let timeout = self.p2p_timeout;

            tasks.push(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                let username = member.username.clone();
                let outcome = deliver_to_member(
                    community,
                    &state,
                    &pipeline,
                    &self_username,
                    &group_id,
                    message_id,
                    &member,
                    &plaintext,
                    timeout,
                )
                .await;
                (username, outcome)
            });
        }

        let mut delivered = Vec::new();
        let mut queued = Vec::new();
        let mut failed = Vec::new();
        while let Some((username, outcome)) = tasks.next().await {
            match outcome {
                Ok(MemberOutcome::Delivered) => delivered.push(username),
                Ok(MemberOutcome::Queued) => queued.push(username),
                Ok(MemberOutcome::Failed) | Err(_) => failed.push(username),
            }
        }

        Ok(GroupSendResult {
            message_id,
            delivered,
            queued,
            failed,
        })
    }
}

enum MemberOutcome {
    Delivered,
    Queued,
    Failed,
}

#[allow(clippy::too_many_arguments)]
async fn deliver_to_member<T: RelayTransport, P: PeerTransport>(
    community: &str,
    state: &crate::community::CommunityState,
    pipeline: &MessagePipeline<T, P>,
    self_username: &str,
    group_id: &str,
    message_id: Uuid,
    member: &GroupMember,
    plaintext: &[u8],
    timeout: Duration,
) -> Result<MemberOutcome, ClientError> {
    let sign_pub_bytes = STANDARD
        .decode(&member.public_key)
        .map_err(|_| ClientError::Crypto("invalid member public key".into()))?;
    let sign_pub: [u8; 32] = sign_pub_bytes
        .try_into()
        .map_err(|_| ClientError::Crypto("invalid member public key length".into()))?;
    let peer_kex_pub = cc_crypto::birational::derive_x25519_public(
        &ed25519_dalek::VerifyingKey::from_bytes(&sign_pub)
            .map_err(|_| ClientError::Crypto("invalid member public key".into()))?,
    )
    .map_err(|_| ClientError::Crypto("member key is not a valid curve point".into()))?;

    let shared = state.identity.key_exchange(peer_kex_pub.as_bytes());
    let key = derive_message_key(&shared, self_username, &member.username);
    let encrypted =
        encrypt_payload(&key, message_id, plaintext).map_err(|e| ClientError::Crypto(e.to_string()))?;

    let body = EnvelopeBody {
        version: ENVELOPE_VERSION.to_string(),
        kind: EnvelopeType::Group,
        message_id,
        sender: self_username.to_string(),
        recipient: member.username.clone(),
        timestamp: Utc::now(),
        group_id: Some(group_id.to_string()),
        payload: encrypted,
    };
    let envelope =
        Envelope::sign(body, state.identity.sign_key()).map_err(|e| ClientError::Crypto(e.to_string()))?;

    let contact = state.cache.read().await.get(&member.username).cloned();
    let Some(contact) = contact else {
        return Ok(MemberOutcome::Failed);
    };

    if contact.online {
        match pipeline_post(pipeline, &contact.endpoint, &envelope, timeout).await {
            Ok(status) if (200..300).contains(&status) => return Ok(MemberOutcome::Delivered),
            _ => {}
        }
    }

    match pipeline.retry_queue.enqueue(community.to_string(), member.username.clone(), envelope) {
        Ok(_) => Ok(MemberOutcome::Queued),
        Err(()) => Ok(MemberOutcome::Failed),
    }
}

async fn pipeline_post<T: RelayTransport, P: PeerTransport>(
    pipeline: &MessagePipeline<T, P>,
    endpoint: &str,
    envelope: &Envelope,
    timeout: Duration,
) -> Result<u16, ClientError> {
    pipeline.post_envelope_for_group(endpoint, envelope, timeout).await
}
