//! Relay HTTP API: registry, contacts, presence, email
//! verification, admin broadcast/revocation, key rotation/recovery, groups,
//! health, and the legacy-migration shim.
//!
//! Handlers are thin: parse, authenticate, delegate to [`SqliteStore`], shape
//! the response. Cross-cutting request shaping (signature auth, rate limits)
//! lives in [`authed`]/[`admin_authed`] so individual handlers read as plain
//! business logic.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use cc_crypto::hash::sha256_hex;
use cc_crypto::identity::{verify_signature, PublicKeyBundle};

use crate::auth::{self, AuthContext};
use crate::config::RelaySettings;
use crate::errors::RelayError;
use crate::metrics::RelayMetrics;
use crate::rate_limit::RelayRateLimiter;
use crate::store::{GroupSettings, SqliteStore};

/// Dispatches verification codes for email and key-recovery flows. The relay
/// only ever needs to hand a code to *something*; who actually emails it is
/// the host application's concern, wired in as an external email-sender
/// interface.
#[async_trait::async_trait]
pub trait CodeSender: Send + Sync {
    async fn send_code(&self, email: &str, code: &str);
}

/// Default sender: logs the dispatch and drops the code. A real deployment
/// wires in an SMTP/API-backed sender via [`AppState::code_sender`].
pub struct LoggingCodeSender;

#[async_trait::async_trait]
impl CodeSender for LoggingCodeSender {
    async fn send_code(&self, email: &str, _code: &str) {
        tracing::info!(email, "verification code dispatched (sender not configured)");
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: SqliteStore,
    pub limiter: Arc<RelayRateLimiter>,
    pub metrics: Arc<RelayMetrics>,
    pub settings: Arc<RelaySettings>,
    pub code_sender: Arc<dyn CodeSender>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .route("/registry/agents", post(create_agent).get(list_agents))
        .route("/registry/agents/:name", get(get_agent))
        .route("/registry/agents/:name/approve", post(approve_agent))
        .route("/registry/agents/:name/revoke", post(revoke_agent))
        .route("/contacts/request", post(request_contact))
        .route("/contacts/pending", get(list_pending_contacts))
        .route("/contacts/:agent/accept", post(accept_contact))
        .route("/contacts/:agent/deny", post(deny_contact))
        .route("/contacts/:agent", delete(remove_contact))
        .route("/contacts", get(list_contacts))
        .route("/presence", axum::routing::put(put_presence))
        .route("/presence/:agent", get(get_presence))
        .route("/presence/batch", get(get_presence_batch))
        .route("/verify/send", post(verify_send))
        .route("/verify/confirm", post(verify_confirm))
        .route("/admin/broadcast", post(create_broadcast))
        .route("/admin/broadcasts", get(list_broadcasts))
        .route("/admin/pending", get(list_pending_agents))
        .route("/admin/keys", get(list_admin_keys))
        .route("/keys/rotate", post(rotate_key))
        .route("/keys/recover", post(recover_key))
        .route("/groups", post(create_group).get(list_groups))
        .route("/groups/:id", get(get_group).delete(dissolve_group))
        .route("/groups/:id/invite", post(invite_to_group))
        .route("/groups/:id/members", get(list_members))
        .route("/groups/:id/members/:agent", delete(remove_member))
        .route("/groups/:id/leave", post(leave_group))
        .route("/groups/:id/transfer", post(transfer_ownership))
        .route("/groups/:id/changes", get(list_changes))
        .route("/groups/invitations", get(list_invitations))
        .route("/groups/:id/invitations/accept", post(accept_invitation))
        .route("/groups/:id/invitations/decline", post(decline_invitation))
        .route("/relay/send", post(legacy_send))
        .route("/relay/inbox/:agent", get(legacy_inbox))
        .route("/relay/inbox/:agent/ack", post(legacy_ack))
        .with_state(state)
}

// ---- auth helpers ----------------------------------------------------------

/// Verifies the signed-request headers and applies the per-agent rate cap
///. Every handler that requires an authenticated caller starts
/// here.
async fn authed(state: &AppState, headers: &HeaderMap, method: &Method, uri: &Uri, body: &[u8]) -> Result<AuthContext, RelayError> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or_else(|| uri.path());
    let ctx = auth::authenticate(&state.store, headers, method, path, body)?;
    state.limiter.check_authenticated(&ctx.agent)?;
    Ok(ctx)
}

/// Like [`authed`], additionally confirming the caller is a registered admin
/// and returning its admin signing key.
async fn admin_authed(state: &AppState, headers: &HeaderMap, method: &Method, uri: &Uri, body: &[u8]) -> Result<(AuthContext, String), RelayError> {
    let ctx = authed(state, headers, method, uri, body).await?;
    let admin_key = auth::require_admin(&state.store, &ctx)?;
    Ok((ctx, admin_key))
}

fn decode_pub_key(b64: &str) -> Result<[u8; 32], RelayError> {
    let bytes = STANDARD
        .decode(b64)
        .map_err(|_| RelayError::Validation("public key is not valid base64".into()))?;
    bytes
        .try_into()
        .map_err(|_| RelayError::Validation("public key must be 32 bytes".into()))
}

fn decode_sig(b64: &str) -> Result<[u8; 64], RelayError> {
    let bytes = STANDARD
        .decode(b64)
        .map_err(|_| RelayError::Validation("signature is not valid base64".into()))?;
    bytes
        .try_into()
        .map_err(|_| RelayError::Validation("signature must be 64 bytes".into()))
}

static USERNAME_RE: once_cell::sync::Lazy<regex::Regex> =
    once_cell::sync::Lazy::new(|| regex::Regex::new(r"^[a-z0-9][a-z0-9_-]{0,31}$").unwrap());

fn validate_username(name: &str) -> Result<(), RelayError> {
    if !USERNAME_RE.is_match(name) {
        return Err(RelayError::Validation(format!("invalid agent name {name}")));
    }
    Ok(())
}

fn validate_greeting(greeting: &Option<String>) -> Result<(), RelayError> {
    if let Some(g) = greeting {
        if g.chars().count() > 500 {
            return Err(RelayError::Validation("greeting exceeds 500 characters".into()));
        }
    }
    Ok(())
}

fn random_code() -> String {
    let mut rng = rand::thread_rng();
    format!("{:06}", rng.gen_range(0..1_000_000))
}

// ---- health / metrics -------------------------------------------------------

async fn get_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.export_prometheus()
}

// ---- registry ---------------------------------------------------------------

#[derive(Deserialize)]
struct CreateAgentReq {
    name: String,
    public_key: String,
    owner_email: String,
    endpoint: String,
}

async fn create_agent(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<CreateAgentReq>,
) -> Result<impl IntoResponse, RelayError> {
    state.limiter.check_registration(&addr.ip().to_string())?;
    validate_username(&req.name)?;

    let verified = state
        .store
        .get_email_verification(&req.name)?
        .map(|v| v.verified)
        .unwrap_or(false);
    if !verified {
        return Err(RelayError::Validation("email not verified for this agent name".into()));
    }
    if state.store.get_agent(&req.name)?.is_some() {
        return Err(RelayError::Conflict(format!("{} is already registered", req.name)));
    }

    let agent = state
        .store
        .create_agent(&req.name, &req.public_key, &req.owner_email, &req.endpoint)?;
    state.metrics.agents_total.inc();
    Ok((StatusCode::CREATED, Json(agent)))
}

async fn list_agents(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
) -> Result<impl IntoResponse, RelayError> {
    authed(&state, &headers, &method, &uri, b"").await?;
    Ok(Json(state.store.list_agents()?))
}

async fn get_agent(State(state): State<AppState>, Path(name): Path<String>) -> Result<impl IntoResponse, RelayError> {
    let agent = state.store.get_agent(&name)?.ok_or_else(|| RelayError::NotFound(name.clone()))?;
    Ok(Json(agent))
}

async fn approve_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    let (ctx, _) = admin_authed(&state, &headers, &method, &uri, b"").await?;
    let agent = state.store.approve_agent(&name, &ctx.agent)?;
    Ok(Json(agent))
}

#[derive(Deserialize)]
struct RevokeReq {
    signature: String,
    timestamp: DateTime<Utc>,
}

/// Marks `name` revoked and, on the first such transition, emits a
/// `revocation` broadcast whose payload the admin must have pre-signed. The
/// admin picks `timestamp` and signs the exact canonical payload below
/// before calling this endpoint, since the relay cannot sign on an admin's
/// behalf.
async fn revoke_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Path(name): Path<String>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, RelayError> {
    let (ctx, admin_key_b64) = admin_authed(&state, &headers, &method, &uri, &body).await?;
    let req: RevokeReq = serde_json::from_slice(&body).map_err(|e| RelayError::Validation(e.to_string()))?;

    let payload = format!(
        r#"{{"revokedAgent":"{}","timestamp":"{}"}}"#,
        name,
        req.timestamp.to_rfc3339()
    );
    let admin_pub = decode_pub_key(&admin_key_b64)?;
    let sig = decode_sig(&req.signature)?;
    verify_signature(&admin_pub, payload.as_bytes(), &sig)
        .map_err(|_| RelayError::Auth("revocation signature does not match admin key".into()))?;

    let transitioned = state.store.revoke_agent(&name)?;
    if transitioned {
        let id = uuid::Uuid::new_v4().to_string();
        state
            .store
            .create_broadcast(&id, "revocation", &payload, &ctx.agent, &req.signature)?;
        state.metrics.revocations_total.inc();
        state.metrics.broadcasts_total.inc();
    }
    Ok(Json(json!({"agent": name, "revoked": true})))
}

// ---- contacts ----------------------------------------------------------------

#[derive(Deserialize)]
struct ContactRequestReq {
    to: String,
    greeting: Option<String>,
}

async fn request_contact(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, &body).await?;
    let req: ContactRequestReq = serde_json::from_slice(&body).map_err(|e| RelayError::Validation(e.to_string()))?;

    if ctx.agent == req.to {
        return Err(RelayError::Validation("cannot request a contact with yourself".into()));
    }
    validate_greeting(&req.greeting)?;
    let target = state
        .store
        .get_agent(&req.to)?
        .ok_or_else(|| RelayError::NotFound(req.to.clone()))?;
    if target.status != crate::store::AgentStatus::Active {
        return Err(RelayError::NotFound(req.to.clone()));
    }
    if let Some(existing) = state.store.get_contact_pair(&ctx.agent, &req.to)? {
        if matches!(existing.status, crate::store::ContactStatus::Active | crate::store::ContactStatus::Pending) {
            return Err(RelayError::Conflict("a contact request already exists".into()));
        }
    }
    state.limiter.check_contact_request(&ctx.agent)?;

    state.store.request_contact(&ctx.agent, &req.to, req.greeting.as_deref())?;
    Ok(StatusCode::CREATED)
}

async fn list_pending_contacts(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, b"").await?;
    let pending: Vec<Value> = state
        .store
        .list_pending_contacts(&ctx.agent)?
        .into_iter()
        .map(|p| json!({"from": p.requested_by, "greeting": p.greeting, "createdAt": p.created_at}))
        .collect();
    Ok(Json(pending))
}

async fn accept_contact(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Path(other): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, b"").await?;
    state.store.accept_contact(&ctx.agent, &other)?;
    state.metrics.contacts_total.inc();
    Ok(StatusCode::OK)
}

async fn deny_contact(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Path(other): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, b"").await?;
    state.store.deny_contact(&ctx.agent, &other)?;
    Ok(StatusCode::OK)
}

async fn remove_contact(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Path(other): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, b"").await?;
    state.store.remove_contact(&ctx.agent, &other)?;
    Ok(StatusCode::OK)
}

/// Shape matches `cc_client::contact_cache::ContactEntry` field-for-field so
/// the client can deserialize the response directly.
#[derive(Serialize)]
struct ContactEntryWire {
    username: String,
    public_key: String,
    endpoint: String,
    added_at: DateTime<Utc>,
    online: bool,
    last_seen: Option<DateTime<Utc>>,
    key_updated_at: DateTime<Utc>,
    recovery_in_progress: bool,
}

async fn list_contacts(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, b"").await?;
    let views = state.store.list_contacts(&ctx.agent, state.settings.presence_stale_after())?;
    let wire: Vec<ContactEntryWire> = views
        .into_iter()
        .map(|v| ContactEntryWire {
            username: v.agent,
            public_key: v.public_key,
            endpoint: v.endpoint,
            added_at: v.since,
            online: v.online,
            last_seen: v.last_seen,
            key_updated_at: v.key_updated_at,
            recovery_in_progress: false,
        })
        .collect();
    Ok(Json(wire))
}

// ---- presence -----------------------------------------------------------------

#[derive(Deserialize)]
struct PresenceReq {
    endpoint: String,
}

async fn put_presence(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, &body).await?;
    let req: PresenceReq = serde_json::from_slice(&body).map_err(|e| RelayError::Validation(e.to_string()))?;
    state.store.touch_presence(&ctx.agent, &req.endpoint)?;
    Ok(StatusCode::OK)
}

fn presence_json(state: &AppState, agent: &crate::store::Agent) -> Value {
    let online = agent
        .last_seen
        .map(|seen| Utc::now() - seen <= state.settings.presence_stale_after())
        .unwrap_or(false);
    json!({"agent": agent.name, "online": online, "lastSeen": agent.last_seen})
}

async fn get_presence(State(state): State<AppState>, Path(name): Path<String>) -> Result<impl IntoResponse, RelayError> {
    let agent = state.store.get_agent(&name)?.ok_or_else(|| RelayError::NotFound(name.clone()))?;
    Ok(Json(presence_json(&state, &agent)))
}

#[derive(Deserialize)]
struct BatchQuery {
    agents: String,
}

async fn get_presence_batch(
    State(state): State<AppState>,
    Query(q): Query<BatchQuery>,
) -> Result<impl IntoResponse, RelayError> {
    let mut out = Vec::new();
    for name in q.agents.split(',').filter(|s| !s.is_empty()) {
        if let Some(agent) = state.store.get_agent(name)? {
            out.push(presence_json(&state, &agent));
        }
    }
    Ok(Json(out))
}

// ---- email verification --------------------------------------------------------

#[derive(Deserialize)]
struct VerifySendReq {
    username: String,
    email: String,
}

async fn verify_send(
    State(state): State<AppState>,
    Json(req): Json<VerifySendReq>,
) -> Result<impl IntoResponse, RelayError> {
    validate_username(&req.username)?;
    let code = random_code();
    let hash = sha256_hex(code.as_bytes());
    state
        .store
        .start_email_verification(&req.username, &req.email, &hash, Utc::now() + chrono::Duration::minutes(10))?;
    state.code_sender.send_code(&req.email, &code).await;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
struct VerifyConfirmReq {
    username: String,
    code: String,
}

async fn verify_confirm(
    State(state): State<AppState>,
    Json(req): Json<VerifyConfirmReq>,
) -> Result<impl IntoResponse, RelayError> {
    let hash = sha256_hex(req.code.as_bytes());
    let ok = state.store.confirm_email_code(&req.username, &hash)?;
    if !ok {
        return Err(RelayError::Validation("verification code invalid or expired".into()));
    }
    Ok(Json(json!({"verified": true})))
}

// ---- admin broadcasts -----------------------------------------------------------

const BROADCAST_TYPES: &[&str] = &["security-alert", "maintenance", "update", "announcement"];

#[derive(Deserialize)]
struct BroadcastReq {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "payloadJson")]
    payload_json: String,
    signature: String,
}

async fn create_broadcast(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, RelayError> {
    let (ctx, admin_key_b64) = admin_authed(&state, &headers, &method, &uri, &body).await?;
    let req: BroadcastReq = serde_json::from_slice(&body).map_err(|e| RelayError::Validation(e.to_string()))?;

    if !BROADCAST_TYPES.contains(&req.kind.as_str()) {
        return Err(RelayError::Validation(format!("unknown broadcast type {}", req.kind)));
    }
    let admin_pub = decode_pub_key(&admin_key_b64)?;
    let sig = decode_sig(&req.signature)?;
    verify_signature(&admin_pub, req.payload_json.as_bytes(), &sig)
        .map_err(|_| RelayError::Auth("broadcast signature does not match admin key".into()))?;

    let id = uuid::Uuid::new_v4().to_string();
    let broadcast = state
        .store
        .create_broadcast(&id, &req.kind, &req.payload_json, &ctx.agent, &req.signature)?;
    state.metrics.broadcasts_total.inc();
    Ok((StatusCode::CREATED, Json(broadcast)))
}

async fn list_broadcasts(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
) -> Result<impl IntoResponse, RelayError> {
    authed(&state, &headers, &method, &uri, b"").await?;
    Ok(Json(state.store.list_broadcasts()?))
}

async fn list_pending_agents(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
) -> Result<impl IntoResponse, RelayError> {
    admin_authed(&state, &headers, &method, &uri, b"").await?;
    Ok(Json(state.store.list_pending_agents()?))
}

async fn list_admin_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
) -> Result<impl IntoResponse, RelayError> {
    authed(&state, &headers, &method, &uri, b"").await?;
    Ok(Json(state.store.list_admin_keys()?))
}

// ---- keys -----------------------------------------------------------------------

#[derive(Deserialize)]
struct RotateKeyReq {
    #[serde(rename = "newPublicKey")]
    new_public_key: PublicKeyBundle,
}

async fn rotate_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, &body).await?;
    let req: RotateKeyReq = serde_json::from_slice(&body).map_err(|e| RelayError::Validation(e.to_string()))?;
    state.store.update_key(&ctx.agent, &req.new_public_key.sign_pub)?;
    Ok(StatusCode::OK)
}

/// Three-phase, email-verified recovery collapsed onto the
/// single listed `/keys/recover` endpoint via an `action` discriminant, since
/// a lost key means the caller cannot sign a request to disambiguate by verb.
#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum RecoverKeyReq {
    Start {
        username: String,
        email: String,
        #[serde(rename = "newPublicKey")]
        new_public_key: PublicKeyBundle,
    },
    Confirm { username: String, code: String },
    Complete { username: String },
}

async fn recover_key(
    State(state): State<AppState>,
    Json(req): Json<RecoverKeyReq>,
) -> Result<impl IntoResponse, RelayError> {
    match req {
        RecoverKeyReq::Start { username, email, new_public_key } => {
            validate_username(&username)?;
            let code = random_code();
            let hash = sha256_hex(code.as_bytes());
            state.store.start_key_recovery(&username, &email, &new_public_key.sign_pub, &hash)?;
            state.code_sender.send_code(&email, &code).await;
            Ok((StatusCode::ACCEPTED, Json(json!({"stage": "started"}))))
        }
        RecoverKeyReq::Confirm { username, code } => {
            let hash = sha256_hex(code.as_bytes());
            let ok = state.store.confirm_key_recovery_code(&username, &hash)?;
            if !ok {
                return Err(RelayError::Validation("recovery code invalid or expired".into()));
            }
            Ok((StatusCode::OK, Json(json!({"stage": "confirmed"}))))
        }
        RecoverKeyReq::Complete { username } => {
            state.store.complete_key_recovery(&username, chrono::Duration::hours(1))?;
            Ok((StatusCode::OK, Json(json!({"stage": "completed"}))))
        }
    }
}

// ---- groups -----------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateGroupReq {
    name: String,
    #[serde(default)]
    settings: GroupSettings,
}

async fn create_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, &body).await?;
    let req: CreateGroupReq = serde_json::from_slice(&body).map_err(|e| RelayError::Validation(e.to_string()))?;
    if req.settings.max_members == 0 || req.settings.max_members > 50 {
        return Err(RelayError::Validation("max_members must be between 1 and 50".into()));
    }
    let group_id = uuid::Uuid::new_v4().to_string();
    let group = state.store.create_group(&group_id, &req.name, &ctx.agent, &req.settings)?;
    state.metrics.groups_total.inc();
    Ok((StatusCode::CREATED, Json(group)))
}

async fn list_groups(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, b"").await?;
    Ok(Json(state.store.list_groups_for_agent(&ctx.agent)?))
}

async fn require_membership(state: &AppState, group_id: &str, agent: &str) -> Result<crate::store::GroupMembership, RelayError> {
    state
        .store
        .get_membership(group_id, agent)?
        .ok_or_else(|| RelayError::Forbidden(format!("{agent} is not a member of {group_id}")))
}

async fn get_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Path(group_id): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, b"").await?;
    require_membership(&state, &group_id, &ctx.agent).await?;
    let group = state.store.get_group(&group_id)?.ok_or_else(|| RelayError::NotFound(group_id.clone()))?;
    Ok(Json(group))
}

async fn dissolve_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Path(group_id): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, b"").await?;
    let group = state.store.get_group(&group_id)?.ok_or_else(|| RelayError::NotFound(group_id.clone()))?;
    if group.owner != ctx.agent {
        return Err(RelayError::Forbidden("only the owner may dissolve the group".into()));
    }
    state.store.dissolve_group(&group_id)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct GroupInviteReq {
    invitee: String,
    greeting: Option<String>,
}

async fn invite_to_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Path(group_id): Path<String>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, &body).await?;
    let req: GroupInviteReq = serde_json::from_slice(&body).map_err(|e| RelayError::Validation(e.to_string()))?;
    validate_greeting(&req.greeting)?;

    let membership = require_membership(&state, &group_id, &ctx.agent).await?;
    let group = state.store.get_group(&group_id)?.ok_or_else(|| RelayError::NotFound(group_id.clone()))?;
    if membership.role == crate::store::GroupRole::Member && !group.settings.members_can_invite {
        return Err(RelayError::Forbidden("members may not invite in this group".into()));
    }
    if state.store.get_membership(&group_id, &req.invitee)?.is_some() {
        return Err(RelayError::Conflict(format!("{} is already a member", req.invitee)));
    }
    if state.store.member_count(&group_id)? >= group.settings.max_members {
        return Err(RelayError::Conflict("group is at capacity".into()));
    }

    state.store.invite_to_group(&group_id, &req.invitee, &ctx.agent, req.greeting.as_deref())?;
    Ok(StatusCode::CREATED)
}

/// Shape matches `cc_client::member_cache::GroupMember` field-for-field.
#[derive(Serialize)]
struct GroupMemberWire {
    username: String,
    public_key: String,
}

async fn list_members(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Path(group_id): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, b"").await?;
    require_membership(&state, &group_id, &ctx.agent).await?;

    let mut out = Vec::new();
    for m in state.store.list_members(&group_id)? {
        if let Some(agent) = state.store.get_agent(&m.agent)? {
            out.push(GroupMemberWire { username: agent.name, public_key: agent.public_key });
        }
    }
    Ok(Json(out))
}

async fn remove_member(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Path((group_id, agent)): Path<(String, String)>,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, b"").await?;
    let membership = require_membership(&state, &group_id, &ctx.agent).await?;
    let group = state.store.get_group(&group_id)?.ok_or_else(|| RelayError::NotFound(group_id.clone()))?;
    if !matches!(membership.role, crate::store::GroupRole::Owner | crate::store::GroupRole::Admin) {
        return Err(RelayError::Forbidden("only an owner or admin may remove members".into()));
    }
    if group.owner == agent {
        return Err(RelayError::Validation("the owner cannot be removed; transfer ownership first".into()));
    }
    state.store.remove_member(&group_id, &agent)?;
    Ok(StatusCode::OK)
}

async fn leave_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Path(group_id): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, b"").await?;
    let group = state.store.get_group(&group_id)?.ok_or_else(|| RelayError::NotFound(group_id.clone()))?;
    if group.owner == ctx.agent {
        return Err(RelayError::Validation("the owner must transfer ownership before leaving".into()));
    }
    state.store.remove_member(&group_id, &ctx.agent)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct TransferReq {
    to: String,
}

async fn transfer_ownership(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Path(group_id): Path<String>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, &body).await?;
    let req: TransferReq = serde_json::from_slice(&body).map_err(|e| RelayError::Validation(e.to_string()))?;
    let group = state.store.get_group(&group_id)?.ok_or_else(|| RelayError::NotFound(group_id.clone()))?;
    if group.owner != ctx.agent {
        return Err(RelayError::Forbidden("only the current owner may transfer ownership".into()));
    }
    state.store.transfer_ownership(&group_id, &ctx.agent, &req.to)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct ChangesQuery {
    since: Option<DateTime<Utc>>,
}

async fn list_changes(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Path(group_id): Path<String>,
    Query(q): Query<ChangesQuery>,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, b"").await?;
    require_membership(&state, &group_id, &ctx.agent).await?;
    let since = q.since.unwrap_or_else(|| DateTime::<Utc>::MIN_UTC);
    let changes = state.store.list_changes_since(&group_id, since)?;
    let wire: Vec<Value> = changes
        .into_iter()
        .map(|(change_type, agent, at)| json!({"changeType": change_type, "agent": agent, "at": at}))
        .collect();
    Ok(Json(wire))
}

async fn list_invitations(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, b"").await?;
    Ok(Json(state.store.list_invitations(&ctx.agent)?))
}

async fn accept_invitation(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Path(group_id): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, b"").await?;
    let group = state.store.get_group(&group_id)?.ok_or_else(|| RelayError::NotFound(group_id.clone()))?;
    if state.store.member_count(&group_id)? >= group.settings.max_members {
        return Err(RelayError::Conflict("group is at capacity".into()));
    }
    state.store.accept_invitation(&group_id, &ctx.agent)?;
    Ok(StatusCode::OK)
}

async fn decline_invitation(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    Path(group_id): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    let ctx = authed(&state, &headers, &method, &uri, b"").await?;
    state.store.decline_invitation(&group_id, &ctx.agent)?;
    Ok(StatusCode::OK)
}

// ---- legacy migration shim --------------------------------------------

fn legacy_gate(settings: &RelaySettings) -> Option<RelayError> {
    if Utc::now() > settings.legacy_cutoff {
        Some(RelayError::Gone("legacy relay-mediated endpoints are no longer available".into()))
    } else {
        None
    }
}

fn with_deprecation_header(mut response: axum::response::Response) -> axum::response::Response {
    response
        .headers_mut()
        .insert("Deprecation", "true".parse().expect("static header value"));
    response
}

async fn legacy_send(State(state): State<AppState>) -> axum::response::Response {
    if let Some(err) = legacy_gate(&state.settings) {
        return err.into_response();
    }
    tracing::warn!("legacy /relay/send invoked; message delivery is now peer-to-peer only");
    with_deprecation_header(
        (StatusCode::OK, Json(json!({"error": "relay-mediated send is deprecated; deliver peer-to-peer"}))).into_response(),
    )
}

async fn legacy_inbox(State(state): State<AppState>, Path(_agent): Path<String>) -> axum::response::Response {
    if let Some(err) = legacy_gate(&state.settings) {
        return err.into_response();
    }
    tracing::warn!("legacy /relay/inbox invoked; the relay never stores message content");
    with_deprecation_header((StatusCode::OK, Json(json!([]))).into_response())
}

async fn legacy_ack(State(state): State<AppState>, Path(_agent): Path<String>) -> axum::response::Response {
    if let Some(err) = legacy_gate(&state.settings) {
        return err.into_response();
    }
    with_deprecation_header((StatusCode::OK, Json(json!({"ok": true}))).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use cc_crypto::identity::Identity;
    use tower::ServiceExt;

    fn test_state() -> (AppState, Identity) {
        let store = SqliteStore::open_in_memory().unwrap();
        let identity = Identity::generate();
        let pk = STANDARD.encode(identity.sign_pub());
        store.create_agent("alice", &pk, "a@example.com", "https://alice.example").unwrap();
        store.approve_agent("alice", "bootstrap").unwrap();
        let state = AppState {
            store,
            limiter: Arc::new(RelayRateLimiter::new(crate::rate_limit::RateLimitConfig::default())),
            metrics: Arc::new(RelayMetrics::new().unwrap()),
            settings: Arc::new(RelaySettings::default()),
            code_sender: Arc::new(LoggingCodeSender),
        };
        (state, identity)
    }

    fn signed_request(identity: &Identity, agent: &str, method: &str, path: &str, body: &str) -> Request<Body> {
        let timestamp = Utc::now().to_rfc3339();
        let message = format!("{} {}\n{}\n{}", method, path, timestamp, sha256_hex(body.as_bytes()));
        let sig = identity.sign(message.as_bytes());
        Request::builder()
            .method(method)
            .uri(path)
            .header("Authorization", format!("Signature {}:{}", agent, STANDARD.encode(sig)))
            .header("X-Timestamp", timestamp)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_unauthenticated() {
        let (state, _) = test_state();
        let app = router(state);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_contacts_requires_signature() {
        let (state, _) = test_state();
        let app = router(state);
        let resp = app
            .oneshot(Request::builder().uri("/contacts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn list_contacts_returns_client_compatible_shape() {
        let (state, identity) = test_state();
        let app = router(state);
        let req = signed_request(&identity, "alice", "GET", "/contacts", "");
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.is_array());
    }

    #[tokio::test]
    async fn legacy_endpoint_gone_after_cutoff() {
        let (mut state, identity) = test_state();
        state.settings = Arc::new(RelaySettings {
            legacy_cutoff: Utc::now() - chrono::Duration::days(1),
            ..RelaySettings::default()
        });
        let app = router(state);
        let req = signed_request(&identity, "alice", "POST", "/relay/send", "{}");
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn contact_request_to_unknown_agent_is_not_found() {
        let (state, identity) = test_state();
        let app = router(state);
        let body = r#"{"to":"ghost","greeting":"hi"}"#;
        let req = signed_request(&identity, "alice", "POST", "/contacts/request", body);
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
