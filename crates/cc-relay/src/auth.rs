//! Request authentication: `Authorization: Signature <agent>:<sig>`
//! plus `X-Timestamp`, verified against the agent's stored Ed25519 public key.

use axum::http::{HeaderMap, Method};
use base64::{engine::general_purpose::STANDARD, Engine};
use cc_crypto::hash::sha256_hex;
use cc_crypto::identity::verify_signature;
use chrono::{DateTime, Utc};

use crate::errors::RelayError;
use crate::store::{AgentStatus, SqliteStore};

pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// The agent that a signed request authenticated as.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub agent: String,
}

fn signing_string(method: &Method, path: &str, timestamp: &str, body: &[u8]) -> String {
    format!("{} {}\n{}\n{}", method, path, timestamp, sha256_hex(body))
}

/// Verifies the signed-request headers against `store`, returning the
/// authenticated agent name. Does not check admin status; callers that need
/// admin privileges call [`require_admin`] afterward.
pub fn authenticate(
    store: &SqliteStore,
    headers: &HeaderMap,
    method: &Method,
    path: &str,
    body: &[u8],
) -> Result<AuthContext, RelayError> {
    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RelayError::Auth("missing Authorization header".into()))?;

    let sig_part = auth_header
        .strip_prefix("Signature ")
        .ok_or_else(|| RelayError::Auth("unsupported authorization scheme".into()))?;
    let (agent, sig_b64) = sig_part
        .split_once(':')
        .ok_or_else(|| RelayError::Auth("malformed signature header".into()))?;

    let timestamp_header = headers
        .get("X-Timestamp")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RelayError::Auth("missing X-Timestamp header".into()))?;
    let timestamp: DateTime<Utc> = timestamp_header
        .parse()
        .map_err(|_| RelayError::Auth("unparsable X-Timestamp".into()))?;
    let skew = (Utc::now() - timestamp).num_seconds().abs();
    if skew > MAX_CLOCK_SKEW_SECS {
        return Err(RelayError::Auth("timestamp outside allowed clock skew".into()));
    }

    let record = store
        .get_agent(agent)?
        .ok_or_else(|| RelayError::NotFound(format!("unknown agent {agent}")))?;
    if record.status != AgentStatus::Active {
        return Err(RelayError::Forbidden(format!("{agent} is not active")));
    }

    let pub_key_bytes = STANDARD
        .decode(&record.public_key)
        .map_err(|_| RelayError::Internal("corrupt stored public key".into()))?;
    let pub_key: [u8; 32] = pub_key_bytes
        .try_into()
        .map_err(|_| RelayError::Internal("corrupt stored public key length".into()))?;

    let sig_bytes = STANDARD
        .decode(sig_b64)
        .map_err(|_| RelayError::Auth("signature is not valid base64".into()))?;
    let sig: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| RelayError::Auth("signature has the wrong length".into()))?;

    let message = signing_string(method, path, timestamp_header, body);
    verify_signature(&pub_key, message.as_bytes(), &sig)
        .map_err(|_| RelayError::Auth("signature verification failed".into()))?;

    Ok(AuthContext { agent: agent.to_string() })
}

/// Confirms `ctx.agent` is a registered relay admin, returning its admin
/// signing key for callers that additionally verify a broadcast body.
pub fn require_admin(store: &SqliteStore, ctx: &AuthContext) -> Result<String, RelayError> {
    store
        .get_admin_key(&ctx.agent)?
        .ok_or_else(|| RelayError::Forbidden(format!("{} is not an admin", ctx.agent)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cc_crypto::identity::Identity;

    fn signed_headers(identity: &Identity, method: &Method, path: &str, body: &[u8], agent: &str) -> HeaderMap {
        let timestamp = Utc::now().to_rfc3339();
        let message = signing_string(method, path, &timestamp, body);
        let sig = identity.sign(message.as_bytes());
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Signature {}:{}", agent, STANDARD.encode(sig)).parse().unwrap(),
        );
        headers.insert("X-Timestamp", timestamp.parse().unwrap());
        headers
    }

    #[test]
    fn valid_signature_authenticates() {
        let store = SqliteStore::open_in_memory().unwrap();
        let identity = Identity::generate();
        let pk = STANDARD.encode(identity.sign_pub());
        store.create_agent("alice", &pk, "a@example.com", "https://alice.example").unwrap();
        store.approve_agent("alice", "admin").unwrap();

        let headers = signed_headers(&identity, &Method::GET, "/contacts", b"", "alice");
        let ctx = authenticate(&store, &headers, &Method::GET, "/contacts", b"").unwrap();
        assert_eq!(ctx.agent, "alice");
    }

    #[test]
    fn tampered_body_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let identity = Identity::generate();
        let pk = STANDARD.encode(identity.sign_pub());
        store.create_agent("alice", &pk, "a@example.com", "https://alice.example").unwrap();
        store.approve_agent("alice", "admin").unwrap();

        let headers = signed_headers(&identity, &Method::POST, "/contacts/request", b"original", "alice");
        assert!(authenticate(&store, &headers, &Method::POST, "/contacts/request", b"tampered").is_err());
    }

    #[test]
    fn revoked_agent_is_forbidden() {
        let store = SqliteStore::open_in_memory().unwrap();
        let identity = Identity::generate();
        let pk = STANDARD.encode(identity.sign_pub());
        store.create_agent("rogue", &pk, "a@example.com", "https://rogue.example").unwrap();
        store.approve_agent("rogue", "admin").unwrap();
        store.revoke_agent("rogue").unwrap();

        let headers = signed_headers(&identity, &Method::GET, "/contacts", b"", "rogue");
        let err = authenticate(&store, &headers, &Method::GET, "/contacts", b"").unwrap_err();
        assert!(matches!(err, RelayError::Forbidden(_)));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let identity = Identity::generate();
        let pk = STANDARD.encode(identity.sign_pub());
        store.create_agent("alice", &pk, "a@example.com", "https://alice.example").unwrap();
        store.approve_agent("alice", "admin").unwrap();

        let old_timestamp = (Utc::now() - chrono::Duration::seconds(MAX_CLOCK_SKEW_SECS + 60)).to_rfc3339();
        let message = signing_string(&Method::GET, "/contacts", &old_timestamp, b"");
        let sig = identity.sign(message.as_bytes());
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Signature alice:{}", STANDARD.encode(sig)).parse().unwrap(),
        );
        headers.insert("X-Timestamp", old_timestamp.parse().unwrap());

        assert!(authenticate(&store, &headers, &Method::GET, "/contacts", b"").is_err());
    }
}
