//! Signed relay API client.
//!
//! Every authenticated call is framed as
//! `Authorization: Signature <agent>:<base64-sig>` plus `X-Timestamp`, where
//! the signed string is `"{METHOD} {PATH}\n{timestamp}\n{sha256hex(body)}"`.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use cc_crypto::hash::sha256;
use cc_crypto::identity::Identity;
use chrono::Utc;
use serde::de::DeserializeOwned;

use crate::errors::ClientError;

/// A relay's decoded response, distinguishing transport failure from a
/// decoded HTTP status so callers can run failover/retry accounting.
pub struct RelayResponse {
    pub status: u16,
    pub rate_limit_remaining: Option<u32>,
    pub rate_limit_reset: Option<u64>,
    pub body: serde_json::Value,
}

impl RelayResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }

    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, ClientError> {
        serde_json::from_value(self.body).map_err(|e| ClientError::Validation(e.to_string()))
    }

    /// Classify a non-2xx response into the client error taxonomy.
    pub fn as_error(&self) -> ClientError {
        match self.status {
            401 | 403 => ClientError::Auth(self.body.to_string()),
            404 => ClientError::NotFound(self.body.to_string()),
            409 => ClientError::Conflict(self.body.to_string()),
            429 => ClientError::RateLimited {
                retry_after_secs: self.rate_limit_reset.unwrap_or(60),
            },
            400 => ClientError::Validation(self.body.to_string()),
            s if s >= 500 => ClientError::Transient(format!("relay returned {s}")),
            s => ClientError::Transient(format!("unexpected relay status {s}")),
        }
    }
}

/// Low-level HTTP transport used by [`RelayClient`]. Abstracted so tests can
/// substitute a fake without spinning up a real relay.
#[async_trait::async_trait]
pub trait RelayTransport: Send + Sync {
    async fn send(
        &self,
        base_url: &str,
        method: &str,
        path: &str,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<RelayResponse, ClientError>;
}

/// Production transport backed by `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self {
            client: reqwest::Client::builder()
                .build()
                .expect("reqwest client builds with default TLS config"),
        }
    }
}

#[async_trait::async_trait]
impl RelayTransport for ReqwestTransport {
    async fn send(
        &self,
        base_url: &str,
        method: &str,
        path: &str,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<RelayResponse, ClientError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), path);
        let m = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| ClientError::Validation(e.to_string()))?;
        let mut req = self.client.request(m, url).timeout(timeout);
        for (k, v) in headers {
            req = req.header(k, v);
        }
        if let Some(b) = body {
            req = req.header("content-type", "application/json").body(b);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))?;
        let status = resp.status().as_u16();
        let rate_limit_remaining = resp
            .headers()
            .get("X-RateLimit-Remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let rate_limit_reset = resp
            .headers()
            .get("X-RateLimit-Reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body: serde_json::Value = resp
            .json()
            .await
            .unwrap_or(serde_json::Value::Null);
        Ok(RelayResponse {
            status,
            rate_limit_remaining,
            rate_limit_reset,
            body,
        })
    }
}

pub struct RelayClient<T: RelayTransport = ReqwestTransport> {
    transport: T,
    timeout: Duration,
}

impl RelayClient<ReqwestTransport> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            transport: ReqwestTransport::default(),
            timeout,
        }
    }
}

impl<T: RelayTransport> RelayClient<T> {
    pub fn with_transport(transport: T, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Build the `Authorization`/`X-Timestamp` headers for a signed request.
    fn sign_request(
        identity: &Identity,
        agent_name: &str,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> Vec<(String, String)> {
        let timestamp = Utc::now().to_rfc3339();
        let body_hash = hex::encode(sha256(body));
        let signing_string = format!("{method} {path}\n{timestamp}\n{body_hash}");
        let signature = identity.sign(signing_string.as_bytes());
        vec![
            (
                "Authorization".to_string(),
                format!("Signature {agent_name}:{}", STANDARD.encode(signature)),
            ),
            ("X-Timestamp".to_string(), timestamp),
        ]
    }

    pub async fn call(
        &self,
        base_url: &str,
        identity: &Identity,
        agent_name: &str,
        method: &str,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<RelayResponse, ClientError> {
        let body_bytes = match body {
            Some(v) => serde_json::to_vec(v).map_err(|e| ClientError::Validation(e.to_string()))?,
            None => Vec::new(),
        };
        let headers = Self::sign_request(identity, agent_name, method, path, &body_bytes);
        let body_opt = if body.is_some() { Some(body_bytes) } else { None };
        self.transport
            .send(base_url, method, path, headers, body_opt, self.timeout)
            .await
    }

    /// Unauthenticated call (registration, heartbeat-less health checks).
    pub async fn call_unsigned(
        &self,
        base_url: &str,
        method: &str,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<RelayResponse, ClientError> {
        let body_bytes = match body {
            Some(v) => Some(serde_json::to_vec(v).map_err(|e| ClientError::Validation(e.to_string()))?),
            None => None,
        };
        self.transport
            .send(base_url, method, path, Vec::new(), body_bytes, self.timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    struct FakeTransport {
        responses: Arc<Mutex<Vec<RelayResponse>>>,
        seen_headers: Arc<Mutex<Vec<Vec<(String, String)>>>>,
    }

    #[async_trait::async_trait]
    impl RelayTransport for FakeTransport {
        async fn send(
            &self,
            _base_url: &str,
            _method: &str,
            _path: &str,
            headers: Vec<(String, String)>,
            _body: Option<Vec<u8>>,
            _timeout: Duration,
        ) -> Result<RelayResponse, ClientError> {
            self.seen_headers.lock().await.push(headers);
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                return Err(ClientError::Transient("no more fake responses".into()));
            }
            Ok(responses.remove(0))
        }
    }

    #[tokio::test]
    async fn signed_call_carries_authorization_and_timestamp_headers() {
        let identity = Identity::generate();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let transport = FakeTransport {
            responses: Arc::new(Mutex::new(vec![RelayResponse {
                status: 200,
                rate_limit_remaining: None,
                rate_limit_reset: None,
                body: serde_json::json!({"ok": true}),
            }])),
            seen_headers: seen.clone(),
        };
        let client = RelayClient::with_transport(transport, Duration::from_secs(5));
        let resp = client
            .call(
                "https://relay.example",
                &identity,
                "alice",
                "PUT",
                "/presence",
                Some(&serde_json::json!({"endpoint": "https://alice.example"})),
            )
            .await
            .unwrap();
        assert!(resp.is_success());
        let headers = seen.lock().await.remove(0);
        assert!(headers.iter().any(|(k, _)| k == "Authorization"));
        assert!(headers.iter().any(|(k, _)| k == "X-Timestamp"));
    }

    #[tokio::test]
    async fn rate_limited_response_classifies_correctly() {
        let transport = FakeTransport {
            responses: Arc::new(Mutex::new(vec![RelayResponse {
                status: 429,
                rate_limit_remaining: Some(0),
                rate_limit_reset: Some(42),
                body: serde_json::json!({"error": "rate limited"}),
            }])),
            seen_headers: Arc::new(Mutex::new(Vec::new())),
        };
        let client = RelayClient::with_transport(transport, Duration::from_secs(5));
        let identity = Identity::generate();
        let resp = client
            .call("https://relay.example", &identity, "alice", "GET", "/contacts", None)
            .await
            .unwrap();
        assert!(matches!(
            resp.as_error(),
            ClientError::RateLimited { retry_after_secs: 42 }
        ));
    }
}
