//! Community manager: per-community relay state, sticky
//! failover, heartbeat scheduling, cache ownership and qualified-name
//! resolution.
//!
//! The manager owns caches and timers; callers (the message pipeline, group
//! fan-out) borrow it rather than being owned by it, so each can be tested
//! independently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use cc_crypto::identity::Identity;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{CommunityConfig, Settings};
use crate::contact_cache::{ContactCache, ContactEntry};
use crate::errors::ClientError;
use crate::events::{ClientEvent, EventBus};
use crate::relay_client::{RelayClient, RelayResponse, RelayTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveRelay {
    Primary,
    Failover,
}

pub struct CommunityState {
    pub name: String,
    pub primary_api: String,
    pub failover_api: Option<String>,
    active: parking_lot::Mutex<ActiveRelay>,
    consecutive_failures: AtomicU32,
    first_success_seen: AtomicBool,
    startup_failures: AtomicU32,
    pub cache: RwLock<ContactCache>,
    pub identity: Arc<Identity>,
    /// Admin public keys (base64), refreshed from `/admin/keys` on every
    /// heartbeat. Broadcasts are verified against this set rather than the
    /// contact cache, since a broadcast's sender need not be a contact.
    pub admin_keys: RwLock<Vec<String>>,
}

impl CommunityState {
    pub fn active_base_url(&self) -> String {
        match *self.active.lock() {
            ActiveRelay::Primary => self.primary_api.clone(),
            ActiveRelay::Failover => self
                .failover_api
                .clone()
                .unwrap_or_else(|| self.primary_api.clone()),
        }
    }

    pub fn active_relay(&self) -> ActiveRelay {
        *self.active.lock()
    }
}

pub struct CommunityManagerConfig {
    pub agent_name: String,
    pub data_dir: PathBuf,
    pub identity: Arc<Identity>,
    pub failover_threshold: u32,
    pub startup_failover_threshold: u32,
}

pub struct CommunityManager<T: RelayTransport = crate::relay_client::ReqwestTransport> {
    agent_name: String,
    communities: HashMap<String, Arc<CommunityState>>,
    relay: RelayClient<T>,
    events: EventBus,
    failover_threshold: u32,
    startup_failover_threshold: u32,
    default_community: Option<String>,
}

impl CommunityManager<crate::relay_client::ReqwestTransport> {
    pub async fn new(settings: &Settings, identity: Arc<Identity>, events: EventBus) -> Self {
        Self::with_transport(
            crate::relay_client::ReqwestTransport::default(),
            settings,
            identity,
            events,
        )
        .await
    }
}

impl<T: RelayTransport> CommunityManager<T> {
    pub async fn with_transport(
        transport: T,
        settings: &Settings,
        identity: Arc<Identity>,
        events: EventBus,
    ) -> Self {
        let mut communities = HashMap::new();
        for cfg in &settings.communities {
            let state = build_community_state(cfg, &settings.data_dir, identity.clone()).await;
            communities.insert(cfg.name.clone(), Arc::new(state));
        }
        Self {
            agent_name: settings.agent_name.clone(),
            communities,
            relay: RelayClient::with_transport(transport, settings.relay_call_timeout()),
            events,
            failover_threshold: settings.failover_threshold,
            startup_failover_threshold: settings.startup_failover_threshold,
            default_community: settings.default_community.clone(),
        }
    }

    pub fn community(&self, name: &str) -> Option<Arc<CommunityState>> {
        self.communities.get(name).cloned()
    }

    pub fn community_names(&self) -> Vec<String> {
        self.communities.keys().cloned().collect()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Route a relay call through sticky-failover accounting.
    pub async fn call_api(
        &self,
        community: &str,
        method: &str,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<RelayResponse, ClientError> {
        let state = self
            .community(community)
            .ok_or_else(|| ClientError::UnknownCommunity(community.to_string()))?;
        let base_url = state.active_base_url();
        let result = self
            .relay
            .call(&base_url, &state.identity, &self.agent_name, method, path, body)
            .await;

        let transient = match &result {
            Ok(resp) => resp.is_server_error(),
            Err(e) => e.is_transient(),
        };

        if transient {
            self.record_failure(&state).await;
        } else if result.is_ok() {
            self.record_success(&state);
        }

        result
    }

    async fn record_success(&self, state: &Arc<CommunityState>) {
        state.consecutive_failures.store(0, Ordering::SeqCst);
        state.first_success_seen.store(true, Ordering::SeqCst);
    }

    async fn record_failure(&self, state: &Arc<CommunityState>) {
        let first_success = state.first_success_seen.load(Ordering::SeqCst);
        let threshold = if first_success {
            self.failover_threshold
        } else {
            let n = state.startup_failures.fetch_add(1, Ordering::SeqCst) + 1;
            n.min(self.startup_failover_threshold)
        };
        let failures = state.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        if failures >= threshold
            && state.failover_api.is_some()
            && *state.active.lock() == ActiveRelay::Primary
        {
            *state.active.lock() = ActiveRelay::Failover;
            warn!(community = %state.name, "community failing over to backup relay (sticky)");
            self.events.emit(ClientEvent::CommunityStatus {
                community: state.name.clone(),
                status: "failover".into(),
            });
        }
    }

    /// Send a heartbeat to every configured community, and refresh each
    /// community's cached admin-key list alongside it.
    pub async fn heartbeat_all(&self, endpoint: &str) {
        for name in self.communities.keys() {
            let body = serde_json::json!({ "endpoint": endpoint });
            if let Err(err) = self.call_api(name, "PUT", "/presence", Some(&body)).await {
                info!(community = %name, %err, "heartbeat failed (recorded by failover accounting)");
            }
            if let Err(err) = self.refresh_admin_keys(name).await {
                info!(community = %name, %err, "admin key refresh failed");
            }
        }
    }

    /// Refresh the cached admin public keys for `community` from
    /// `GET /admin/keys`, replacing the previous set wholesale on success.
    pub async fn refresh_admin_keys(&self, community: &str) -> Result<(), ClientError> {
        let resp = self.call_api(community, "GET", "/admin/keys", None).await?;
        if !resp.is_success() {
            return Err(resp.as_error());
        }
        let keys: Vec<String> =
            serde_json::from_value(resp.body).map_err(|e| ClientError::Validation(e.to_string()))?;
        let state = self
            .community(community)
            .ok_or_else(|| ClientError::UnknownCommunity(community.to_string()))?;
        *state.admin_keys.write().await = keys;
        Ok(())
    }

    /// Refresh a community's contact cache from the relay, replacing it
    /// wholesale on success and keeping the stale entry on failure.
    pub async fn refresh_contacts(&self, community: &str) -> Result<(), ClientError> {
        let resp = self.call_api(community, "GET", "/contacts", None).await?;
        if !resp.is_success() {
            return Err(resp.as_error());
        }
        let entries: Vec<ContactEntry> = serde_json::from_value(resp.body)
            .map_err(|e| ClientError::Validation(e.to_string()))?;
        let state = self
            .community(community)
            .ok_or_else(|| ClientError::UnknownCommunity(community.to_string()))?;
        state.cache.write().await.replace_all(entries);
        Ok(())
    }

    pub async fn persist_cache(&self, community: &str) -> std::io::Result<()> {
        if let Some(state) = self.community(community) {
            state.cache.read().await.persist().await?;
        }
        Ok(())
    }

    pub async fn persist_all_caches(&self) {
        for name in self.communities.keys().cloned().collect::<Vec<_>>() {
            if let Err(err) = self.persist_cache(&name).await {
                warn!(community = %name, %err, "failed to persist contact cache");
            }
        }
    }

    /// Resolve a possibly-qualified recipient name (`user@hostname`) to a
    /// `(community, username)` pair.
    pub async fn resolve_recipient(&self, raw: &str) -> Result<(String, String), ClientError> {
        if let Some((user, host)) = raw.split_once('@') {
            for (name, state) in &self.communities {
                if host_matches(&state.primary_api, host)
                    || state
                        .failover_api
                        .as_deref()
                        .is_some_and(|f| host_matches(f, host))
                {
                    return Ok((name.clone(), user.to_string()));
                }
            }
            return Err(ClientError::UnknownCommunity(host.to_string()));
        }

        for (name, state) in &self.communities {
            if state.cache.read().await.contains(raw) {
                return Ok((name.clone(), raw.to_string()));
            }
        }

        let default = self
            .default_community
            .clone()
            .or_else(|| self.communities.keys().next().cloned())
            .ok_or_else(|| ClientError::UnknownCommunity(raw.to_string()))?;
        Ok((default, raw.to_string()))
    }

    /// Key rotation fan-out: post the new public key to
    /// every community that currently authenticates with the key being
    /// rotated. Communities are grouped by identity pointer equality, since
    /// a per-community key override is a distinct `Identity` instance from
    /// the top-level one; when a caller-supplied filter names some
    /// communities, the filter is expanded to every community sharing an
    /// identity with a named one, so a rotation never splits a key's group.
    pub async fn rotate_key(
        &self,
        new_public_key_bundle: &cc_crypto::identity::PublicKeyBundle,
        communities: Option<&[String]>,
    ) -> Result<Vec<(String, bool)>, ClientError> {
        let targets: Vec<String> = match communities {
            Some(list) => {
                let named_identities: Vec<*const Identity> = list
                    .iter()
                    .filter_map(|n| self.community(n))
                    .map(|s| Arc::as_ptr(&s.identity))
                    .collect();
                self.communities
                    .iter()
                    .filter(|(_, state)| named_identities.contains(&Arc::as_ptr(&state.identity)))
                    .map(|(name, _)| name.clone())
                    .collect()
            }
            None => self.communities.keys().cloned().collect(),
        };
        if targets.is_empty() {
            return Err(ClientError::Validation("no communities to rotate".into()));
        }

        let mut results = Vec::new();
        let mut any_success = false;
        for name in &targets {
            let body = serde_json::json!({ "newPublicKey": new_public_key_bundle });
            let outcome = self.call_api(name, "POST", "/keys/rotate", Some(&body)).await;
            let ok = matches!(&outcome, Ok(resp) if resp.is_success());
            any_success |= ok;
            results.push(((*name).clone(), ok));
        }

        if !any_success {
            return Err(ClientError::Transient("key rotation failed on every community".into()));
        }
        if results.iter().any(|(_, ok)| !ok) {
            let failed: Vec<String> = results
                .iter()
                .filter(|(_, ok)| !ok)
                .map(|(n, _)| n.clone())
                .collect();
            self.events.emit(ClientEvent::KeyRotationPartial {
                failed_communities: failed,
            });
        }
        Ok(results)
    }
}

async fn build_community_state(
    cfg: &CommunityConfig,
    data_dir: &std::path::Path,
    default_identity: Arc<Identity>,
) -> CommunityState {
    let identity = match &cfg.key_override_seed_b64 {
        Some(seed_b64) => Arc::new(
            Identity::from_base64_seed(seed_b64)
                .unwrap_or_else(|_| panic!("invalid per-community key override for {}", cfg.name)),
        ),
        None => default_identity,
    };
    let cache = ContactCache::load(data_dir, &cfg.name).await;
    CommunityState {
        name: cfg.name.clone(),
        primary_api: cfg.primary_api.clone(),
        failover_api: cfg.failover_api.clone(),
        active: parking_lot::Mutex::new(ActiveRelay::Primary),
        consecutive_failures: AtomicU32::new(0),
        first_success_seen: AtomicBool::new(false),
        startup_failures: AtomicU32::new(0),
        cache: RwLock::new(cache),
        identity,
        admin_keys: RwLock::new(Vec::new()),
    }
}

fn host_matches(api_base_url: &str, host: &str) -> bool {
    api_base_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .map(|h| h.split(':').next().unwrap_or(h))
        .is_some_and(|h| h.eq_ignore_ascii_case(host))
}

pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay_client::RelayResponse;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Default)]
    struct ScriptedTransport {
        call_count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RelayTransport for ScriptedTransport {
        async fn send(
            &self,
            base_url: &str,
            _method: &str,
            _path: &str,
            _headers: Vec<(String, String)>,
            _body: Option<Vec<u8>>,
            _timeout: Duration,
        ) -> Result<RelayResponse, ClientError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            // Primary always 5xx, failover always succeeds.
            if base_url.contains("primary") {
                Ok(RelayResponse {
                    status: 503,
                    rate_limit_remaining: None,
                    rate_limit_reset: None,
                    body: serde_json::json!({"error": "unavailable"}),
                })
            } else {
                Ok(RelayResponse {
                    status: 200,
                    rate_limit_remaining: None,
                    rate_limit_reset: None,
                    body: serde_json::json!([]),
                })
            }
        }
    }

    fn settings_with_failover(dir: &std::path::Path) -> Settings {
        Settings {
            agent_name: "alice".into(),
            endpoint: "https://alice.example".into(),
            data_dir: dir.to_path_buf(),
            communities: vec![CommunityConfig {
                name: "home".into(),
                primary_api: "https://primary.example".into(),
                failover_api: Some("https://failover.example".into()),
                key_override_seed_b64: None,
            }],
            default_community: Some("home".into()),
            failover_threshold: 3,
            startup_failover_threshold: 1,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn three_consecutive_failures_trigger_sticky_failover() {
        let dir = tempdir().unwrap();
        let settings = settings_with_failover(dir.path());
        let identity = Arc::new(Identity::generate());
        let manager = CommunityManager::with_transport(
            ScriptedTransport::default(),
            &settings,
            identity,
            EventBus::new(),
        )
        .await;

        for _ in 0..3 {
            let _ = manager.call_api("home", "GET", "/contacts", None).await;
        }
        let state = manager.community("home").unwrap();
        assert_eq!(state.active_relay(), ActiveRelay::Failover);

        // A subsequent call is served by failover and must not flip back.
        let resp = manager.call_api("home", "GET", "/contacts", None).await.unwrap();
        assert!(resp.is_success());
        assert_eq!(state.active_relay(), ActiveRelay::Failover);
    }

    #[tokio::test]
    async fn unqualified_name_resolves_via_cache_then_default() {
        let dir = tempdir().unwrap();
        let settings = settings_with_failover(dir.path());
        let identity = Arc::new(Identity::generate());
        let manager = CommunityManager::with_transport(
            ScriptedTransport::default(),
            &settings,
            identity,
            EventBus::new(),
        )
        .await;
        let (community, user) = manager.resolve_recipient("bob").await.unwrap();
        assert_eq!(community, "home");
        assert_eq!(user, "bob");
    }

    #[tokio::test]
    async fn qualified_name_resolves_by_relay_hostname() {
        let dir = tempdir().unwrap();
        let settings = settings_with_failover(dir.path());
        let identity = Arc::new(Identity::generate());
        let manager = CommunityManager::with_transport(
            ScriptedTransport::default(),
            &settings,
            identity,
            EventBus::new(),
        )
        .await;
        let (community, user) = manager
            .resolve_recipient("bob@primary.example")
            .await
            .unwrap();
        assert_eq!(community, "home");
        assert_eq!(user, "bob");
    }

    #[tokio::test]
    async fn key_rotation_filter_expands_to_full_identity_group() {
        let dir = tempdir().unwrap();
        let identity = Arc::new(Identity::generate());
        let override_seed_b64 = {
            use base64::{engine::general_purpose::STANDARD, Engine};
            STANDARD.encode([7u8; 32])
        };
        let settings = Settings {
            agent_name: "alice".into(),
            endpoint: "https://alice.example".into(),
            data_dir: dir.path().to_path_buf(),
            communities: vec![
                CommunityConfig {
                    name: "home".into(),
                    primary_api: "https://home.example".into(),
                    failover_api: None,
                    key_override_seed_b64: None,
                },
                CommunityConfig {
                    name: "work".into(),
                    primary_api: "https://work.example".into(),
                    failover_api: None,
                    key_override_seed_b64: None,
                },
                CommunityConfig {
                    name: "side".into(),
                    primary_api: "https://side.example".into(),
                    failover_api: None,
                    key_override_seed_b64: Some(override_seed_b64.clone()),
                },
            ],
            default_community: Some("home".into()),
            failover_threshold: 3,
            startup_failover_threshold: 1,
            ..Settings::default()
        };
        let manager = CommunityManager::with_transport(
            ScriptedTransport::default(),
            &settings,
            identity.clone(),
            EventBus::new(),
        )
        .await;

        let bundle = identity.public_bundle();
        let results = manager
            .rotate_key(&bundle, Some(&["home".to_string()]))
            .await
            .unwrap();
        let rotated: std::collections::HashSet<String> =
            results.into_iter().map(|(n, _)| n).collect();
        assert!(rotated.contains("home"));
        assert!(rotated.contains("work"));
        assert!(!rotated.contains("side"));
    }
}
