//! Layered client configuration.
//!
//! YAML parsing and file/env layering are out of scope; what lives
//! here is the typed target that layer would deserialize into, with
//! `Default` impls standing in for the "defaults" layer.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityConfig {
    pub name: String,
    pub primary_api: String,
    pub failover_api: Option<String>,
    /// Overrides the agent's top-level identity for this community only.
    pub key_override_seed_b64: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub agent_name: String,
    pub endpoint: String,
    pub data_dir: PathBuf,
    pub communities: Vec<CommunityConfig>,
    pub default_community: Option<String>,

    pub heartbeat_interval_secs: u64,
    pub failover_threshold: u32,
    pub startup_failover_threshold: u32,

    pub relay_call_timeout_secs: u64,
    pub p2p_delivery_timeout_secs: u64,

    pub retry_queue_max: usize,
    pub retry_offsets_secs: Vec<u64>,
    pub retry_max_attempts: u32,
    pub retry_horizon_secs: u64,

    pub delivery_report_cap: usize,
    pub dedup_cap: usize,

    pub group_member_cache_ttl_secs: u64,
    pub group_fanout_concurrency: usize,

    pub contact_cache_stale_after_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agent_name: String::new(),
            endpoint: String::new(),
            data_dir: PathBuf::from("."),
            communities: Vec::new(),
            default_community: None,
            heartbeat_interval_secs: 5 * 60,
            failover_threshold: 3,
            startup_failover_threshold: 1,
            relay_call_timeout_secs: 5,
            p2p_delivery_timeout_secs: 5,
            retry_queue_max: 100,
            retry_offsets_secs: vec![10, 30, 90],
            retry_max_attempts: 3,
            retry_horizon_secs: 60 * 60,
            delivery_report_cap: 500,
            dedup_cap: 1000,
            group_member_cache_ttl_secs: 60,
            group_fanout_concurrency: 10,
            contact_cache_stale_after_secs: 5 * 60,
        }
    }
}

impl Settings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn relay_call_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_call_timeout_secs)
    }

    pub fn p2p_delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.p2p_delivery_timeout_secs)
    }

    pub fn presence_stale_after(&self) -> Duration {
        // online iff now - lastSeen <= 2x heartbeatInterval.
        self.heartbeat_interval() * 2
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.agent_name.is_empty() {
            return Err("agent_name must not be empty".into());
        }
        if self.communities.is_empty() {
            return Err("at least one community must be configured".into());
        }
        for c in &self.communities {
            if c.primary_api.is_empty() {
                return Err(format!("community {} has no primary_api", c.name));
            }
        }
        Ok(())
    }
}
