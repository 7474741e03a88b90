//! Agent process configuration: wraps [`cc_client::config::Settings`] with
//! the handful of fields that only matter to a running process (where to
//! bind the inbox, where to keep the identity key on disk).

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub bind_addr: SocketAddr,
    pub identity_key_path: PathBuf,
    #[serde(flatten)]
    pub settings: cc_client::config::Settings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9443".parse().expect("valid default address"),
            identity_key_path: PathBuf::from("cc-agent-identity.key"),
            settings: cc_client::config::Settings::default(),
        }
    }
}

impl AgentConfig {
    pub fn from_toml(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("CC_AGENT_BIND_ADDR") {
            config.bind_addr = addr.parse()?;
        }
        if let Ok(path) = std::env::var("CC_AGENT_IDENTITY_KEY_PATH") {
            config.identity_key_path = PathBuf::from(path);
        }
        if let Ok(name) = std::env::var("CC_AGENT_NAME") {
            config.settings.agent_name = name;
        }
        if let Ok(endpoint) = std::env::var("CC_AGENT_ENDPOINT") {
            config.settings.endpoint = endpoint;
        }
        if let Ok(community) = std::env::var("CC_AGENT_COMMUNITY") {
            let primary_api = std::env::var("CC_AGENT_RELAY_URL")
                .map_err(|_| anyhow::anyhow!("CC_AGENT_RELAY_URL must be set alongside CC_AGENT_COMMUNITY"))?;
            config.settings.communities.push(cc_client::config::CommunityConfig {
                name: community.clone(),
                primary_api,
                failover_api: std::env::var("CC_AGENT_RELAY_FAILOVER_URL").ok(),
                key_override_seed_b64: None,
            });
            config.settings.default_community.get_or_insert(community);
        }

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.settings.validate().map_err(|e| anyhow::anyhow!(e))?;
        Ok(())
    }
}
