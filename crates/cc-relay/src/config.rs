//! Relay runtime configuration: a plain, validated, serde
//! struct. Parsing an on-disk TOML/env file into this struct is the job of
//! an external CLI; this crate only owns the typed target and its validation.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimitConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminBootstrap {
    pub agent: String,
    pub admin_public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,

    pub heartbeat_interval_secs: u64,
    pub rate_limit: RateLimitConfig,

    /// Legacy endpoints return `410 Gone` once `Utc::now() > legacy_cutoff`.
    pub legacy_cutoff: DateTime<Utc>,

    pub admin_bootstrap: Vec<AdminBootstrap>,

    pub shutdown_timeout_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("valid default address"),
            db_path: PathBuf::from("cc-relay.sqlite3"),
            tls_cert_path: None,
            tls_key_path: None,
            heartbeat_interval_secs: 300,
            rate_limit: RateLimitConfig::default(),
            legacy_cutoff: Utc::now() + chrono::Duration::days(30),
            admin_bootstrap: Vec::new(),
            shutdown_timeout_secs: 30,
        }
    }
}

impl RelaySettings {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PORT") {
            let port: u16 = addr.parse()?;
            config.bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
        }
        if let Ok(addr) = std::env::var("CC_RELAY_BIND_ADDR") {
            config.bind_addr = addr.parse()?;
        }
        if let Ok(path) = std::env::var("CC_RELAY_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Ok(secs) = std::env::var("CC_RELAY_HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval_secs = secs.parse()?;
        }

        Ok(config)
    }

    pub fn from_toml(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RelaySettings = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("heartbeat_interval_secs must be > 0");
        }
        if let (Some(_), None) | (None, Some(_)) = (&self.tls_cert_path, &self.tls_key_path) {
            anyhow::bail!("both tls_cert_path and tls_key_path must be set or both unset");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Presence is `online` while `now - last_seen <= 2x heartbeat_interval`.
    pub fn presence_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_interval_secs as i64 * 2)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
