//! Per-community contact cache.
//!
//! Persisted as a single JSON document at `<dataDir>/<community>.json`.
//! Loading tolerates a missing or corrupt file by starting from empty and
//! letting the caller repopulate from the relay.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContactEntry {
    pub username: String,
    pub public_key: String, // base64 Ed25519 SPKI
    pub endpoint: String,
    pub added_at: DateTime<Utc>,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub key_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub recovery_in_progress: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheFile {
    schema_version: u32,
    community: String,
    refreshed_at: DateTime<Utc>,
    entries: Vec<ContactEntry>,
}

#[derive(Debug, Clone)]
pub struct ContactCache {
    community: String,
    path: PathBuf,
    entries: HashMap<String, ContactEntry>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl ContactCache {
    pub fn path_for(data_dir: &Path, community: &str) -> PathBuf {
        data_dir.join(format!("{community}.json"))
    }

    pub fn empty(data_dir: &Path, community: &str) -> Self {
        Self {
            community: community.to_string(),
            path: Self::path_for(data_dir, community),
            entries: HashMap::new(),
            refreshed_at: None,
        }
    }

    /// Load from disk, tolerating a missing or corrupt file.
    pub async fn load(data_dir: &Path, community: &str) -> Self {
        let path = Self::path_for(data_dir, community);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<CacheFile>(&bytes) {
                Ok(file) if file.schema_version == CACHE_SCHEMA_VERSION => Self {
                    community: community.to_string(),
                    path,
                    entries: file
                        .entries
                        .into_iter()
                        .map(|e| (e.username.clone(), e))
                        .collect(),
                    refreshed_at: Some(file.refreshed_at),
                },
                Ok(file) => {
                    warn!(
                        community,
                        found = file.schema_version,
                        expected = CACHE_SCHEMA_VERSION,
                        "contact cache schema mismatch, starting empty"
                    );
                    Self::empty(data_dir, community)
                }
                Err(err) => {
                    warn!(community, %err, "contact cache file is corrupt, starting empty");
                    Self::empty(data_dir, community)
                }
            },
            Err(_) => Self::empty(data_dir, community),
        }
    }

    pub async fn persist(&self) -> std::io::Result<()> {
        let file = CacheFile {
            schema_version: CACHE_SCHEMA_VERSION,
            community: self.community.clone(),
            refreshed_at: self.refreshed_at.unwrap_or_else(Utc::now),
            entries: self.entries.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Whole-object replacement from a relay contact list refresh.
    pub fn replace_all(&mut self, entries: Vec<ContactEntry>) {
        self.entries = entries.into_iter().map(|e| (e.username.clone(), e)).collect();
        self.refreshed_at = Some(Utc::now());
    }

    pub fn get(&self, username: &str) -> Option<&ContactEntry> {
        self.entries.get(username)
    }

    pub fn contains(&self, username: &str) -> bool {
        self.entries.contains_key(username)
    }

    pub fn all(&self) -> impl Iterator<Item = &ContactEntry> {
        self.entries.values()
    }

    pub fn is_stale(&self, max_age: chrono::Duration) -> bool {
        match self.refreshed_at {
            Some(t) => Utc::now() - t > max_age,
            None => true,
        }
    }

    pub fn mark_online(&mut self, username: &str, online: bool, last_seen: Option<DateTime<Utc>>) {
        if let Some(entry) = self.entries.get_mut(username) {
            entry.online = online;
            if let Some(seen) = last_seen {
                entry.last_seen = Some(seen);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_entry(name: &str) -> ContactEntry {
        ContactEntry {
            username: name.to_string(),
            public_key: "abc".to_string(),
            endpoint: "https://peer.example".to_string(),
            added_at: Utc::now(),
            online: true,
            last_seen: Some(Utc::now()),
            key_updated_at: Utc::now(),
            recovery_in_progress: false,
        }
    }

    #[tokio::test]
    async fn persists_and_reloads_entries() {
        let dir = tempdir().unwrap();
        let mut cache = ContactCache::empty(dir.path(), "home");
        cache.replace_all(vec![sample_entry("bob")]);
        cache.persist().await.unwrap();

        let reloaded = ContactCache::load(dir.path(), "home").await;
        assert!(reloaded.contains("bob"));
    }

    #[tokio::test]
    async fn corrupt_file_is_ignored_and_starts_empty() {
        let dir = tempdir().unwrap();
        let path = ContactCache::path_for(dir.path(), "home");
        tokio::fs::write(&path, b"not json{{{").await.unwrap();

        let cache = ContactCache::load(dir.path(), "home").await;
        assert_eq!(cache.all().count(), 0);
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let cache = ContactCache::load(dir.path(), "nope").await;
        assert_eq!(cache.all().count(), 0);
    }
}
