//! Identity persistence for a running agent process.
//!
//! OS-keychain integration is out of scope (Non-goal); [`FileKeyStore`] is a
//! deliberately simple stand-in that keeps the base64-encoded Ed25519 seed
//! in a single file with owner-only permissions on Unix.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use cc_crypto::identity::Identity;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("key storage failed: {0}")]
    Storage(String),
    #[error("key loading failed: {0}")]
    Loading(String),
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn store_seed(&self, seed: &[u8; 32]) -> Result<(), IdentityError>;
    async fn load_seed(&self) -> Result<[u8; 32], IdentityError>;
    async fn seed_exists(&self) -> bool;
}

pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn store_seed(&self, seed: &[u8; 32]) -> Result<(), IdentityError> {
        let encoded = STANDARD.encode(seed);
        tokio::fs::write(&self.path, encoded.as_bytes())
            .await
            .map_err(|e| IdentityError::Storage(e.to_string()))?;
        restrict_permissions(&self.path).await?;
        Ok(())
    }

    async fn load_seed(&self) -> Result<[u8; 32], IdentityError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| IdentityError::Loading(e.to_string()))?;
        let bytes = STANDARD
            .decode(content.trim())
            .map_err(|e| IdentityError::Loading(e.to_string()))?;
        bytes
            .try_into()
            .map_err(|v: Vec<u8>| IdentityError::Loading(format!("expected 32 bytes, got {}", v.len())))
    }

    async fn seed_exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), IdentityError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| IdentityError::Storage(e.to_string()))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), IdentityError> {
    Ok(())
}

pub struct IdentityManager {
    identity: Arc<Identity>,
}

impl IdentityManager {
    /// Loads the persisted identity seed, or generates and persists a new
    /// one on first run.
    pub async fn load_or_generate(keystore: &dyn KeyStore) -> Result<Self, IdentityError> {
        let identity = if keystore.seed_exists().await {
            info!("loading existing agent identity");
            let seed = keystore.load_seed().await?;
            Identity::from_seed(&seed)
        } else {
            info!("generating new agent identity");
            let identity = Identity::generate();
            keystore.store_seed(&identity.seed_bytes()).await?;
            identity
        };

        Ok(Self {
            identity: Arc::new(identity),
        })
    }

    pub fn identity(&self) -> Arc<Identity> {
        self.identity.clone()
    }
}
