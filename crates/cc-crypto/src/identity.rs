//! Agent identity: a single Ed25519 signing keypair, with an X25519
//! key-exchange keypair derived from it on demand (see [`crate::birational`]).

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::birational::{derive_x25519_public, derive_x25519_secret};
use crate::hash::sha256;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// An agent's long-lived cryptographic identity.
///
/// Only the Ed25519 seed is stored; the X25519 key-exchange key is derived
/// lazily from it. Key material is zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Identity {
    #[zeroize(skip)] // SigningKey zeroizes its own seed internally
    sign_key: SigningKey,
}

/// The public half of an identity, as published to a relay and cached by peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicKeyBundle {
    pub sign_pub: String, // base64
    pub kex_pub: String,  // base64, derived
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            sign_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            sign_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn from_base64_seed(seed_b64: &str) -> Result<Self, IdentityError> {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let bytes = STANDARD
            .decode(seed_b64)
            .map_err(|_| IdentityError::InvalidPublicKey)?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| IdentityError::InvalidKeyLength {
                expected: 32,
                got: v.len(),
            })?;
        Ok(Self::from_seed(&seed))
    }

    /// The agent's stable identifier: SHA-256 of the Ed25519 public key.
    pub fn id(&self) -> [u8; 32] {
        sha256(&self.sign_key.verifying_key().to_bytes())
    }

    pub fn sign_pub(&self) -> [u8; 32] {
        self.sign_key.verifying_key().to_bytes()
    }

    pub fn kex_pub(&self) -> [u8; 32] {
        *derive_x25519_public(&self.sign_key.verifying_key())
            .expect("ed25519 verifying key is always a valid curve point")
            .as_bytes()
    }

    pub fn public_bundle(&self) -> PublicKeyBundle {
        use base64::{engine::general_purpose::STANDARD, Engine};
        PublicKeyBundle {
            sign_pub: STANDARD.encode(self.sign_pub()),
            kex_pub: STANDARD.encode(self.kex_pub()),
        }
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let signature: Signature = self.sign_key.sign(message);
        signature.to_bytes()
    }

    /// X25519 Diffie-Hellman against a peer's (derived) key-exchange public key.
    pub fn key_exchange(&self, peer_kex_pub: &[u8; 32]) -> [u8; 32] {
        let secret = derive_x25519_secret(&self.sign_key);
        let peer_pub = X25519PublicKey::from(*peer_kex_pub);
        *secret.diffie_hellman(&peer_pub).as_bytes()
    }

    pub fn kex_secret(&self) -> StaticSecret {
        derive_x25519_secret(&self.sign_key)
    }

    pub fn sign_key(&self) -> &SigningKey {
        &self.sign_key
    }

    /// The raw Ed25519 seed, for callers that need to persist an identity
    /// across restarts (e.g. an OS keychain or file-backed key store).
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.sign_key.to_bytes()
    }
}

pub fn verify_signature(
    pub_key: &[u8; 32],
    message: &[u8],
    signature: &[u8; 64],
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(pub_key).map_err(|_| IdentityError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(signature);
    verifying_key
        .verify_strict(message, &sig)
        .map_err(|_| IdentityError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_sha256_of_sign_pub() {
        let identity = Identity::generate();
        assert_eq!(identity.id(), sha256(&identity.sign_pub()));
    }

    #[test]
    fn signature_round_trip() {
        let identity = Identity::generate();
        let message = b"hello cc4me";
        let signature = identity.sign(message);
        assert!(verify_signature(&identity.sign_pub(), message, &signature).is_ok());
    }

    #[test]
    fn signature_wrong_message_fails() {
        let identity = Identity::generate();
        let signature = identity.sign(b"original");
        assert!(verify_signature(&identity.sign_pub(), b"tampered", &signature).is_err());
    }

    #[test]
    fn signature_wrong_key_fails() {
        let a = Identity::generate();
        let b = Identity::generate();
        let signature = a.sign(b"message");
        assert!(verify_signature(&b.sign_pub(), b"message", &signature).is_err());
    }

    #[test]
    fn key_exchange_is_symmetric() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        assert_eq!(
            alice.key_exchange(&bob.kex_pub()),
            bob.key_exchange(&alice.kex_pub())
        );
    }

    #[test]
    fn kex_pub_is_deterministic_from_seed() {
        let seed = [7u8; 32];
        let a = Identity::from_seed(&seed);
        let b = Identity::from_seed(&seed);
        assert_eq!(a.kex_pub(), b.kex_pub());
        assert_eq!(a.sign_pub(), b.sign_pub());
    }

    #[test]
    fn public_bundle_roundtrips_through_base64() {
        let identity = Identity::generate();
        let bundle = identity.public_bundle();
        use base64::{engine::general_purpose::STANDARD, Engine};
        assert_eq!(STANDARD.decode(&bundle.sign_pub).unwrap(), identity.sign_pub());
        assert_eq!(STANDARD.decode(&bundle.kex_pub).unwrap(), identity.kex_pub());
    }

    #[test]
    fn distinct_identities_have_distinct_ids() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn seed_bytes_round_trip_through_from_seed() {
        let identity = Identity::generate();
        let restored = Identity::from_seed(&identity.seed_bytes());
        assert_eq!(identity.sign_pub(), restored.sign_pub());
        assert_eq!(identity.kex_pub(), restored.kex_pub());
    }
}
