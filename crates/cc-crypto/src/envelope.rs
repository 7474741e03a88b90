//! Wire envelope: the signed, optionally end-to-end-encrypted unit exchanged
//! between agents.
//!
//! Encryption is ECDH (X25519, derived per [`crate::birational`]) + HKDF-SHA256
//! + AES-256-GCM, with the AEAD's associated data bound to the envelope's
//! message id so a ciphertext cannot be replayed under a different id.

use aes_gcm::aead::{Aead, KeyInit, Payload as AeadPayload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::canonical::canonical_json_bytes;

pub const ENVELOPE_VERSION: &str = "2.0";
const HKDF_SALT: &[u8] = b"cc4me-e2e-v1";
const MAX_CLOCK_SKEW_SECS: i64 = 5 * 60;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(String),
    #[error("envelope recipient {envelope_recipient} does not match local agent {local}")]
    RecipientMismatch {
        envelope_recipient: String,
        local: String,
    },
    #[error("envelope timestamp is outside the allowed clock skew")]
    ClockSkew,
    #[error("signature verification failed")]
    BadSignature,
    #[error("missing signature")]
    MissingSignature,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("envelope carries no encrypted payload")]
    NotEncrypted,
    #[error("invalid key bytes")]
    InvalidKeyBytes,
    #[error(transparent)]
    Canonical(#[from] crate::canonical::CanonicalError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeType {
    Direct,
    Group,
    Broadcast,
    ContactRequest,
    ContactResponse,
    Revocation,
    Receipt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvelopePayload {
    Encrypted { ciphertext: String, nonce: String },
    Plain(serde_json::Value),
}

/// Every field that participates in the signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeBody {
    pub version: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub message_id: Uuid,
    pub sender: String,
    pub recipient: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub group_id: Option<String>,
    pub payload: EnvelopePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(flatten)]
    pub body: EnvelopeBody,
    pub signature: String, // base64 Ed25519 signature, 64 bytes
}

impl Envelope {
    pub fn sign(body: EnvelopeBody, signer: &SigningKey) -> Result<Self, EnvelopeError> {
        let signable = canonical_json_bytes(&body)?;
        let sig: Signature = signer.sign(&signable);
        Ok(Self {
            body,
            signature: b64(&sig.to_bytes()),
        })
    }

    pub fn verify(&self, sender_sign_pub: &[u8; 32]) -> Result<(), EnvelopeError> {
        let signable = canonical_json_bytes(&self.body)?;
        let vk = VerifyingKey::from_bytes(sender_sign_pub)
            .map_err(|_| EnvelopeError::InvalidKeyBytes)?;
        let sig_bytes = unb64(&self.signature).ok_or(EnvelopeError::MissingSignature)?;
        let sig_arr: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| EnvelopeError::BadSignature)?;
        let sig = Signature::from_bytes(&sig_arr);
        vk.verify_strict(&signable, &sig)
            .map_err(|_| EnvelopeError::BadSignature)
    }

    /// Validate version, recipient binding and clock skew.
    pub fn validate_framing(&self, local_agent: &str, now: DateTime<Utc>) -> Result<(), EnvelopeError> {
        let major = self.body.version.split('.').next().unwrap_or("");
        let expected_major = ENVELOPE_VERSION.split('.').next().unwrap_or("");
        if major != expected_major {
            return Err(EnvelopeError::UnsupportedVersion(self.body.version.clone()));
        }
        if !matches!(self.body.kind, EnvelopeType::Broadcast) && self.body.recipient != local_agent {
            return Err(EnvelopeError::RecipientMismatch {
                envelope_recipient: self.body.recipient.clone(),
                local: local_agent.to_string(),
            });
        }
        let skew = (now - self.body.timestamp).num_seconds().abs();
        if skew > MAX_CLOCK_SKEW_SECS {
            return Err(EnvelopeError::ClockSkew);
        }
        Ok(())
    }
}

/// Derive the pairwise AES-256-GCM key for two usernames sharing an ECDH secret.
pub fn derive_message_key(shared_secret: &[u8; 32], user_a: &str, user_b: &str) -> [u8; 32] {
    let (first, second) = if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    };
    let info = format!("{first}:{second}");
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret);
    let mut key = [0u8; 32];
    hk.expand(info.as_bytes(), &mut key)
        .expect("32-byte output is within HKDF-SHA256's expand limit");
    key
}

pub fn encrypt_payload(
    key: &[u8; 32],
    message_id: Uuid,
    plaintext: &[u8],
) -> Result<EnvelopePayload, EnvelopeError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            AeadPayload {
                msg: plaintext,
                aad: message_id.as_bytes(),
            },
        )
        .map_err(|_| EnvelopeError::EncryptFailed)?;

    Ok(EnvelopePayload::Encrypted {
        ciphertext: b64(&ciphertext),
        nonce: b64(&nonce_bytes),
    })
}

pub fn decrypt_payload(
    key: &[u8; 32],
    message_id: Uuid,
    payload: &EnvelopePayload,
) -> Result<Vec<u8>, EnvelopeError> {
    let (ciphertext_b64, nonce_b64) = match payload {
        EnvelopePayload::Encrypted { ciphertext, nonce } => (ciphertext, nonce),
        EnvelopePayload::Plain(_) => return Err(EnvelopeError::NotEncrypted),
    };
    let ciphertext = unb64(ciphertext_b64).ok_or(EnvelopeError::DecryptFailed)?;
    let nonce_bytes = unb64(nonce_b64).ok_or(EnvelopeError::DecryptFailed)?;
    if nonce_bytes.len() != 12 {
        return Err(EnvelopeError::DecryptFailed);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(&nonce_bytes);

    cipher
        .decrypt(
            nonce,
            AeadPayload {
                msg: &ciphertext,
                aad: message_id.as_bytes(),
            },
        )
        .map_err(|_| EnvelopeError::DecryptFailed)
}

fn b64(bytes: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD.encode(bytes)
}

fn unb64(s: &str) -> Option<Vec<u8>> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD.decode(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn make_body(sender: &str, recipient: &str, payload: EnvelopePayload) -> EnvelopeBody {
        EnvelopeBody {
            version: ENVELOPE_VERSION.to_string(),
            kind: EnvelopeType::Direct,
            message_id: Uuid::new_v4(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            timestamp: Utc::now(),
            group_id: None,
            payload,
        }
    }

    #[test]
    fn round_trip_encrypt_sign_verify_decrypt() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        let shared = alice.key_exchange(&bob.kex_pub());
        let key = derive_message_key(&shared, "alice", "bob");

        let message_id = Uuid::new_v4();
        let plaintext = br#"{"text":"hi bob"}"#;
        let payload = encrypt_payload(&key, message_id, plaintext).unwrap();

        let mut body = make_body("alice", "bob", payload);
        body.message_id = message_id;

        let envelope = Envelope::sign(body, alice.sign_key()).unwrap();
        envelope.verify(&alice.sign_pub()).unwrap();

        let bob_shared = bob.key_exchange(&alice.kex_pub());
        let bob_key = derive_message_key(&bob_shared, "alice", "bob");
        let decrypted =
            decrypt_payload(&bob_key, envelope.body.message_id, &envelope.body.payload).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let alice = Identity::generate();
        let payload = EnvelopePayload::Plain(serde_json::json!({"greeting": "hi"}));
        let body = make_body("alice", "bob", payload);
        let mut envelope = Envelope::sign(body, alice.sign_key()).unwrap();
        envelope.signature.replace_range(0..2, "AA");
        assert!(envelope.verify(&alice.sign_pub()).is_err());
    }

    #[test]
    fn tampered_field_after_signing_is_rejected() {
        let alice = Identity::generate();
        let payload = EnvelopePayload::Plain(serde_json::json!({"greeting": "hi"}));
        let body = make_body("alice", "bob", payload);
        let mut envelope = Envelope::sign(body, alice.sign_key()).unwrap();
        envelope.body.recipient = "carol".to_string();
        assert!(envelope.verify(&alice.sign_pub()).is_err());
    }

    #[test]
    fn wrong_aad_fails_decryption() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let shared = alice.key_exchange(&bob.kex_pub());
        let key = derive_message_key(&shared, "alice", "bob");

        let real_id = Uuid::new_v4();
        let other_id = Uuid::new_v4();
        let payload = encrypt_payload(&key, real_id, b"secret").unwrap();

        assert!(decrypt_payload(&key, other_id, &payload).is_err());
    }

    #[test]
    fn clock_skew_outside_window_is_rejected() {
        let alice = Identity::generate();
        let payload = EnvelopePayload::Plain(serde_json::json!({}));
        let mut body = make_body("alice", "bob", payload);
        body.timestamp = Utc::now() - chrono::Duration::minutes(10);
        let envelope = Envelope::sign(body, alice.sign_key()).unwrap();
        assert!(matches!(
            envelope.validate_framing("bob", Utc::now()),
            Err(EnvelopeError::ClockSkew)
        ));
    }

    #[test]
    fn recipient_mismatch_is_rejected() {
        let alice = Identity::generate();
        let payload = EnvelopePayload::Plain(serde_json::json!({}));
        let body = make_body("alice", "bob", payload);
        let envelope = Envelope::sign(body, alice.sign_key()).unwrap();
        assert!(envelope.validate_framing("carol", Utc::now()).is_err());
    }

    #[test]
    fn derive_message_key_is_symmetric_regardless_of_username_order() {
        let shared = [9u8; 32];
        let k1 = derive_message_key(&shared, "alice", "bob");
        let k2 = derive_message_key(&shared, "bob", "alice");
        assert_eq!(k1, k2);
    }
}
