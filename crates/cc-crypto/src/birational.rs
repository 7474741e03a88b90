//! Derives an X25519 key-exchange keypair from an Ed25519 signing keypair.
//!
//! An agent carries a single long-lived Ed25519 identity key. Deriving X25519
//! from it (rather than generating an independent key, as most sealed-box
//! designs do) means there is only one secret to protect and rotate.
//!
//! The public-key conversion is the standard Edwards->Montgomery birational
//! map; the private scalar uses the same seed-expansion clamping Ed25519
//! itself uses internally (RFC 8032 §5.1.5 step 1, RFC 7748 §5 clamping).
//! This matches the conversion `libsodium` ships as
//! `crypto_sign_ed25519_{sk,pk}_to_curve25519`.

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

#[derive(Debug, thiserror::Error)]
pub enum DeriveError {
    #[error("ed25519 public key does not decompress to a valid curve point")]
    InvalidPoint,
}

/// Derive the X25519 static secret from an Ed25519 signing key's seed.
pub fn derive_x25519_secret(sign_key: &SigningKey) -> StaticSecret {
    let seed = sign_key.to_bytes();
    let mut hasher = Sha512::new();
    hasher.update(seed);
    let hash = hasher.finalize();

    let mut scalar_bytes = [0u8; 32];
    scalar_bytes.copy_from_slice(&hash[..32]);
    clamp(&mut scalar_bytes);

    StaticSecret::from(scalar_bytes)
}

/// Derive the X25519 public key from an Ed25519 verifying key.
pub fn derive_x25519_public(verify_key: &VerifyingKey) -> Result<X25519PublicKey, DeriveError> {
    let compressed = CompressedEdwardsY(verify_key.to_bytes());
    let point = compressed.decompress().ok_or(DeriveError::InvalidPoint)?;
    let montgomery = point.to_montgomery();
    Ok(X25519PublicKey::from(montgomery.to_bytes()))
}

fn clamp(bytes: &mut [u8; 32]) {
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn derived_keys_agree_both_directions() {
        let a = SigningKey::generate(&mut OsRng);
        let b = SigningKey::generate(&mut OsRng);

        let a_secret = derive_x25519_secret(&a);
        let b_secret = derive_x25519_secret(&b);

        let a_pub = derive_x25519_public(&a.verifying_key()).unwrap();
        let b_pub = derive_x25519_public(&b.verifying_key()).unwrap();

        assert_eq!(X25519PublicKey::from(&a_secret).as_bytes(), a_pub.as_bytes());
        assert_eq!(X25519PublicKey::from(&b_secret).as_bytes(), b_pub.as_bytes());

        let shared_a = a_secret.diffie_hellman(&b_pub);
        let shared_b = b_secret.diffie_hellman(&a_pub);
        assert_eq!(shared_a.as_bytes(), shared_b.as_bytes());
    }

    #[test]
    fn derivation_is_deterministic() {
        let key = SigningKey::generate(&mut OsRng);
        let s1 = derive_x25519_secret(&key);
        let s2 = derive_x25519_secret(&key);
        assert_eq!(
            X25519PublicKey::from(&s1).as_bytes(),
            X25519PublicKey::from(&s2).as_bytes()
        );
    }
}
