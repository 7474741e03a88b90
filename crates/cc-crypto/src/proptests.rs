use proptest::prelude::*;

use crate::envelope::{decrypt_payload, derive_message_key, encrypt_payload, EnvelopePayload};
use crate::identity::Identity;
use uuid::Uuid;

proptest! {
    /// decrypt(encrypt(p)) == p for arbitrary payloads under a fixed keypair
    /// pair, and tampering with any ciphertext byte breaks decryption.
    #[test]
    fn encrypt_decrypt_round_trips_and_rejects_tamper(
        plaintext in prop::collection::vec(any::<u8>(), 0..256),
        flip_index in any::<usize>(),
    ) {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let shared = alice.key_exchange(&bob.kex_pub());
        let key = derive_message_key(&shared, "alice", "bob");
        let message_id = Uuid::new_v4();

        let payload = encrypt_payload(&key, message_id, &plaintext).unwrap();
        let decrypted = decrypt_payload(&key, message_id, &payload).unwrap();
        prop_assert_eq!(&decrypted, &plaintext);

        if let EnvelopePayload::Encrypted { ciphertext, nonce } = &payload {
            use base64::{engine::general_purpose::STANDARD, Engine};
            let mut bytes = STANDARD.decode(ciphertext).unwrap();
            if !bytes.is_empty() {
                let idx = flip_index % bytes.len();
                bytes[idx] ^= 0x01;
                let tampered = EnvelopePayload::Encrypted {
                    ciphertext: STANDARD.encode(&bytes),
                    nonce: nonce.clone(),
                };
                prop_assert!(decrypt_payload(&key, message_id, &tampered).is_err());
            }
        }
    }

    /// A ciphertext decrypted under the wrong message id (the AAD) is always
    /// rejected, regardless of payload contents.
    #[test]
    fn wrong_message_id_always_rejects(plaintext in prop::collection::vec(any::<u8>(), 0..64)) {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let shared = alice.key_exchange(&bob.kex_pub());
        let key = derive_message_key(&shared, "alice", "bob");

        let real_id = Uuid::new_v4();
        let other_id = Uuid::new_v4();
        let payload = encrypt_payload(&key, real_id, &plaintext).unwrap();
        prop_assert!(decrypt_payload(&key, other_id, &payload).is_err());
    }

    /// derive_message_key's info string is the alphabetically sorted pair, so
    /// argument order must never change the resulting key.
    #[test]
    fn message_key_is_order_independent(a in "[a-z]{1,16}", b in "[a-z]{1,16}") {
        let shared = [3u8; 32];
        prop_assert_eq!(
            crate::envelope::derive_message_key(&shared, &a, &b),
            crate::envelope::derive_message_key(&shared, &b, &a)
        );
    }
}
