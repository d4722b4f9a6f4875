//! Quantified invariants from spec.md §8 (P1–P4), exercised with proptest
//! over the public `CryptoProvider`/`KeyManager` API rather than hand-picked
//! examples.

use chrono::Utc;
use medvault_core::{CryptoProvider, DataKey, KeyManager};
use proptest::prelude::*;

fn data_key(seed: u8) -> DataKey {
    DataKey {
        key_id: format!("key_5_1700000000_{seed:08x}"),
        secret: [seed; 32],
        salt: [seed.wrapping_add(1); 32],
        algorithm: "AES-256-GCM".to_string(),
        created_at: Utc::now(),
        rotated_at: None,
    }
}

proptest! {
    #[test]
    fn p1_decrypt_of_encrypt_is_identity(plaintext in prop::collection::vec(any::<u8>(), 1..256)) {
        let provider = CryptoProvider::new();
        let key = data_key(7);
        let blob = provider.encrypt(&plaintext, &key, None).unwrap();
        let decrypted = provider.decrypt(&blob, &key).unwrap();
        prop_assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn p2_a_different_data_key_cannot_decrypt(plaintext in prop::collection::vec(any::<u8>(), 1..256), seed in any::<u8>()) {
        let provider = CryptoProvider::new();
        let key_a = data_key(1);
        let mut key_b = data_key(2);
        key_b.secret = [seed.wrapping_add(3); 32];
        key_b.key_id = key_a.key_id.clone();

        let blob = provider.encrypt(&plaintext, &key_a, None).unwrap();
        prop_assert!(provider.decrypt(&blob, &key_b).is_err());
    }

    #[test]
    fn p3_flipping_any_ciphertext_bit_breaks_decryption(
        plaintext in prop::collection::vec(any::<u8>(), 1..64),
        bit_index in 0usize..8,
    ) {
        let provider = CryptoProvider::new();
        let key = data_key(9);
        let mut blob = provider.encrypt(&plaintext, &key, None).unwrap();
        let byte_index = bit_index % blob.ciphertext.len();
        blob.ciphertext[byte_index] ^= 1 << (bit_index % 8);
        prop_assert!(provider.decrypt(&blob, &key).is_err());
    }

    #[test]
    fn p4_same_password_and_salt_always_derive_the_same_secret(
        password in "[a-zA-Z0-9]{1,32}",
    ) {
        let km = KeyManager::new(100_000);
        let salt = [42u8; 32];
        let a = km.derive_master_key(&password, Some(salt)).unwrap();
        let b = km.derive_master_key(&password, Some(salt)).unwrap();
        prop_assert_eq!(a.secret, b.secret);
    }

    #[test]
    fn p4_different_passwords_derive_different_secrets(
        password_a in "[a-zA-Z0-9]{1,32}",
        password_b in "[a-zA-Z0-9]{1,32}",
    ) {
        prop_assume!(password_a != password_b);
        let km = KeyManager::new(100_000);
        let salt = [42u8; 32];
        let a = km.derive_master_key(&password_a, Some(salt)).unwrap();
        let b = km.derive_master_key(&password_b, Some(salt)).unwrap();
        prop_assert_ne!(a.secret, b.secret);
    }
}
