//! KDF, data-key generation, wrap/unwrap, and rotation — the one component
//! that ever touches raw key bytes. Mirrors the teacher's `CryptoService`
//! layout (one lock-guarded cache struct, blocking KDF work kept off the
//! lock) while replacing Argon2 password hashing with PBKDF2-HMAC-SHA256 so
//! wrapped keys already on disk stay readable.

use std::collections::HashMap;
use std::sync::RwLock;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::Utc;
use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{CoreError, CoreResult};
use crate::types::{DataKey, MasterKey};

const MIN_PBKDF2_ITERATIONS: u32 = 100_000;
const SECRET_LEN: usize = 32;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Owns `{master_keys_by_doctor, data_key_cache, key_history}` behind one
/// `RwLock`, per spec.md §5: readers take shared, writers (generate, rotate,
/// evict) take exclusive.
pub struct KeyManager {
    iterations: u32,
    state: RwLock<KeyManagerState>,
}

#[derive(Default)]
struct KeyManagerState {
    master_keys: HashMap<u64, MasterKey>,
    current_keys: HashMap<u64, DataKey>,
    history: HashMap<u64, HashMap<String, DataKey>>,
}

impl KeyManager {
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(MIN_PBKDF2_ITERATIONS),
            state: RwLock::new(KeyManagerState::default()),
        }
    }

    /// PBKDF2-HMAC-SHA256 over `password` and `salt` (freshly sampled if
    /// absent). Blocking — callers on an async runtime should run this
    /// inside `tokio::task::spawn_blocking`.
    pub fn derive_master_key(&self, password: &str, salt: Option<[u8; SALT_LEN]>) -> CoreResult<MasterKey> {
        if password.is_empty() {
            return Err(CoreError::crypto("password must not be empty"));
        }
        let salt = salt.unwrap_or_else(random_salt);
        let secret = pbkdf2_derive(password.as_bytes(), &salt, self.iterations);
        Ok(MasterKey {
            secret,
            salt,
            algorithm: "PBKDF2-HMAC-SHA256".to_string(),
            iterations: self.iterations,
            created_at: Utc::now(),
        })
    }

    /// Re-derives with `master_key.salt` and compares in constant time.
    pub fn verify_password(&self, password: &str, master_key: &MasterKey) -> bool {
        if password.is_empty() {
            return false;
        }
        let candidate = pbkdf2_derive(password.as_bytes(), &master_key.salt, master_key.iterations);
        candidate.ct_eq(&master_key.secret).into()
    }

    /// Fresh secret + salt, cached as the current key for `patient_id` and
    /// recorded in that patient's history.
    pub fn generate_data_key(&self, patient_id: u64) -> DataKey {
        let mut secret = [0u8; SECRET_LEN];
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let key_id = format!(
            "key_{}_{}_{}",
            patient_id,
            Utc::now().timestamp(),
            hex_encode(&random_bytes::<4>())
        );
        let data_key = DataKey {
            key_id,
            secret,
            salt,
            algorithm: "AES-256-GCM".to_string(),
            created_at: Utc::now(),
            rotated_at: None,
        };

        let mut state = self.state.write().expect("key manager lock poisoned");
        state.current_keys.insert(patient_id, data_key.clone());
        state
            .history
            .entry(patient_id)
            .or_default()
            .insert(data_key.key_id.clone(), data_key.clone());
        data_key
    }

    /// AES-256-GCM wrap of `secret(32) || salt(32) || key_id_utf8` under the
    /// master-key secret, no AAD. Output is `nonce(12) || ciphertext+tag`.
    pub fn wrap_data_key(&self, data_key: &DataKey, master_key: &MasterKey) -> CoreResult<Vec<u8>> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&master_key.secret));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut plaintext = Vec::with_capacity(SECRET_LEN + SALT_LEN + data_key.key_id.len());
        plaintext.extend_from_slice(&data_key.secret);
        plaintext.extend_from_slice(&data_key.salt);
        plaintext.extend_from_slice(data_key.key_id.as_bytes());

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| CoreError::crypto("data key wrap failed"))?;

        let mut wrapped = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wrapped.extend_from_slice(&nonce_bytes);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    /// Inverse of [`Self::wrap_data_key`].
    pub fn unwrap_data_key(&self, wrapped: &[u8], master_key: &MasterKey) -> CoreResult<DataKey> {
        if wrapped.len() < NONCE_LEN {
            return Err(CoreError::decryption("wrapped key too short"));
        }
        let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&master_key.secret));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CoreError::decryption("data key unwrap authentication failed"))?;

        if plaintext.len() < SECRET_LEN + SALT_LEN {
            return Err(CoreError::decryption("unwrapped plaintext too short"));
        }
        let secret: [u8; SECRET_LEN] = plaintext[..SECRET_LEN]
            .try_into()
            .expect("slice length checked above");
        let salt: [u8; SALT_LEN] = plaintext[SECRET_LEN..SECRET_LEN + SALT_LEN]
            .try_into()
            .expect("slice length checked above");
        let key_id = String::from_utf8(plaintext[SECRET_LEN + SALT_LEN..].to_vec())
            .map_err(|_| CoreError::decryption("key id is not valid utf-8"))?;

        Ok(DataKey {
            key_id,
            secret,
            salt,
            algorithm: "AES-256-GCM".to_string(),
            created_at: Utc::now(),
            rotated_at: None,
        })
    }

    /// Requires a current key for `patient_id`; marks it rotated in history
    /// and generates + caches a successor.
    pub fn rotate_data_key(&self, patient_id: u64) -> CoreResult<DataKey> {
        let mut state = self.state.write().expect("key manager lock poisoned");
        let current = state
            .current_keys
            .get(&patient_id)
            .cloned()
            .ok_or_else(|| CoreError::key_rotation("no current data key for patient"))?;

        let mut rotated = current.clone();
        rotated.rotated_at = Some(Utc::now());
        state
            .history
            .entry(patient_id)
            .or_default()
            .insert(rotated.key_id.clone(), rotated);

        drop(state);
        Ok(self.generate_data_key(patient_id))
    }

    pub fn get_current_key(&self, patient_id: u64) -> Option<DataKey> {
        self.state
            .read()
            .expect("key manager lock poisoned")
            .current_keys
            .get(&patient_id)
            .cloned()
    }

    pub fn key_history(&self, patient_id: u64) -> HashMap<String, DataKey> {
        self.state
            .read()
            .expect("key manager lock poisoned")
            .history
            .get(&patient_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn cache_master_key(&self, doctor_id: u64, master_key: MasterKey) {
        self.state
            .write()
            .expect("key manager lock poisoned")
            .master_keys
            .insert(doctor_id, master_key);
    }

    pub fn get_master_key(&self, doctor_id: u64) -> Option<MasterKey> {
        self.state
            .read()
            .expect("key manager lock poisoned")
            .master_keys
            .get(&doctor_id)
            .cloned()
    }

    /// Evicts the doctor's master key and that doctor's current-key cache
    /// entries — rotation history is untouched, it belongs to the patient,
    /// not the session.
    pub fn evict_doctor(&self, doctor_id: u64) {
        self.state
            .write()
            .expect("key manager lock poisoned")
            .master_keys
            .remove(&doctor_id);
    }

    pub fn cache_current_key(&self, patient_id: u64, data_key: DataKey) {
        let mut state = self.state.write().expect("key manager lock poisoned");
        state
            .history
            .entry(patient_id)
            .or_default()
            .insert(data_key.key_id.clone(), data_key.clone());
        state.current_keys.insert(patient_id, data_key);
    }

    pub fn evict_patient(&self, patient_id: u64) {
        let mut state = self.state.write().expect("key manager lock poisoned");
        state.current_keys.remove(&patient_id);
        state.history.remove(&patient_id);
    }
}

fn pbkdf2_derive(password: &[u8], salt: &[u8; SALT_LEN], iterations: u32) -> [u8; SECRET_LEN] {
    let mut secret = [0u8; SECRET_LEN];
    pbkdf2::<Hmac<Sha256>>(password, salt, iterations, &mut secret)
        .expect("pbkdf2 output length is fixed and valid");
    secret
}

fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> KeyManager {
        KeyManager::new(100_000)
    }

    #[test]
    fn low_iterations_are_clamped_to_the_floor() {
        let km = KeyManager::new(1);
        assert_eq!(km.iterations, MIN_PBKDF2_ITERATIONS);
    }

    #[test]
    fn empty_password_is_rejected() {
        let km = manager();
        assert!(km.derive_master_key("", None).is_err());
    }

    #[test]
    fn same_password_and_salt_derive_the_same_secret() {
        let km = manager();
        let salt = random_salt();
        let a = km.derive_master_key("hunter2", Some(salt)).unwrap();
        let b = km.derive_master_key("hunter2", Some(salt)).unwrap();
        assert_eq!(a.secret, b.secret);
    }

    #[test]
    fn different_passwords_derive_different_secrets() {
        let km = manager();
        let salt = random_salt();
        let a = km.derive_master_key("hunter2", Some(salt)).unwrap();
        let b = km.derive_master_key("hunter3", Some(salt)).unwrap();
        assert_ne!(a.secret, b.secret);
    }

    #[test]
    fn verify_password_accepts_correct_and_rejects_wrong() {
        let km = manager();
        let master = km.derive_master_key("hunter2", None).unwrap();
        assert!(km.verify_password("hunter2", &master));
        assert!(!km.verify_password("wrong", &master));
    }

    #[test]
    fn wrap_unwrap_round_trips() {
        let km = manager();
        let master = km.derive_master_key("hunter2", None).unwrap();
        let data_key = km.generate_data_key(5);
        let wrapped = km.wrap_data_key(&data_key, &master).unwrap();
        let unwrapped = km.unwrap_data_key(&wrapped, &master).unwrap();
        assert_eq!(unwrapped.secret, data_key.secret);
        assert_eq!(unwrapped.salt, data_key.salt);
        assert_eq!(unwrapped.key_id, data_key.key_id);
    }

    #[test]
    fn unwrap_with_wrong_master_key_fails() {
        let km = manager();
        let master = km.derive_master_key("hunter2", None).unwrap();
        let other = km.derive_master_key("other", None).unwrap();
        let data_key = km.generate_data_key(5);
        let wrapped = km.wrap_data_key(&data_key, &master).unwrap();
        assert!(km.unwrap_data_key(&wrapped, &other).is_err());
    }

    #[test]
    fn rotate_without_current_key_fails() {
        let km = manager();
        assert!(km.rotate_data_key(999).is_err());
    }

    #[test]
    fn rotate_keeps_old_key_in_history() {
        let km = manager();
        let original = km.generate_data_key(5);
        let rotated = km.rotate_data_key(5).unwrap();
        assert_ne!(rotated.key_id, original.key_id);

        let history = km.key_history(5);
        let old = history.get(&original.key_id).unwrap();
        assert!(old.is_rotated());

        let current = km.get_current_key(5).unwrap();
        assert_eq!(current.key_id, rotated.key_id);
    }
}
