//! AEAD over record payloads. Stateless — no locks, no key management; a
//! `DataKey` is supplied by the caller for every call, per spec.md §4.2.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::Utc;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};
use crate::types::{DataKey, EncryptedBlob};

const NONCE_LEN: usize = 12;
const DEFAULT_VERSION: &str = "1.0";

pub struct AlgorithmInfo {
    pub name: &'static str,
    pub key_length: usize,
    pub nonce_length: usize,
    pub tag_length: usize,
}

pub struct CryptoProvider;

impl Default for CryptoProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoProvider {
    pub fn new() -> Self {
        CryptoProvider
    }

    /// Encrypts `plaintext` under `data_key`. `aad` defaults to a canonical
    /// `{key_id, algorithm, created_at_iso8601, salt_hash16}` document when
    /// absent (spec.md §4.2).
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        data_key: &DataKey,
        aad: Option<&[u8]>,
    ) -> CoreResult<EncryptedBlob> {
        if plaintext.is_empty() {
            return Err(CoreError::encryption("plaintext must not be empty"));
        }

        let owned_default_aad;
        let aad_bytes: &[u8] = match aad {
            Some(a) => a,
            None => {
                owned_default_aad = default_aad(data_key)?;
                &owned_default_aad
            }
        };

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&data_key.secret));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                aes_gcm::aead::Payload {
                    msg: plaintext,
                    aad: aad_bytes,
                },
            )
            .map_err(|_| CoreError::encryption("AES-256-GCM encryption failed"))?;

        Ok(EncryptedBlob {
            ciphertext,
            nonce: nonce_bytes.to_vec(),
            additional_data: aad_bytes.to_vec(),
            version: DEFAULT_VERSION.to_string(),
            algorithm: "AES-256-GCM".to_string(),
            key_id: data_key.key_id.clone(),
        })
    }

    /// Refuses a `key_id` mismatch before attempting the AEAD call (spec.md
    /// §4.2 and I3) — the caller has already picked the wrong `DataKey`.
    pub fn decrypt(&self, blob: &EncryptedBlob, data_key: &DataKey) -> CoreResult<Vec<u8>> {
        if !blob.key_id.is_empty() && blob.key_id != data_key.key_id {
            return Err(CoreError::decryption("blob key id does not match data key"));
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&data_key.secret));
        let nonce = Nonce::from_slice(&blob.nonce);

        cipher
            .decrypt(
                nonce,
                aes_gcm::aead::Payload {
                    msg: &blob.ciphertext,
                    aad: &blob.additional_data,
                },
            )
            .map_err(|_| CoreError::decryption("AES-256-GCM authentication failed"))
    }

    pub fn supported_algorithms(&self) -> Vec<&'static str> {
        vec!["AES-256-GCM", "AES-128-GCM"]
    }

    pub fn algorithm_info(&self, name: &str) -> Option<AlgorithmInfo> {
        match name {
            "AES-256-GCM" => Some(AlgorithmInfo {
                name: "AES-256-GCM",
                key_length: 32,
                nonce_length: 12,
                tag_length: 16,
            }),
            "AES-128-GCM" => Some(AlgorithmInfo {
                name: "AES-128-GCM",
                key_length: 16,
                nonce_length: 12,
                tag_length: 16,
            }),
            _ => None,
        }
    }

    /// Encrypts a JSON-serializable value as its canonical string form.
    pub fn encrypt_json<T: Serialize>(
        &self,
        value: &T,
        data_key: &DataKey,
        aad: Option<&[u8]>,
    ) -> CoreResult<EncryptedBlob> {
        let json = serde_json::to_vec(value)
            .map_err(|e| CoreError::encryption(format!("failed to serialize value: {e}")))?;
        self.encrypt(&json, data_key, aad)
    }

    /// Reads `path`, base64-encodes its bytes, encrypts the resulting
    /// string, and writes the blob JSON to `path` + `.enc`. Loads the whole
    /// file into memory — a convenience, not a streaming API.
    pub fn encrypt_file(&self, path: &std::path::Path, data_key: &DataKey) -> CoreResult<std::path::PathBuf> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

        let raw = std::fs::read(path).map_err(|e| CoreError::encryption(format!("read failed: {e}")))?;
        let encoded = BASE64.encode(raw);
        let blob = self.encrypt(encoded.as_bytes(), data_key, None)?;

        let out_path = append_extension(path, "enc");
        std::fs::write(&out_path, blob.to_json())
            .map_err(|e| CoreError::encryption(format!("write failed: {e}")))?;
        Ok(out_path)
    }

    /// Inverse of [`Self::encrypt_file`]: reads a `.enc` blob, decrypts it,
    /// base64-decodes the plaintext, and writes it to `path` with the
    /// trailing `.enc` removed.
    pub fn decrypt_file(&self, enc_path: &std::path::Path, data_key: &DataKey) -> CoreResult<std::path::PathBuf> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

        let json = std::fs::read_to_string(enc_path)
            .map_err(|e| CoreError::decryption(format!("read failed: {e}")))?;
        let blob = EncryptedBlob::from_json(&json)?;
        let encoded = self.decrypt(&blob, data_key)?;
        let raw = BASE64
            .decode(encoded)
            .map_err(|e| CoreError::decryption(format!("bad base64 payload: {e}")))?;

        let out_path = strip_extension(enc_path, "enc");
        std::fs::write(&out_path, raw)
            .map_err(|e| CoreError::decryption(format!("write failed: {e}")))?;
        Ok(out_path)
    }
}

#[derive(Serialize)]
struct DefaultAad<'a> {
    key_id: &'a str,
    algorithm: &'a str,
    created_at_iso8601: String,
    salt_hash16: String,
}

fn default_aad(data_key: &DataKey) -> CoreResult<Vec<u8>> {
    let mut hasher = Sha256::new();
    hasher.update(data_key.salt);
    let digest = hasher.finalize();
    let salt_hash16 = hex_prefix16(&digest);

    let aad = DefaultAad {
        key_id: &data_key.key_id,
        algorithm: &data_key.algorithm,
        created_at_iso8601: data_key.created_at.to_rfc3339(),
        salt_hash16,
    };
    serde_json::to_vec(&aad).map_err(|e| CoreError::encryption(format!("failed to build default aad: {e}")))
}

fn hex_prefix16(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(16);
    for b in bytes {
        if s.len() >= 16 {
            break;
        }
        let _ = write!(s, "{:02x}", b);
    }
    s.truncate(16);
    s
}

fn append_extension(path: &std::path::Path, ext: &str) -> std::path::PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    std::path::PathBuf::from(s)
}

fn strip_extension(path: &std::path::Path, ext: &str) -> std::path::PathBuf {
    let s = path.to_string_lossy();
    match s.strip_suffix(&format!(".{ext}")) {
        Some(stripped) => std::path::PathBuf::from(stripped),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    fn sample_data_key() -> DataKey {
        let mut secret = [0u8; 32];
        let mut salt = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        rand::rngs::OsRng.fill_bytes(&mut salt);
        DataKey {
            key_id: "key_5_1700000000_abcd1234".to_string(),
            secret,
            salt,
            algorithm: "AES-256-GCM".to_string(),
            created_at: Utc::now(),
            rotated_at: None,
        }
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let provider = CryptoProvider::new();
        let data_key = sample_data_key();
        let blob = provider.encrypt(b"AD 140/90", &data_key, None).unwrap();
        let plaintext = provider.decrypt(&blob, &data_key).unwrap();
        assert_eq!(plaintext, b"AD 140/90");
    }

    #[test]
    fn decrypting_with_a_different_key_fails() {
        let provider = CryptoProvider::new();
        let data_key = sample_data_key();
        let mut other_key = sample_data_key();
        other_key.key_id = data_key.key_id.clone();
        let blob = provider.encrypt(b"AD 140/90", &data_key, None).unwrap();
        assert!(provider.decrypt(&blob, &other_key).is_err());
    }

    #[test]
    fn flipping_a_ciphertext_bit_breaks_decryption() {
        let provider = CryptoProvider::new();
        let data_key = sample_data_key();
        let mut blob = provider.encrypt(b"AD 140/90", &data_key, None).unwrap();
        let last = blob.ciphertext.len() - 1;
        blob.ciphertext[last] ^= 0x01;
        assert!(provider.decrypt(&blob, &data_key).is_err());
    }

    #[test]
    fn empty_plaintext_is_rejected() {
        let provider = CryptoProvider::new();
        let data_key = sample_data_key();
        assert!(provider.encrypt(b"", &data_key, None).is_err());
    }

    #[test]
    fn mismatched_key_id_is_rejected_before_aead() {
        let provider = CryptoProvider::new();
        let data_key = sample_data_key();
        let mut blob = provider.encrypt(b"AD 140/90", &data_key, None).unwrap();
        blob.key_id = "key_5_1700000000_other000".to_string();
        assert!(provider.decrypt(&blob, &data_key).is_err());
    }

    #[test]
    fn blob_json_round_trips() {
        let provider = CryptoProvider::new();
        let data_key = sample_data_key();
        let blob = provider.encrypt(b"AD 140/90", &data_key, None).unwrap();
        let json = blob.to_json();
        let parsed = EncryptedBlob::from_json(&json).unwrap();
        assert_eq!(parsed.ciphertext, blob.ciphertext);
        assert_eq!(parsed.key_id, blob.key_id);
    }

    #[test]
    fn file_round_trip() {
        let provider = CryptoProvider::new();
        let data_key = sample_data_key();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        std::fs::write(&path, b"patient notes").unwrap();

        let enc_path = provider.encrypt_file(&path, &data_key).unwrap();
        std::fs::remove_file(&path).unwrap();

        let decrypted_path = provider.decrypt_file(&enc_path, &data_key).unwrap();
        let contents = std::fs::read(&decrypted_path).unwrap();
        assert_eq!(contents, b"patient notes");
        // `dir` drops at the end of the test, taking every file under it with it.
    }

    #[test]
    fn algorithm_info_covers_both_supported_algorithms() {
        let provider = CryptoProvider::new();
        assert!(provider.algorithm_info("AES-256-GCM").is_some());
        assert!(provider.algorithm_info("AES-128-GCM").is_some());
        assert!(provider.algorithm_info("ChaCha20-Poly1305").is_none());
    }
}
