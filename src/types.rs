//! Value types shared by every component: keys, blobs, sessions, audit events,
//! and the `Persistence` port the core consumes rather than implements.

use std::fmt;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CoreError, CoreResult};

/// Doctor-derived secret. Never serialized, never persisted — only the salt
/// that produced it is durable (see [`Persistence::save_doctor_salt`]).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    pub(crate) secret: [u8; 32],
    #[zeroize(skip)]
    pub salt: [u8; 32],
    #[zeroize(skip)]
    pub algorithm: String,
    #[zeroize(skip)]
    pub iterations: u32,
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
}

impl MasterKey {
    /// First 16 bytes of the secret, hex-encoded. Logging/debugging use only
    /// — never an encryption key-id, and never reveals the full secret.
    pub fn key_id(&self) -> String {
        hex_encode(&self.secret[..16])
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("key_id", &self.key_id())
            .field("secret", &"[REDACTED]")
            .field("algorithm", &self.algorithm)
            .field("iterations", &self.iterations)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Per-patient symmetric key, wrapped under a [`MasterKey`] before it ever
/// touches persistence. Superseded-but-retained after rotation.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    #[zeroize(skip)]
    pub key_id: String,
    pub secret: [u8; 32],
    #[zeroize(skip)]
    pub salt: [u8; 32],
    #[zeroize(skip)]
    pub algorithm: String,
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
    #[zeroize(skip)]
    pub rotated_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey")
            .field("key_id", &self.key_id)
            .field("secret", &"[REDACTED]")
            .field("algorithm", &self.algorithm)
            .field("created_at", &self.created_at)
            .field("rotated_at", &self.rotated_at)
            .finish()
    }
}

impl DataKey {
    pub fn is_rotated(&self) -> bool {
        self.rotated_at.is_some()
    }
}

/// Self-describing authenticated ciphertext. Field names and base64 encoding
/// match the wire format in spec.md §6 exactly: any missing field is a decode
/// error, never a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncryptedBlobWire {
    ciphertext: String,
    nonce: String,
    additional_data: String,
    version: String,
    algorithm: String,
    key_id: String,
}

#[derive(Debug, Clone)]
pub struct EncryptedBlob {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub additional_data: Vec<u8>,
    pub version: String,
    pub algorithm: String,
    pub key_id: String,
}

impl EncryptedBlob {
    pub fn to_json(&self) -> String {
        let wire = EncryptedBlobWire {
            ciphertext: BASE64.encode(&self.ciphertext),
            nonce: BASE64.encode(&self.nonce),
            additional_data: BASE64.encode(&self.additional_data),
            version: self.version.clone(),
            algorithm: self.algorithm.clone(),
            key_id: self.key_id.clone(),
        };
        // A `Vec<u8>`/`String` struct serializes infallibly.
        serde_json::to_string(&wire).expect("EncryptedBlob always serializes")
    }

    pub fn from_json(json: &str) -> CoreResult<Self> {
        let wire: EncryptedBlobWire = serde_json::from_str(json)
            .map_err(|e| CoreError::decryption(format!("malformed blob json: {e}")))?;
        Ok(Self {
            ciphertext: BASE64
                .decode(wire.ciphertext)
                .map_err(|e| CoreError::decryption(format!("bad ciphertext encoding: {e}")))?,
            nonce: BASE64
                .decode(wire.nonce)
                .map_err(|e| CoreError::decryption(format!("bad nonce encoding: {e}")))?,
            additional_data: BASE64
                .decode(wire.additional_data)
                .map_err(|e| CoreError::decryption(format!("bad aad encoding: {e}")))?,
            version: wire.version,
            algorithm: wire.algorithm,
            key_id: wire.key_id,
        })
    }
}

/// Closed set of access levels a session can grant. See spec.md §4.3 for the
/// exhaustive default permission table per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    View,
    Edit,
    Emergency,
}

/// Typed permission set — the enum-and-struct pair spec.md §9 asks for in
/// place of a stringly-typed `access_type` plus `Dict[str, bool]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions {
    pub view_patient_info: bool,
    pub view_medical_records: bool,
    pub view_measurements: bool,
    pub view_prescriptions: bool,
    pub create_records: bool,
    pub edit_records: bool,
    pub delete_records: bool,
    pub export_data: bool,
    pub emergency_access: bool,
}

impl Permissions {
    /// Exhaustive default table from spec.md §4.3.
    pub fn defaults_for(access_type: AccessType) -> Self {
        match access_type {
            AccessType::View => Permissions {
                view_patient_info: true,
                view_medical_records: true,
                view_measurements: true,
                view_prescriptions: true,
                ..Default::default()
            },
            AccessType::Edit => Permissions {
                view_patient_info: true,
                view_medical_records: true,
                view_measurements: true,
                view_prescriptions: true,
                create_records: true,
                edit_records: true,
                export_data: true,
                ..Default::default()
            },
            AccessType::Emergency => Permissions {
                view_patient_info: true,
                view_medical_records: true,
                view_measurements: true,
                view_prescriptions: true,
                create_records: true,
                edit_records: true,
                delete_records: true,
                export_data: true,
                emergency_access: true,
            },
        }
    }
}

/// A capability-style session granting a doctor specific permissions on a
/// patient for a bounded time. See spec.md §4.7 for the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessSession {
    pub session_id: String,
    pub doctor_id: u64,
    pub patient_id: u64,
    pub access_type: AccessType,
    pub permissions: Permissions,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub active: bool,
}

impl AccessSession {
    /// I4: valid iff active and not yet expired. Does not mutate — callers
    /// that must honor the lazy-expiry side effect go through
    /// [`crate::access_manager::AccessManager::validate`].
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.active && now < self.expires_at
    }
}

/// Append-only audit record. `details` is a closed-vocabulary JSON object —
/// never a formatted error string or stack trace (spec.md §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub doctor_id: u64,
    pub patient_id: u64,
    pub action: String,
    pub record_type: Option<String>,
    pub record_id: Option<u64>,
    pub success: bool,
    pub details: serde_json::Value,
}

/// A wrapped data key as it sits in storage: ciphertext plus the salt that
/// was mixed into its plaintext layout, matching spec.md §6's
/// "Wrapped-DataKey storage row".
#[derive(Debug, Clone)]
pub struct StoredWrappedKey {
    pub wrapped: Vec<u8>,
    pub key_salt: Vec<u8>,
    pub crypto_version: String,
}

/// A persisted encrypted record row, as returned by
/// [`Persistence::load_encrypted_record`].
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub patient_id: u64,
    pub blob_json: String,
    pub record_type: String,
    pub created_at: DateTime<Utc>,
}

/// The external collaborator this core consumes: a relational store for
/// doctors/patients/records, reduced to the opaque load/save operations the
/// crypto core actually needs (spec.md §6). Implementations return errors
/// rather than panicking; this crate ships [`crate::persistence::InMemoryPersistence`]
/// as a runnable reference implementation.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load_doctor_salt(&self, doctor_id: u64) -> CoreResult<Option<Vec<u8>>>;
    async fn save_doctor_salt(&self, doctor_id: u64, salt: &[u8]) -> CoreResult<()>;

    async fn load_wrapped_data_key(&self, patient_id: u64) -> CoreResult<Option<StoredWrappedKey>>;
    async fn save_wrapped_data_key(
        &self,
        patient_id: u64,
        wrapped: &[u8],
        key_salt: &[u8],
    ) -> CoreResult<()>;

    async fn save_encrypted_record(
        &self,
        patient_id: u64,
        blob_json: &str,
        record_type: &str,
    ) -> CoreResult<u64>;
    async fn load_encrypted_record(&self, record_id: u64) -> CoreResult<Option<StoredRecord>>;

    async fn append_audit(&self, event: &AuditEvent) -> CoreResult<()>;

    /// Ownership check backing the `AccessDenied` surface in spec.md §4.5 and
    /// §7. An unknown patient must be treated the same as "not owned".
    async fn is_owner(&self, doctor_id: u64, patient_id: u64) -> CoreResult<bool>;

    /// Registers that `doctor_id` owns `patient_id`. Called once, from
    /// `SecuritySystem::setup_patient`.
    async fn record_ownership(&self, doctor_id: u64, patient_id: u64) -> CoreResult<()>;
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}
