//! A stable, UI-oriented surface over `SecuritySystem`: opaque doctor,
//! patient, and record registries, monotonic record ids, a session cache by
//! id, and result objects in place of thrown errors (spec.md §4.6).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::access_manager::LogFilter;
use crate::security_system::SecuritySystem;
use crate::types::{AccessSession, AccessType, AuditEvent, Permissions};

#[derive(Debug, Clone)]
pub struct EncryptionResult {
    pub success: bool,
    pub record_id: Option<u64>,
    pub encrypted_data: Option<String>,
    pub error: Option<String>,
}

impl EncryptionResult {
    fn ok(record_id: u64, encrypted_data: String) -> Self {
        Self {
            success: true,
            record_id: Some(record_id),
            encrypted_data: Some(encrypted_data),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            record_id: None,
            encrypted_data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecryptionResult {
    pub success: bool,
    pub plaintext: Option<Vec<u8>>,
    pub metadata: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl DecryptionResult {
    fn ok(plaintext: Vec<u8>, metadata: serde_json::Value) -> Self {
        Self {
            success: true,
            plaintext: Some(plaintext),
            metadata: Some(metadata),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            plaintext: None,
            metadata: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone)]
struct DoctorEntry {
    doctor_id: u64,
}

#[derive(Debug, Clone)]
struct PatientEntry {
    patient_id: u64,
    doctor_id: u64,
    record_ids: Vec<u64>,
}

/// Opaque, facade-local registries. These are the only state this crate
/// keeps purely in memory — wrapped data keys and ciphertext records always
/// round-trip through `Persistence` (spec.md §9: the in-memory-only variant
/// of the original facade is explicitly disallowed).
pub struct Facade {
    system: Arc<SecuritySystem>,
    doctors: RwLock<HashMap<u64, DoctorEntry>>,
    patients: RwLock<HashMap<u64, PatientEntry>>,
    sessions: RwLock<HashMap<String, AccessSession>>,
}

impl Facade {
    pub fn new(system: Arc<SecuritySystem>) -> Self {
        Self {
            system,
            doctors: RwLock::new(HashMap::new()),
            patients: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_doctor(&self, doctor_id: u64, password: &str) -> bool {
        match self.system.setup_doctor(doctor_id, password).await {
            Ok(()) => {
                self.doctors
                    .write()
                    .expect("facade lock poisoned")
                    .insert(doctor_id, DoctorEntry { doctor_id });
                true
            }
            Err(_) => false,
        }
    }

    pub async fn login(&self, doctor_id: u64, password: &str) -> bool {
        self.system.login_doctor(doctor_id, password).await.unwrap_or(false)
    }

    pub async fn logout(&self, doctor_id: u64) {
        self.system.logout_doctor(doctor_id).await;
    }

    pub async fn register_patient(&self, doctor_id: u64, patient_id: u64) -> bool {
        match self.system.setup_patient(doctor_id, patient_id).await {
            Ok(()) => {
                self.patients.write().expect("facade lock poisoned").insert(
                    patient_id,
                    PatientEntry {
                        patient_id,
                        doctor_id,
                        record_ids: Vec::new(),
                    },
                );
                true
            }
            Err(_) => false,
        }
    }

    pub async fn rotate_patient_key(&self, doctor_id: u64, patient_id: u64) -> bool {
        self.system.rotate_patient_key(doctor_id, patient_id).await.is_ok()
    }

    /// Issues a session through `SecuritySystem` (so the live session
    /// counter in `statistics()` stays accurate) and caches it locally for
    /// lookup by id.
    pub fn create_session(
        &self,
        doctor_id: u64,
        patient_id: u64,
        access_type: AccessType,
        permissions: Option<Permissions>,
        duration_hours: f64,
    ) -> AccessSession {
        let session = self
            .system
            .create_session(doctor_id, patient_id, access_type, permissions, duration_hours);
        self.sessions
            .write()
            .expect("facade lock poisoned")
            .insert(session.session_id.clone(), session.clone());
        session
    }

    pub fn get_session(&self, session_id: &str) -> Option<AccessSession> {
        self.system.access_manager().get(session_id)
    }

    pub fn revoke_session(&self, session_id: &str) -> bool {
        self.sessions.write().expect("facade lock poisoned").remove(session_id);
        self.system.access_manager().revoke(session_id)
    }

    /// Encrypts `plaintext` and persists the ciphertext via `Persistence`,
    /// which mints the canonical record id this returns. Never throws —
    /// failures surface as `EncryptionResult { success: false, .. }`.
    pub async fn add_medical_record(
        &self,
        doctor_id: u64,
        patient_id: u64,
        record_type: &str,
        plaintext: &[u8],
    ) -> EncryptionResult {
        let blob_json = match self
            .system
            .encrypt_patient_data(doctor_id, patient_id, plaintext, None)
            .await
        {
            Ok(json) => json,
            Err(err) => return EncryptionResult::err(err.to_string()),
        };

        let record_id = match self.system.store_record(patient_id, &blob_json, record_type).await {
            Ok(id) => id,
            Err(err) => return EncryptionResult::err(err.to_string()),
        };

        if let Some(patient) = self
            .patients
            .write()
            .expect("facade lock poisoned")
            .get_mut(&patient_id)
        {
            patient.record_ids.push(record_id);
        }

        EncryptionResult::ok(record_id, blob_json)
    }

    /// Loads the persisted record by id and decrypts it. Never throws —
    /// failures (unknown id, denied access, tampered ciphertext) surface as
    /// `DecryptionResult { success: false, .. }`.
    pub async fn read_medical_record(&self, doctor_id: u64, patient_id: u64, record_id: u64) -> DecryptionResult {
        let stored = match self.system.load_record(record_id).await {
            Ok(stored) => stored,
            Err(err) => return DecryptionResult::err(err.to_string()),
        };

        match self
            .system
            .decrypt_patient_data(doctor_id, patient_id, &stored.blob_json)
            .await
        {
            Ok(plaintext) => DecryptionResult::ok(
                plaintext,
                serde_json::json!({ "patient_id": patient_id, "record_type": stored.record_type }),
            ),
            Err(err) => DecryptionResult::err(err.to_string()),
        }
    }

    pub fn patient_record_ids(&self, patient_id: u64) -> Vec<u64> {
        self.patients
            .read()
            .expect("facade lock poisoned")
            .get(&patient_id)
            .map(|p| p.record_ids.clone())
            .unwrap_or_default()
    }

    pub fn access_logs(&self, filter: &LogFilter, limit: usize, offset: usize) -> Vec<AuditEvent> {
        self.system.access_manager().get_logs(filter, limit, offset)
    }

    pub fn active_sessions(&self) -> Vec<AccessSession> {
        self.system.access_manager().active_sessions()
    }

    pub fn statistics(&self) -> crate::security_system::StatisticsSnapshot {
        self.system.statistics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_manager::AccessManager;
    use crate::audit::AuditLogger;
    use crate::crypto_provider::CryptoProvider;
    use crate::key_manager::KeyManager;
    use crate::persistence::InMemoryPersistence;

    fn facade() -> Facade {
        let system = Arc::new(SecuritySystem::new(
            Arc::new(KeyManager::new(100_000)),
            Arc::new(CryptoProvider::new()),
            Arc::new(AccessManager::new(1_000)),
            Arc::new(AuditLogger::new(1_000)),
            Arc::new(InMemoryPersistence::new()),
        ));
        Facade::new(system)
    }

    #[tokio::test]
    async fn add_and_read_a_medical_record() {
        let f = facade();
        assert!(f.register_doctor(1, "SecureDoctorPass123").await);
        assert!(f.register_patient(1, 5).await);

        let result = f.add_medical_record(1, 5, "vitals", b"AD 140/90").await;
        assert!(result.success);
        assert_eq!(f.patient_record_ids(5), vec![result.record_id.unwrap()]);

        let read = f.read_medical_record(1, 5, result.record_id.unwrap()).await;
        assert!(read.success);
        assert_eq!(read.plaintext.unwrap(), b"AD 140/90");
    }

    #[tokio::test]
    async fn unregistered_patient_never_panics_just_fails() {
        let f = facade();
        f.register_doctor(1, "SecureDoctorPass123").await;
        let result = f.add_medical_record(1, 999, "vitals", b"data").await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn session_created_through_facade_is_retrievable() {
        let f = facade();
        f.register_doctor(1, "SecureDoctorPass123").await;
        f.register_patient(1, 5).await;
        let session = f.create_session(1, 5, AccessType::View, None, 8.0);
        assert!(f.get_session(&session.session_id).is_some());
        assert!(f.revoke_session(&session.session_id));
        assert!(!f.revoke_session(&session.session_id));
    }
}
