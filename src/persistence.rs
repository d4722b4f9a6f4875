//! The `Persistence` port and its reference implementation. The crypto core
//! never touches a database directly — it calls through this trait, the way
//! the teacher's own security services call through `FirebaseService`/
//! `DatabaseService` traits rather than talking to Firestore/SQLite inline.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::CoreError;
use crate::types::{AuditEvent, Persistence, StoredRecord, StoredWrappedKey};

/// `tokio::sync::RwLock`-guarded in-memory store. Durable in the sense that
/// every other component in this crate treats it as the source of truth, but
/// it does not outlive the process — a real deployment swaps this out for a
/// `Persistence` backed by its own relational store.
#[derive(Default)]
pub struct InMemoryPersistence {
    doctor_salts: RwLock<HashMap<u64, Vec<u8>>>,
    wrapped_keys: RwLock<HashMap<u64, StoredWrappedKey>>,
    records: RwLock<HashMap<u64, StoredRecord>>,
    next_record_id: RwLock<u64>,
    audit: RwLock<Vec<AuditEvent>>,
    ownership: RwLock<HashSet<(u64, u64)>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every audit event appended so far, oldest first. Intended
    /// for tests that want to assert on what `SecuritySystem` recorded
    /// without going through `AuditLogger`'s own bounded ring.
    pub async fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit.read().await.clone()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn load_doctor_salt(&self, doctor_id: u64) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.doctor_salts.read().await.get(&doctor_id).cloned())
    }

    async fn save_doctor_salt(&self, doctor_id: u64, salt: &[u8]) -> Result<(), CoreError> {
        self.doctor_salts
            .write()
            .await
            .insert(doctor_id, salt.to_vec());
        Ok(())
    }

    async fn load_wrapped_data_key(
        &self,
        patient_id: u64,
    ) -> Result<Option<StoredWrappedKey>, CoreError> {
        Ok(self.wrapped_keys.read().await.get(&patient_id).cloned())
    }

    async fn save_wrapped_data_key(
        &self,
        patient_id: u64,
        wrapped: &[u8],
        key_salt: &[u8],
    ) -> Result<(), CoreError> {
        self.wrapped_keys.write().await.insert(
            patient_id,
            StoredWrappedKey {
                wrapped: wrapped.to_vec(),
                key_salt: key_salt.to_vec(),
                crypto_version: "1".to_string(),
            },
        );
        Ok(())
    }

    async fn save_encrypted_record(
        &self,
        patient_id: u64,
        blob_json: &str,
        record_type: &str,
    ) -> Result<u64, CoreError> {
        let mut next_id = self.next_record_id.write().await;
        let record_id = *next_id;
        *next_id += 1;
        self.records.write().await.insert(
            record_id,
            StoredRecord {
                patient_id,
                blob_json: blob_json.to_string(),
                record_type: record_type.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(record_id)
    }

    async fn load_encrypted_record(&self, record_id: u64) -> Result<Option<StoredRecord>, CoreError> {
        Ok(self.records.read().await.get(&record_id).cloned())
    }

    async fn append_audit(&self, event: &AuditEvent) -> Result<(), CoreError> {
        self.audit.write().await.push(event.clone());
        Ok(())
    }

    async fn is_owner(&self, doctor_id: u64, patient_id: u64) -> Result<bool, CoreError> {
        Ok(self
            .ownership
            .read()
            .await
            .contains(&(doctor_id, patient_id)))
    }

    async fn record_ownership(&self, doctor_id: u64, patient_id: u64) -> Result<(), CoreError> {
        self.ownership.write().await.insert((doctor_id, patient_id));
        Ok(())
    }
}

#[cfg(test)]
pub mod mock {
    //! `mockall`-generated mock of [`Persistence`], for unit tests that need
    //! to assert call patterns rather than observe real state.

    use async_trait::async_trait;
    use mockall::mock;

    use crate::error::CoreError;
    use crate::types::{AuditEvent, Persistence, StoredRecord, StoredWrappedKey};

    mock! {
        pub PersistencePort {}

        #[async_trait]
        impl Persistence for PersistencePort {
            async fn load_doctor_salt(&self, doctor_id: u64) -> Result<Option<Vec<u8>>, CoreError>;
            async fn save_doctor_salt(&self, doctor_id: u64, salt: &[u8]) -> Result<(), CoreError>;
            async fn load_wrapped_data_key(&self, patient_id: u64) -> Result<Option<StoredWrappedKey>, CoreError>;
            async fn save_wrapped_data_key(&self, patient_id: u64, wrapped: &[u8], key_salt: &[u8]) -> Result<(), CoreError>;
            async fn save_encrypted_record(&self, patient_id: u64, blob_json: &str, record_type: &str) -> Result<u64, CoreError>;
            async fn load_encrypted_record(&self, record_id: u64) -> Result<Option<StoredRecord>, CoreError>;
            async fn append_audit(&self, event: &AuditEvent) -> Result<(), CoreError>;
            async fn is_owner(&self, doctor_id: u64, patient_id: u64) -> Result<bool, CoreError>;
            async fn record_ownership(&self, doctor_id: u64, patient_id: u64) -> Result<(), CoreError>;
        }
    }
}
