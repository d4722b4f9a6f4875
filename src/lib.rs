//! Envelope key management, authenticated encryption, and access-session
//! control for a multi-tenant medical-records engine.
//!
//! There is no process-wide singleton here: a caller builds one
//! [`SecurityContext`] per process (or per test) and threads it through
//! their own application explicitly. Construction follows a fixed order —
//! types and errors have no dependencies; `KeyManager`, `CryptoProvider`,
//! and `AccessManager` depend only on those; `SecuritySystem` composes all
//! three plus a `Persistence` implementation; `Facade` wraps `SecuritySystem`
//! last.

pub mod access_manager;
pub mod audit;
pub mod config;
pub mod crypto_provider;
pub mod error;
pub mod facade;
pub mod key_manager;
pub mod persistence;
pub mod security_system;
pub mod types;

use std::sync::Arc;

pub use access_manager::{AccessManager, LogFilter};
pub use audit::AuditLogger;
pub use config::SecurityConfig;
pub use crypto_provider::{AlgorithmInfo, CryptoProvider};
pub use error::{CoreError, CoreResult};
pub use facade::{DecryptionResult, EncryptionResult, Facade};
pub use key_manager::KeyManager;
pub use persistence::InMemoryPersistence;
pub use security_system::{SecuritySystem, StatisticsSnapshot};
pub use types::{
    AccessSession, AccessType, AuditEvent, DataKey, EncryptedBlob, MasterKey, Permissions,
    Persistence, StoredRecord, StoredWrappedKey,
};

/// Every component, wired together in the order spec.md §9 prescribes:
/// Types → KeyManager → CryptoProvider → AccessManager → SecuritySystem →
/// Facade. Building this once per process is the replacement for the
/// singleton accessors the original exposed.
pub struct SecurityContext {
    pub facade: Arc<Facade>,
    pub system: Arc<SecuritySystem>,
}

impl SecurityContext {
    pub fn new(config: SecurityConfig, persistence: Arc<dyn Persistence>) -> Self {
        let key_manager = Arc::new(KeyManager::new(config.pbkdf2_iterations));
        let crypto_provider = Arc::new(CryptoProvider::new());
        let access_manager = Arc::new(AccessManager::new(config.max_log_entries));
        let audit = Arc::new(AuditLogger::new(config.max_log_entries));

        let system = Arc::new(SecuritySystem::new(
            Arc::clone(&key_manager),
            Arc::clone(&crypto_provider),
            Arc::clone(&access_manager),
            Arc::clone(&audit),
            persistence,
        ));
        let facade = Arc::new(Facade::new(Arc::clone(&system)));

        Self { facade, system }
    }

    /// Convenience for tests and local exploration: an in-memory
    /// `Persistence` implementation with an otherwise-default configuration.
    pub fn in_memory() -> Self {
        let mut config = SecurityConfig::default();
        config.validate();
        Self::new(config, Arc::new(InMemoryPersistence::new()))
    }
}
