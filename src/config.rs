//! Runtime configuration, loaded with the `config` crate. Mirrors the
//! teacher's `SecurityConfig` (defaults + a `Default` impl) but sources
//! values from the environment/files instead of being hardcoded, and adds
//! the validation pass spec.md §6 requires.

use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

/// Environment variables are read with this prefix, e.g.
/// `MEDVAULT_PBKDF2_ITERATIONS=800000`.
const ENV_PREFIX: &str = "MEDVAULT";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityConfig {
    pub default_algorithm: String,
    pub pbkdf2_iterations: u32,
    pub pbkdf2_key_length: usize,
    pub session_expiry_hours: i64,
    pub key_rotation_days: i64,
    pub audit_retention_days: i64,
    pub nonce_length: usize,
    pub max_log_entries: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            default_algorithm: "AES-256-GCM".to_string(),
            pbkdf2_iterations: 600_000,
            pbkdf2_key_length: 32,
            session_expiry_hours: 8,
            key_rotation_days: 90,
            audit_retention_days: 365,
            nonce_length: 12,
            max_log_entries: 10_000,
        }
    }
}

impl SecurityConfig {
    /// Loads defaults, then layers a `medvault.toml` in the current
    /// directory (if present) and `MEDVAULT_*` environment variables on top,
    /// then validates.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let builder = Config::builder()
            .set_default("default_algorithm", defaults.default_algorithm.clone())?
            .set_default("pbkdf2_iterations", defaults.pbkdf2_iterations)?
            .set_default("pbkdf2_key_length", defaults.pbkdf2_key_length as i64)?
            .set_default("session_expiry_hours", defaults.session_expiry_hours)?
            .set_default("key_rotation_days", defaults.key_rotation_days)?
            .set_default("audit_retention_days", defaults.audit_retention_days)?
            .set_default("nonce_length", defaults.nonce_length as i64)?
            .set_default("max_log_entries", defaults.max_log_entries as i64)?
            .add_source(config::File::with_name("medvault").required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("_"));

        let mut parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate();
        Ok(parsed)
    }

    /// Clamps values that would otherwise weaken the cryptography below a
    /// usable floor. Applied unconditionally, including to `Self::default()`
    /// callers who skip `load`.
    pub fn validate(&mut self) {
        if self.pbkdf2_iterations < 100_000 {
            self.pbkdf2_iterations = 100_000;
        }
        if self.pbkdf2_key_length < 32 {
            self.pbkdf2_key_length = 32;
        }
        if self.nonce_length == 0 {
            self.nonce_length = 12;
        }
        if self.max_log_entries == 0 {
            self.max_log_entries = 10_000;
        }
    }
}
