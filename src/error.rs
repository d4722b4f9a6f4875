//! Sealed error taxonomy for the crypto + key-management + access-session core.
//!
//! Every fallible operation in this crate converts its failure into one of
//! the variants below before it crosses a component boundary. Nothing here
//! carries raw error text that could leak key material or internal state —
//! reasons are short, closed-vocabulary strings.

use thiserror::Error;

/// The single error type returned by every public operation in this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Unexpected cryptographic fault that doesn't fit a more specific variant.
    #[error("cryptographic operation failed: {reason}")]
    Crypto { reason: String },

    /// No key for a (doctor, patient) pair, no history entry for a key id,
    /// or an unwrap that could not locate its target key.
    #[error("key not found: {reason}")]
    KeyNotFound { reason: String },

    /// Invalid input (empty plaintext, wrong key length) or an AEAD failure
    /// raised while encrypting.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AEAD authentication failure, key-id mismatch, or malformed blob JSON.
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// Ownership check failed, no valid session, or an expired session.
    /// Deliberately uninformative: callers must not be able to distinguish
    /// "no access" from "no such record" from this message.
    #[error("access denied")]
    AccessDenied,

    /// Rotation was requested without a current key, or persisting the new
    /// wrapped key failed.
    #[error("key rotation failed: {reason}")]
    KeyRotation { reason: String },
}

impl CoreError {
    pub fn crypto(reason: impl Into<String>) -> Self {
        CoreError::Crypto { reason: reason.into() }
    }

    pub fn key_not_found(reason: impl Into<String>) -> Self {
        CoreError::KeyNotFound { reason: reason.into() }
    }

    pub fn encryption(reason: impl Into<String>) -> Self {
        CoreError::Encryption { reason: reason.into() }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        CoreError::Decryption { reason: reason.into() }
    }

    pub fn key_rotation(reason: impl Into<String>) -> Self {
        CoreError::KeyRotation { reason: reason.into() }
    }

    /// Stable, closed-vocabulary code for audit `details` maps. Never embed
    /// `self` (its Display impl) into an audit event that may cross an
    /// untrusted boundary — use this instead.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Crypto { .. } => "crypto_error",
            CoreError::KeyNotFound { .. } => "key_not_found",
            CoreError::Encryption { .. } => "encryption_error",
            CoreError::Decryption { .. } => "decryption_error",
            CoreError::AccessDenied => "access_denied",
            CoreError::KeyRotation { .. } => "key_rotation_error",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
