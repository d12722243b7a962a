//! Error types for key material and encryption.

use std::path::PathBuf;
use std::time::Duration;

use custodian_core::{FailureKind, PersistError};
use thiserror::Error;

/// Errors raised by the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption {
        /// What went wrong.
        reason: String,
    },

    /// Decryption failed (wrong key, tampered data, truncated input).
    #[error("decryption failed: {reason}")]
    Decryption {
        /// What went wrong.
        reason: String,
    },

    /// Key bytes have the wrong shape.
    #[error("invalid key: {reason}")]
    InvalidKey {
        /// What went wrong.
        reason: String,
    },

    /// The KMS refused or failed a request.
    #[error("KMS error: {reason}")]
    Kms {
        /// What went wrong.
        reason: String,
    },

    /// The KMS has no key with this id.
    #[error("unknown KMS key '{key_id}'")]
    UnknownKmsKey {
        /// The requested key id.
        key_id: String,
    },

    /// The envelope bytes do not follow the envelope format.
    #[error("malformed envelope: {reason}")]
    Envelope {
        /// What went wrong.
        reason: String,
    },

    /// A ciphertext names a data key version the keyring does not hold.
    #[error("data key version {version} is not in the keyring")]
    UnknownKeyVersion {
        /// The version tag found in the ciphertext.
        version: u32,
    },

    /// Key or CSR generation failed.
    #[error("material generation failed: {0}")]
    Generation(String),

    /// Certificate issuing or parsing failed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Token signing or verification failed.
    #[error("JWT error: {0}")]
    Jwt(String),

    /// An external call exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The call that timed out.
        operation: &'static str,
        /// The deadline.
        after: Duration,
    },

    /// Filesystem failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Keyring persistence failed.
    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl CryptoError {
    /// Failure class of this error.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Generation(_) | Self::Certificate(_) | Self::Jwt(_) | Self::Persist(_) => {
                FailureKind::Internal
            }
            _ => FailureKind::EncryptionFailed,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
