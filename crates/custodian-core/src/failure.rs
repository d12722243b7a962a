//! Failure taxonomy.
//!
//! Every crate error maps onto one [`FailureKind`] so the command-line
//! surface can report a stable, distinguishable failure class.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Class of failure surfaced to operators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Another workflow holds the rotation lock.
    LockHeld,
    /// The database dump step failed.
    DumpFailed,
    /// Envelope encryption or decryption failed.
    EncryptionFailed,
    /// Upload to the named region failed.
    UploadFailed(String),
    /// Decrypted backup content does not match the catalog checksum.
    ChecksumMismatch,
    /// A backup failed a structural or size check.
    VerificationFailed,
    /// The secret store rejected or failed a patch.
    SecretPatchFailed,
    /// The consuming service never became healthy after a rollout.
    RolloutHealthFailed,
    /// Rollback itself failed; manual intervention required.
    RollbackFailed,
    /// Anything else (configuration, I/O, invalid input).
    Internal,
}

impl FailureKind {
    /// Returns true if this failure must be escalated to a human and never
    /// retried by automation.
    #[must_use]
    pub const fn requires_operator(&self) -> bool {
        matches!(self, Self::RollbackFailed | Self::ChecksumMismatch)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockHeld => write!(f, "LockHeld"),
            Self::DumpFailed => write!(f, "DumpFailed"),
            Self::EncryptionFailed => write!(f, "EncryptionFailed"),
            Self::UploadFailed(region) => write!(f, "UploadFailed({region})"),
            Self::ChecksumMismatch => write!(f, "ChecksumMismatch"),
            Self::VerificationFailed => write!(f, "VerificationFailed"),
            Self::SecretPatchFailed => write!(f, "SecretPatchFailed"),
            Self::RolloutHealthFailed => write!(f, "RolloutHealthFailed"),
            Self::RollbackFailed => write!(f, "RollbackFailed"),
            Self::Internal => write!(f, "Internal"),
        }
    }
}
