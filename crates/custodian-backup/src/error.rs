//! Error types for the backup pipeline.

use std::path::PathBuf;

use custodian_core::{FailureKind, PersistError};
use custodian_crypto::CryptoError;
use thiserror::Error;

use crate::storage::StorageError;
use crate::types::{ArtifactState, SourceSystem};

/// Errors raised while backing up, replicating, verifying or expiring.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The dump tool failed; no artifact was produced.
    #[error("{source_system} dump failed: {reason}")]
    DumpFailed {
        /// Engine being dumped.
        source_system: SourceSystem,
        /// What went wrong.
        reason: String,
    },

    /// Encryption or decryption of an artifact failed.
    #[error(transparent)]
    Encryption(#[from] CryptoError),

    /// Upload to a region failed after every retry.
    #[error("upload to region '{region}' failed: {reason}")]
    UploadFailed {
        /// Region.
        region: String,
        /// Last error.
        reason: String,
    },

    /// Decrypted content does not match the catalog checksum.
    #[error("checksum mismatch for backup '{backup_id}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Artifact id.
        backup_id: String,
        /// Checksum recorded at creation.
        expected: String,
        /// Checksum of the downloaded copy.
        actual: String,
    },

    /// A backup could not be verified.
    #[error("verification of backup '{backup_id}' failed: {reason}")]
    VerificationFailed {
        /// Artifact id.
        backup_id: String,
        /// What went wrong.
        reason: String,
    },

    /// A test restore into a disposable target failed.
    #[error("{source_system} test restore failed: {reason}")]
    RestoreFailed {
        /// Engine being restored.
        source_system: SourceSystem,
        /// What went wrong.
        reason: String,
    },

    /// The catalog has no such artifact.
    #[error("backup '{id}' not found")]
    NotFound {
        /// Artifact id.
        id: String,
    },

    /// An artifact was asked to make an illegal state change.
    #[error("backup '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// Artifact id.
        id: String,
        /// Current state.
        from: ArtifactState,
        /// Requested state.
        to: ArtifactState,
    },

    /// Bad request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Object storage failure outside of upload.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Catalog persistence failed.
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// Local filesystem failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl BackupError {
    /// Failure class of this error.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::DumpFailed { .. } => FailureKind::DumpFailed,
            Self::Encryption(e) => e.kind(),
            Self::UploadFailed { region, .. } => FailureKind::UploadFailed(region.clone()),
            Self::ChecksumMismatch { .. } => FailureKind::ChecksumMismatch,
            Self::VerificationFailed { .. } | Self::RestoreFailed { .. } => FailureKind::VerificationFailed,
            Self::NotFound { .. }
            | Self::InvalidTransition { .. }
            | Self::InvalidRequest(_)
            | Self::Storage(_)
            | Self::Persist(_)
            | Self::Io { .. } => FailureKind::Internal,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn dump(source_system: SourceSystem, reason: impl Into<String>) -> Self {
        Self::DumpFailed {
            source_system,
            reason: reason.into(),
        }
    }
}

/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;
