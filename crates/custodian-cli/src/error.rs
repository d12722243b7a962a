//! CLI error types and exit codes.

use custodian_backup::BackupError;
use custodian_core::{FailureKind, LockError, PersistError};
use custodian_crypto::CryptoError;
use custodian_rotation::RotationError;
use thiserror::Error;

/// CLI-level errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Output formatting error.
    #[error("format error: {0}")]
    Format(String),

    /// Locking failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// A backup operation failed.
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// A rotation could not start.
    #[error(transparent)]
    Rotation(#[from] RotationError),

    /// Crypto setup failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// State file failure.
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// A workflow ran and failed; the report was already printed.
    #[error("{kind} after step '{last_step}': {message}")]
    Failed {
        /// Failure class.
        kind: FailureKind,
        /// Last step that completed.
        last_step: String,
        /// What went wrong.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Failure class of this error.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Lock(e) => e.kind(),
            Self::Backup(e) => e.kind(),
            Self::Rotation(e) => e.kind(),
            Self::Crypto(e) => e.kind(),
            Self::Persist(e) => e.kind(),
            Self::Failed { kind, .. } => kind.clone(),
            Self::Config(_) | Self::InvalidArgument(_) | Self::Format(_) | Self::Io(_) => FailureKind::Internal,
        }
    }

    /// Wraps a workflow error with the last step that completed.
    pub fn after_step(error: impl Into<Self>, last_step: impl std::fmt::Display) -> Self {
        let error = error.into();
        Self::Failed {
            kind: error.kind(),
            last_step: last_step.to_string(),
            message: error.to_string(),
        }
    }

    /// Process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        exit_code(&self.kind())
    }
}

/// Exit code reported for a failure class.
#[must_use]
pub const fn exit_code(kind: &FailureKind) -> u8 {
    match kind {
        FailureKind::Internal => 1,
        FailureKind::LockHeld => 10,
        FailureKind::DumpFailed => 11,
        FailureKind::EncryptionFailed => 12,
        FailureKind::UploadFailed(_) => 13,
        FailureKind::ChecksumMismatch | FailureKind::VerificationFailed => 14,
        FailureKind::SecretPatchFailed => 15,
        FailureKind::RolloutHealthFailed => 16,
        FailureKind::RollbackFailed => 17,
    }
}
