//! Error types for credential rotation.

use std::path::PathBuf;

use custodian_core::{FailureKind, LockError, PersistError};
use custodian_crypto::CryptoError;
use thiserror::Error;

use crate::types::{CredentialType, VersionStatus};

/// Errors raised by the rotation components.
#[derive(Debug, Error)]
pub enum RotationError {
    /// Lock acquisition or validation failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The job's lock token has expired.
    #[error("lock token {token} expired; renew before rotating")]
    LockExpired {
        /// Token display form.
        token: String,
    },

    /// Another rotation of the same type has a staged version.
    #[error("a {credential_type} rotation is already in progress (v{version} staged)")]
    ConcurrentRotation {
        /// Credential kind.
        credential_type: CredentialType,
        /// The staged version.
        version: u32,
    },

    /// Material generation or certificate issuing failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The secret store rejected or failed a patch.
    #[error("patch of secret '{secret}' failed: {reason}")]
    SecretPatch {
        /// Secret reference.
        secret: String,
        /// What went wrong.
        reason: String,
    },

    /// Optimistic concurrency check failed.
    #[error("secret '{secret}' changed concurrently: expected revision {expected}, found {actual}")]
    RevisionConflict {
        /// Secret reference.
        secret: String,
        /// Revision the patch was based on.
        expected: u64,
        /// Revision found in the store.
        actual: u64,
    },

    /// The secret store could not be read.
    #[error("secret store error for '{secret}': {reason}")]
    SecretStore {
        /// Secret reference.
        secret: String,
        /// What went wrong.
        reason: String,
    },

    /// The service did not become healthy after a rollout.
    #[error("rollout of '{service}' unhealthy: {reason}")]
    RolloutHealth {
        /// Service name.
        service: String,
        /// What the probes reported.
        reason: String,
    },

    /// A deployment operation failed.
    #[error("deployment of '{service}' failed: {reason}")]
    Deployment {
        /// Service name.
        service: String,
        /// What went wrong.
        reason: String,
    },

    /// A database administration call failed.
    #[error("database role '{role}': {reason}")]
    Database {
        /// Login role.
        role: String,
        /// What went wrong.
        reason: String,
    },

    /// The endpoint presents a certificate other than the one issued.
    #[error("'{service}' presents certificate {actual}, expected {expected}")]
    CertificateMismatch {
        /// Service name.
        service: String,
        /// Fingerprint of the issued certificate.
        expected: String,
        /// Fingerprint seen on the endpoint.
        actual: String,
    },

    /// A collaborator call did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The call that timed out.
        operation: String,
        /// The deadline that elapsed.
        after: std::time::Duration,
        /// Failure class the timed-out step belongs to.
        kind: FailureKind,
    },

    /// Rolling back a failed rotation failed.
    #[error("rollback failed after '{original}': {reason}")]
    RollbackFailed {
        /// The failure that triggered rollback.
        original: String,
        /// Why rollback failed.
        reason: String,
    },

    /// A registry operation was not legal in the version's status.
    #[error("{credential_type} v{version} is {status}; cannot {operation}")]
    InvalidVersionState {
        /// Credential kind.
        credential_type: CredentialType,
        /// Version.
        version: u32,
        /// Current status.
        status: VersionStatus,
        /// Attempted operation.
        operation: &'static str,
    },

    /// No such version in the registry.
    #[error("{credential_type} v{version} not found")]
    UnknownVersion {
        /// Credential kind.
        credential_type: CredentialType,
        /// Version.
        version: u32,
    },

    /// Bad or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Persistence failed.
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

impl RotationError {
    /// Failure class of this error.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Lock(e) => e.kind(),
            Self::LockExpired { .. } => FailureKind::LockHeld,
            Self::SecretPatch { .. } | Self::RevisionConflict { .. } | Self::SecretStore { .. } => {
                FailureKind::SecretPatchFailed
            }
            Self::RolloutHealth { .. }
            | Self::Deployment { .. }
            | Self::Database { .. }
            | Self::CertificateMismatch { .. } => FailureKind::RolloutHealthFailed,
            Self::Timeout { kind, .. } => kind.clone(),
            Self::RollbackFailed { .. } => FailureKind::RollbackFailed,
            Self::Crypto(e) => e.kind(),
            Self::ConcurrentRotation { .. }
            | Self::InvalidVersionState { .. }
            | Self::UnknownVersion { .. }
            | Self::Config(_)
            | Self::Persist(_)
            | Self::Io { .. } => FailureKind::Internal,
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: std::time::Duration, kind: FailureKind) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
            kind,
        }
    }
}

/// Result type alias for rotation operations.
pub type Result<T> = std::result::Result<T, RotationError>;
