//! Credential versions, rotation jobs and their steps.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use custodian_core::{FailureKind, LockToken};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RotationError};

/// Kind of credential under rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialType {
    /// Ed25519 JWT signing key.
    Jwt,
    /// 256-bit data-encryption key.
    SymmetricKey,
    /// Database login password.
    DbPassword,
    /// TLS certificate and key.
    TlsCert,
}

impl CredentialType {
    /// Rotation order used by a full run.
    pub const ROTATION_ORDER: [Self; 4] = [Self::Jwt, Self::SymmetricKey, Self::DbPassword, Self::TlsCert];

    /// Canonical name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Jwt => "jwt",
            Self::SymmetricKey => "symmetric-key",
            Self::DbPassword => "db-password",
            Self::TlsCert => "tls-cert",
        }
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialType {
    type Err = RotationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "jwt" => Ok(Self::Jwt),
            "symmetric-key" | "symmetric" | "dek" => Ok(Self::SymmetricKey),
            "db-password" | "db" | "database" => Ok(Self::DbPassword),
            "tls-cert" | "tls" => Ok(Self::TlsCert),
            other => Err(RotationError::Config(format!("unknown credential type '{other}'"))),
        }
    }
}

/// Lifecycle of one credential version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    /// Generated, not yet in use.
    Staged,
    /// Used for new operations.
    Active,
    /// Still accepted until its grace window ends.
    Retiring,
    /// No longer accepted.
    Retired,
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Staged => "staged",
            Self::Active => "active",
            Self::Retiring => "retiring",
            Self::Retired => "retired",
        };
        f.write_str(s)
    }
}

/// Registry record of one credential version. Never holds material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialVersion {
    /// Credential kind.
    pub credential_type: CredentialType,
    /// Monotonic version, starting at 1.
    pub version: u32,
    /// When the material was generated.
    pub created_at: DateTime<Utc>,
    /// When it became active.
    pub activated_at: Option<DateTime<Utc>>,
    /// When it was retired.
    pub retired_at: Option<DateTime<Utc>>,
    /// End of the grace window of a retiring version.
    pub retire_after: Option<DateTime<Utc>>,
    /// Lifecycle status.
    pub status: VersionStatus,
    /// Fingerprint of the public part or a truncated digest of the secret.
    pub fingerprint: String,
    /// Database login role holding this version's password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_role: Option<String>,
    /// The secret object (`namespace/name`) this version was written to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// States of a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationState {
    /// No rotation in progress.
    Idle,
    /// Producing new material.
    Generating,
    /// Version staged, patch composed, snapshot taken.
    Staged,
    /// Patch being written to the secret store.
    Applying,
    /// Consumers reloading.
    RollingOut,
    /// Waiting for consumers to prove the new credential works.
    Verifying,
    /// New version active.
    Finalized,
    /// Undoing a failed rotation.
    RollingBack,
}

impl fmt::Display for RotationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Generating => "generating",
            Self::Staged => "staged",
            Self::Applying => "applying",
            Self::RollingOut => "rolling-out",
            Self::Verifying => "verifying",
            Self::Finalized => "finalized",
            Self::RollingBack => "rolling-back",
        };
        f.write_str(s)
    }
}

/// One executed step of a rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    /// State the step ran in.
    pub state: RotationState,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
    /// Whether the step succeeded.
    pub ok: bool,
    /// Human-readable summary; never contains material.
    pub detail: String,
}

/// Final outcome of a rotation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobOutcome {
    /// New version active.
    Success,
    /// A step failed and the pre-rotation state was restored.
    RolledBack,
    /// Rollback failed; manual intervention required.
    Failed,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::RolledBack => write!(f, "rolledBack"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Failure class.
    pub kind: FailureKind,
    /// State the failure occurred in.
    pub state: RotationState,
    /// Error message.
    pub message: String,
}

/// One rotation attempt for one credential type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationJob {
    /// Job id.
    pub id: Uuid,
    /// Credential kind.
    pub credential_type: CredentialType,
    /// Version staged by this job, once one was.
    pub version: Option<u32>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time, set with the outcome.
    pub finished_at: Option<DateTime<Utc>>,
    /// Lock token the job ran under (`scope:uuid`).
    pub lock_token: String,
    /// Executed steps, in order.
    pub steps: Vec<StepResult>,
    /// Outcome; `None` while running.
    pub outcome: Option<JobOutcome>,
    /// Failure that triggered rollback, or the rollback failure itself.
    pub failure: Option<JobFailure>,
}

impl RotationJob {
    /// Starts a job under `token`.
    #[must_use]
    pub fn begin(credential_type: CredentialType, token: &LockToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            credential_type,
            version: None,
            started_at: Utc::now(),
            finished_at: None,
            lock_token: token.to_string(),
            steps: Vec::new(),
            outcome: None,
            failure: None,
        }
    }

    /// Records a step.
    pub fn record(&mut self, state: RotationState, started_at: DateTime<Utc>, ok: bool, detail: impl Into<String>) {
        self.steps.push(StepResult {
            state,
            started_at,
            finished_at: Utc::now(),
            ok,
            detail: detail.into(),
        });
    }

    /// Sets the outcome. Later calls are ignored: a finished job is immutable.
    pub fn finish(&mut self, outcome: JobOutcome, failure: Option<JobFailure>) {
        if self.outcome.is_some() {
            return;
        }
        self.outcome = Some(outcome);
        self.failure = failure;
        self.finished_at = Some(Utc::now());
    }

    /// Last state that completed successfully.
    #[must_use]
    pub fn last_completed_state(&self) -> Option<RotationState> {
        self.steps.iter().rev().find(|s| s.ok).map(|s| s.state)
    }

    /// Returns true once an outcome was recorded.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }
}
