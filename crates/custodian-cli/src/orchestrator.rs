//! The full `run` flow.
//!
//! Under one lock: back up every source, rotate every configured credential
//! in [`CredentialType::ROTATION_ORDER`], verify the backups just taken,
//! re-check every service a rotation touched, then retire versions whose
//! grace window has ended. The first failure stops the flow; the lock is
//! released on every path.

use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;

use chrono::{DateTime, Utc};
use custodian_backup::{BackupPipeline, VerificationEngine, VerificationReport};
use custodian_core::FailureKind;
use custodian_rotation::{
    CredentialType, CredentialVersion, JobOutcome, RolloutHealthVerifier, RolloutVerdict, RotationController,
    RotationJob,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::context::{Context, LockGuard};
use crate::error::CliError;
use crate::output::{BackupReport, TableDisplay, write_jobs};

/// Stages of a full run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStep {
    /// Lock acquired.
    Locked,
    /// Every source backed up.
    BackedUp,
    /// Every credential rotated.
    Rotated,
    /// Every new backup verified.
    Verified,
    /// Every rotated service healthy.
    HealthChecked,
    /// Expired versions retired.
    Retired,
}

impl fmt::Display for RunStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Locked => "locked",
            Self::BackedUp => "backed-up",
            Self::Rotated => "rotated",
            Self::Verified => "verified",
            Self::HealthChecked => "health-checked",
            Self::Retired => "retired",
        };
        f.write_str(s)
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    /// Failure class.
    pub kind: FailureKind,
    /// Last step that completed; a rotation state when a rotation failed.
    pub last_completed: String,
    /// What went wrong.
    pub message: String,
}

impl From<RunFailure> for CliError {
    fn from(failure: RunFailure) -> Self {
        Self::Failed {
            kind: failure.kind,
            last_step: failure.last_completed,
            message: failure.message,
        }
    }
}

/// Everything a run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: Option<DateTime<Utc>>,
    /// Backups taken.
    pub backups: Vec<BackupReport>,
    /// Rotation jobs, in order.
    pub rotations: Vec<RotationJob>,
    /// Verification of the backups taken.
    pub verifications: Vec<VerificationReport>,
    /// Post-rotation health of every touched service.
    pub health: Vec<RolloutVerdict>,
    /// Versions retired.
    pub retired: Vec<CredentialVersion>,
    /// Last completed stage.
    pub last_completed_step: RunStep,
    /// Set if the run stopped early.
    pub failure: Option<RunFailure>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            backups: Vec::new(),
            rotations: Vec::new(),
            verifications: Vec::new(),
            health: Vec::new(),
            retired: Vec::new(),
            last_completed_step: RunStep::Locked,
            failure: None,
        }
    }

    fn failed_with(&self, kind: FailureKind, message: impl Into<String>) -> RunFailure {
        RunFailure {
            kind,
            last_completed: self.last_completed_step.to_string(),
            message: message.into(),
        }
    }
}

impl TableDisplay for RunReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Backups")?;
        for b in &self.backups {
            let degraded = if b.replication.degraded { " (degraded)" } else { "" };
            writeln!(writer, "  {}  {}{degraded}", b.artifact.id, b.artifact.state)?;
        }
        writeln!(writer)?;
        writeln!(writer, "Rotations")?;
        write_jobs(writer, &self.rotations)?;
        writeln!(writer)?;
        writeln!(writer, "Verification")?;
        for v in &self.verifications {
            let result = if v.is_valid() { "ok" } else { "INVALID" };
            writeln!(writer, "  {}  {result} (from {})", v.backup_id, v.region)?;
        }
        writeln!(writer)?;
        writeln!(writer, "Health")?;
        for verdict in &self.health {
            writeln!(writer, "  {}  {}", verdict.service, verdict.summary())?;
        }
        writeln!(writer)?;
        for v in &self.retired {
            writeln!(writer, "Retired {} v{}", v.credential_type, v.version)?;
        }
        match &self.failure {
            None => writeln!(writer, "Run complete")?,
            Some(f) => writeln!(
                writer,
                "Run FAILED: {} after step '{}': {}",
                f.kind, f.last_completed, f.message
            )?,
        }
        Ok(())
    }
}

/// Drives a full run.
pub struct Orchestrator<'a> {
    context: &'a Context,
    test_restore: bool,
}

struct Components {
    backups: BackupPipeline,
    verification: VerificationEngine,
    rotation: RotationController,
    health: RolloutHealthVerifier,
}

impl<'a> Orchestrator<'a> {
    /// Creates an orchestrator; `test_restore` enables test restores during
    /// verification.
    #[must_use]
    pub const fn new(context: &'a Context, test_restore: bool) -> Self {
        Self { context, test_restore }
    }

    /// Runs the whole flow.
    ///
    /// Returns `Err` only if the lock is held or the components cannot be
    /// built; a failing stage is recorded in the report instead.
    pub async fn run(&self) -> Result<RunReport, CliError> {
        let mut guard = self.context.lock()?;
        let components = Components {
            backups: self.context.backup_pipeline()?,
            verification: self.context.verification()?,
            rotation: self.context.rotation_controller()?,
            health: self.context.health_verifier()?,
        };

        let mut report = RunReport::new();
        if let Err(failure) = self.execute(&components, &mut guard, &mut report).await {
            error!(
                kind = %failure.kind,
                last_completed = %failure.last_completed,
                "run stopped: {}",
                failure.message
            );
            report.failure = Some(failure);
        } else {
            info!(
                backups = report.backups.len(),
                rotations = report.rotations.len(),
                retired = report.retired.len(),
                "run complete"
            );
        }
        report.finished_at = Some(Utc::now());
        drop(guard);
        Ok(report)
    }

    async fn execute(
        &self,
        components: &Components,
        guard: &mut LockGuard,
        report: &mut RunReport,
    ) -> Result<(), RunFailure> {
        let config = self.context.config();

        for source in &config.backup.sources {
            renew(guard, report)?;
            let outcome = components
                .backups
                .run(&source.request())
                .await
                .map_err(|e| report.failed_with(e.kind(), format!("backup of '{}': {e}", source.name)))?;
            report.backups.push(outcome.into());
        }
        report.last_completed_step = RunStep::BackedUp;

        let mut touched = BTreeSet::new();
        for credential_type in CredentialType::ROTATION_ORDER {
            for target in config.targets_of(credential_type) {
                renew(guard, report)?;
                let job = components
                    .rotation
                    .rotate(guard.token(), &target)
                    .await
                    .map_err(|e| report.failed_with(e.kind(), format!("{credential_type} rotation: {e}")))?;
                let failure = rotation_failure(&job);
                report.rotations.push(job);
                if let Some(failure) = failure {
                    return Err(failure);
                }
                touched.insert(target.service);
            }
        }
        report.last_completed_step = RunStep::Rotated;

        let ids: Vec<String> = report.backups.iter().map(|b| b.artifact.id.clone()).collect();
        for id in ids {
            renew(guard, report)?;
            let verification = components
                .verification
                .verify(&id, self.test_restore)
                .await
                .map_err(|e| report.failed_with(e.kind(), format!("verification of '{id}': {e}")))?;
            let valid = verification.is_valid();
            report.verifications.push(verification);
            if !valid {
                return Err(report.failed_with(
                    FailureKind::VerificationFailed,
                    format!("backup '{id}' failed its structure or size check"),
                ));
            }
        }
        report.last_completed_step = RunStep::Verified;

        for service in touched {
            let verdict = components
                .health
                .check(&service, config.health.attempts, config.health.interval())
                .await;
            let healthy = verdict.healthy;
            let summary = verdict.summary();
            report.health.push(verdict);
            if !healthy {
                return Err(report.failed_with(
                    FailureKind::RolloutHealthFailed,
                    format!("service '{service}' {summary}"),
                ));
            }
        }
        report.last_completed_step = RunStep::HealthChecked;

        renew(guard, report)?;
        let retired = components
            .rotation
            .retire_expired(guard.token(), &config.targets(), Utc::now())
            .await
            .map_err(|e| report.failed_with(e.kind(), format!("retirement sweep: {e}")))?;
        report.retired = retired;
        report.last_completed_step = RunStep::Retired;
        Ok(())
    }
}

fn renew(guard: &mut LockGuard, report: &RunReport) -> Result<(), RunFailure> {
    guard
        .renew()
        .map_err(|e| report.failed_with(e.kind(), format!("lock renewal: {e}")))
}

/// The failure of a rotation job that did not succeed.
#[must_use]
pub fn rotation_failure(job: &RotationJob) -> Option<RunFailure> {
    if job.outcome == Some(JobOutcome::Success) {
        return None;
    }
    let last_completed = job
        .last_completed_state()
        .map_or_else(|| "idle".to_string(), |s| s.to_string());
    let failure = match &job.failure {
        Some(f) => RunFailure {
            kind: f.kind.clone(),
            last_completed,
            message: format!("{} rotation {}: {}", job.credential_type, outcome_name(job), f.message),
        },
        None => RunFailure {
            kind: FailureKind::Internal,
            last_completed,
            message: format!("{} rotation {} without a recorded failure", job.credential_type, outcome_name(job)),
        },
    };
    if job.outcome == Some(JobOutcome::Failed) {
        warn!(credential_type = %job.credential_type, "rollback failed; manual intervention required");
    }
    Some(failure)
}

fn outcome_name(job: &RotationJob) -> String {
    job.outcome.map_or_else(|| "unfinished".to_string(), |o| o.to_string())
}
