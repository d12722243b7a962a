//! Output formatting for CLI commands.
//!
//! Supports table (human-readable) and JSON output formats.

use std::io::Write;

use custodian_backup::{BackupArtifact, BackupOutcome, ReplicationReport, RetentionReport, VerificationReport};
use custodian_rotation::{CredentialType, CredentialVersion, RotationJob};
use serde::Serialize;

use crate::cli::Format;
use crate::error::CliError;

/// Output formatter that handles both table and JSON output.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    format: Format,
}

impl OutputFormat {
    /// Create a new output formatter.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    /// Check if JSON format is selected.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, Format::Json)
    }

    /// Write a serializable value to the output.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), CliError>
    where
        W: Write,
        T: Serialize + TableDisplay,
    {
        match self.format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, value)
                    .map_err(|e| CliError::Format(format!("JSON serialization failed: {e}")))?;
                writeln!(writer)?;
            }
            Format::Table => value.write_table(writer)?,
        }
        Ok(())
    }

    /// Write a serializable value to a string.
    pub fn to_string<T>(&self, value: &T) -> Result<String, CliError>
    where
        T: Serialize + TableDisplay,
    {
        let mut buf = Vec::new();
        self.write(&mut buf, value)?;
        String::from_utf8(buf).map_err(|e| CliError::Format(format!("UTF-8 error: {e}")))
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::new(Format::Table)
    }
}

/// Trait for types that can be displayed as a table.
pub trait TableDisplay {
    /// Write the value as a human-readable table.
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError>;
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}

/// A stored backup and its replication results.
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    /// Catalog record.
    pub artifact: BackupArtifact,
    /// Per-region results.
    pub replication: ReplicationReport,
}

impl From<BackupOutcome> for BackupReport {
    fn from(outcome: BackupOutcome) -> Self {
        Self {
            artifact: outcome.artifact,
            replication: outcome.replication,
        }
    }
}

impl TableDisplay for BackupReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        let a = &self.artifact;
        writeln!(writer, "Backup {}", a.id)?;
        writeln!(writer, "══════════════════════════════════")?;
        writeln!(writer, "Source:           {}", a.source_system)?;
        writeln!(writer, "Created:          {}", a.created_at.to_rfc3339())?;
        writeln!(writer, "Size:             {} bytes", a.size_bytes)?;
        writeln!(writer, "Checksum:         {}", a.checksum)?;
        writeln!(writer, "Classification:   {}", a.classification)?;
        writeln!(writer, "State:            {}", a.state)?;
        if let Some(expires) = a.retention_expires_at {
            writeln!(writer, "Expires:          {}", expires.to_rfc3339())?;
        }
        writeln!(writer)?;
        self.replication.write_table(writer)
    }
}

impl TableDisplay for ReplicationReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(
            writer,
            "{:<20}  {:<24}  {:<10}  {:>8}  {:>12}",
            "REGION", "BUCKET", "STATUS", "ATTEMPTS", "SIZE"
        )?;
        writeln!(writer, "{}", "─".repeat(82))?;
        for result in self.results.values() {
            let primary = if result.region == self.primary.region { " *" } else { "" };
            writeln!(
                writer,
                "{:<20}  {:<24}  {:<10}  {:>8}  {:>12}",
                format!("{}{primary}", result.region),
                result.bucket,
                if result.succeeded() { "ok" } else { "failed" },
                result.attempts,
                result.size_bytes.map_or_else(|| "-".to_string(), |s| s.to_string())
            )?;
            if let Some(error) = &result.error {
                writeln!(writer, "    {error}")?;
            }
        }
        if self.degraded {
            writeln!(writer)?;
            writeln!(
                writer,
                "DEGRADED: run `custodian retry-replication {}` once the failed regions recover",
                self.artifact_id
            )?;
        }
        Ok(())
    }
}

impl TableDisplay for VerificationReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Verification of {}", self.backup_id)?;
        writeln!(writer, "══════════════════════════════════")?;
        writeln!(writer, "Region:           {}", self.region)?;
        writeln!(writer, "Checksum:         {} (match)", self.checksum)?;
        writeln!(writer, "Structure:        {}", if self.structure_ok { "ok" } else { "INVALID" })?;
        writeln!(writer, "Size:             {}", if self.size_ok { "ok" } else { "MISMATCH" })?;
        let restore = match self.restore_ok {
            Some(true) => "ok",
            Some(false) => "failed",
            None => "not run",
        };
        writeln!(writer, "Test restore:     {restore}")?;
        writeln!(writer, "Verified:         {}", yes_no(self.is_valid()))?;
        Ok(())
    }
}

/// Result of a retention sweep across classifications.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Per-classification results.
    pub classifications: Vec<ClassificationSweep>,
}

/// Result of sweeping one classification.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationSweep {
    /// Classification swept.
    pub classification: String,
    /// Age threshold applied.
    pub older_than_days: u32,
    /// Deleted, partially deleted and held artifacts.
    #[serde(flatten)]
    pub report: RetentionReport,
}

impl SweepReport {
    /// Ids of fully deleted artifacts.
    #[must_use]
    pub fn deleted(&self) -> Vec<&str> {
        self.classifications
            .iter()
            .flat_map(|c| c.report.deleted.iter().map(String::as_str))
            .collect()
    }
}

impl TableDisplay for SweepReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(
            writer,
            "{:<14}  {:>10}  {:>8}  {:>8}  {:>6}",
            "CLASS", "OLDER THAN", "DELETED", "PARTIAL", "HELD"
        )?;
        writeln!(writer, "{}", "─".repeat(54))?;
        for c in &self.classifications {
            writeln!(
                writer,
                "{:<14}  {:>9}d  {:>8}  {:>8}  {:>6}",
                c.classification,
                c.older_than_days,
                c.report.deleted.len(),
                c.report.partially_deleted.len(),
                c.report.skipped_held.len()
            )?;
        }
        for c in &self.classifications {
            for id in &c.report.partially_deleted {
                writeln!(writer, "partially deleted, retried next sweep: {id}")?;
            }
        }
        Ok(())
    }
}

/// Rotation jobs run by one command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RotationReport {
    /// Jobs in execution order.
    pub jobs: Vec<RotationJob>,
}

pub(crate) fn write_jobs<W: Write>(writer: &mut W, jobs: &[RotationJob]) -> Result<(), CliError> {
    if jobs.is_empty() {
        writeln!(writer, "No rotations run")?;
        return Ok(());
    }
    writeln!(
        writer,
        "{:<14}  {:>7}  {:<11}  {:<12}  {}",
        "TYPE", "VERSION", "OUTCOME", "LAST STEP", "DETAIL"
    )?;
    writeln!(writer, "{}", "─".repeat(80))?;
    for job in jobs {
        let version = job.version.map_or_else(|| "-".to_string(), |v| format!("v{v}"));
        let outcome = job.outcome.map_or_else(|| "running".to_string(), |o| o.to_string());
        let last = job
            .last_completed_state()
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        let detail = job
            .failure
            .as_ref()
            .map(|f| format!("{} in {}: {}", f.kind, f.state, f.message))
            .unwrap_or_default();
        writeln!(
            writer,
            "{:<14}  {:>7}  {:<11}  {:<12}  {detail}",
            job.credential_type.to_string(),
            version,
            outcome,
            last
        )?;
    }
    Ok(())
}

impl TableDisplay for RotationReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        write_jobs(writer, &self.jobs)
    }
}

/// Versions retired by a sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetiredReport {
    /// Retired versions.
    pub retired: Vec<CredentialVersion>,
}

impl TableDisplay for RetiredReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.retired.is_empty() {
            writeln!(writer, "No versions past their grace window")?;
            return Ok(());
        }
        for v in &self.retired {
            writeln!(writer, "retired {} v{} ({})", v.credential_type, v.version, v.fingerprint)?;
        }
        Ok(())
    }
}

/// Result of `unlock`.
#[derive(Debug, Clone, Serialize)]
pub struct UnlockReport {
    /// Lock scope.
    pub scope: String,
    /// Holder found in the lock file.
    pub holder: Option<String>,
    /// Whether a lock file was removed.
    pub released: bool,
}

impl TableDisplay for UnlockReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        match (&self.holder, self.released) {
            (Some(holder), true) => writeln!(writer, "Released lock '{}' held by {holder}", self.scope)?,
            (_, true) => writeln!(writer, "Released lock '{}'", self.scope)?,
            (_, false) => writeln!(writer, "Lock '{}' was not held", self.scope)?,
        }
        Ok(())
    }
}

/// Lock holder as shown by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    /// Lock scope.
    pub scope: String,
    /// Holder identity, if locked.
    pub holder: Option<String>,
    /// Lock expiry, if locked.
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Versions of one credential type.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    /// Credential type.
    pub credential_type: CredentialType,
    /// Active version.
    pub active: Option<CredentialVersion>,
    /// Versions in their grace window.
    pub retiring: Vec<CredentialVersion>,
    /// Version left staged by an interrupted rotation.
    pub staged: Option<CredentialVersion>,
    /// Most recent rotation job.
    pub last_job: Option<RotationJob>,
}

/// Output of `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Workflow lock.
    pub lock: LockStatus,
    /// Catalogued backups, newest first.
    pub backups: Vec<BackupArtifact>,
    /// Credential versions per type.
    pub credentials: Vec<CredentialStatus>,
}

impl TableDisplay for StatusReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Custodian Status")?;
        writeln!(writer, "══════════════════════════════════")?;
        match (&self.lock.holder, self.lock.expires_at) {
            (Some(holder), Some(expires)) => writeln!(
                writer,
                "Lock '{}':  held by {holder} until {}",
                self.lock.scope,
                expires.to_rfc3339()
            )?,
            _ => writeln!(writer, "Lock '{}':  free", self.lock.scope)?,
        }
        writeln!(writer)?;

        writeln!(writer, "Backups")?;
        if self.backups.is_empty() {
            writeln!(writer, "  none")?;
        } else {
            writeln!(
                writer,
                "  {:<40}  {:<10}  {:<8}  {:<10}  {:>8}  {:>8}",
                "ID", "SOURCE", "CLASS", "STATE", "VERIFIED", "DEGRADED"
            )?;
            for a in &self.backups {
                writeln!(
                    writer,
                    "  {:<40}  {:<10}  {:<8}  {:<10}  {:>8}  {:>8}",
                    a.id,
                    a.source_system.to_string(),
                    a.classification.to_string(),
                    a.state.to_string(),
                    yes_no(a.verified),
                    yes_no(a.degraded)
                )?;
            }
        }
        writeln!(writer)?;

        writeln!(writer, "Credentials")?;
        for c in &self.credentials {
            let active = c
                .active
                .as_ref()
                .map_or_else(|| "none".to_string(), |v| format!("v{} ({})", v.version, v.fingerprint));
            writeln!(writer, "  {:<14}  active {active}", c.credential_type.to_string())?;
            for v in &c.retiring {
                let until = v.retire_after.map(|t| t.to_rfc3339()).unwrap_or_default();
                writeln!(writer, "  {:<14}  retiring v{} until {until}", "", v.version)?;
            }
            if let Some(v) = &c.staged {
                writeln!(
                    writer,
                    "  {:<14}  STAGED v{} (rollback failed? see `custodian rotate {} --abandon-staged`)",
                    "", v.version, c.credential_type
                )?;
            }
            if let Some(job) = &c.last_job {
                let outcome = job.outcome.map_or_else(|| "running".to_string(), |o| o.to_string());
                writeln!(writer, "  {:<14}  last job {outcome} at {}", "", job.started_at.to_rfc3339())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verification(structure_ok: bool) -> VerificationReport {
        VerificationReport {
            backup_id: "postgres-20260101T000000Z-ab12".into(),
            region: "eu-west-1".into(),
            structure_ok,
            size_ok: true,
            restore_ok: None,
            checksum: "00ff".into(),
        }
    }

    #[test]
    fn json_output_is_the_serde_form() {
        let out = OutputFormat::new(Format::Json)
            .to_string(&verification(true))
            .expect("render");
        let value: serde_json::Value = serde_json::from_str(&out).expect("json");
        assert_eq!(value["region"], "eu-west-1");
        assert_eq!(value["restore_ok"], serde_json::Value::Null);
    }

    #[test]
    fn table_output_flags_invalid_structure() {
        let out = OutputFormat::default().to_string(&verification(false)).expect("render");
        assert!(out.contains("Structure:        INVALID"));
        assert!(out.contains("Verified:         no"));
    }

    #[test]
    fn empty_reports_say_so() {
        let format = OutputFormat::default();
        assert!(format.to_string(&RotationReport::default()).expect("render").contains("No rotations run"));
        assert!(
            format
                .to_string(&RetiredReport::default())
                .expect("render")
                .contains("No versions past their grace window")
        );
    }

    #[test]
    fn unlock_report_names_previous_holder() {
        let report = UnlockReport {
            scope: "custodian".into(),
            holder: Some("ops-1:42".into()),
            released: true,
        };
        let out = OutputFormat::default().to_string(&report).expect("render");
        assert_eq!(out, "Released lock 'custodian' held by ops-1:42\n");
    }
}
