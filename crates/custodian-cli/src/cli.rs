//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Custodian - encrypted backups and zero-downtime credential rotation.
#[derive(Parser, Debug, Clone)]
#[command(name = "custodian")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "CUSTODIAN_CONFIG", default_value = "/etc/custodian/custodian.toml")]
    pub config: PathBuf,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    pub format: Format,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, env = "CUSTODIAN_LOG_JSON")]
    pub log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Back up one configured source: dump, encrypt, replicate, catalog.
    Backup(BackupArgs),

    /// Rotate every configured credential of one type.
    Rotate(RotateArgs),

    /// Download, decrypt and check a stored backup.
    Verify(VerifyArgs),

    /// Delete backups past their retention period.
    RetentionSweep(RetentionArgs),

    /// Full flow: backup, rotate all types, verify, retire expired versions.
    Run(RunArgs),

    /// Re-copy the failed secondary regions of a degraded backup.
    RetryReplication(RetryReplicationArgs),

    /// Remove credential versions whose grace window has ended.
    RetireExpired,

    /// Release the workflow lock held by a crashed run.
    Unlock(UnlockArgs),

    /// Show lock holder, backups and credential versions.
    Status,
}

/// Arguments for `backup`.
#[derive(Args, Debug, Clone)]
pub struct BackupArgs {
    /// Name of a `[[backup.sources]]` entry.
    pub source: String,
}

/// Arguments for `rotate`.
#[derive(Args, Debug, Clone)]
pub struct RotateArgs {
    /// Credential type: jwt, symmetric-key, db-password or tls-cert.
    pub credential_type: String,

    /// Discard the version a failed rollback left staged instead of rotating.
    #[arg(long)]
    pub abandon_staged: bool,
}

/// Arguments for `verify`.
#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    /// Backup id.
    pub backup_id: String,

    /// Also load the dump into the disposable restore target.
    #[arg(long)]
    pub test_restore: bool,
}

/// Arguments for `retention-sweep`.
#[derive(Args, Debug, Clone)]
pub struct RetentionArgs {
    /// Sweep only this classification (daily, weekly, monthly).
    #[arg(long)]
    pub classification: Option<String>,

    /// Override the configured age threshold, in days.
    #[arg(long)]
    pub older_than_days: Option<u32>,
}

/// Arguments for `run`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Skip the test restore during post-run verification.
    #[arg(long)]
    pub skip_test_restore: bool,
}

/// Arguments for `retry-replication`.
#[derive(Args, Debug, Clone)]
pub struct RetryReplicationArgs {
    /// Backup id.
    pub backup_id: String,
}

/// Arguments for `unlock`.
#[derive(Args, Debug, Clone)]
pub struct UnlockArgs {
    /// Remove the lock even though its holder may still be alive.
    #[arg(long)]
    pub force: bool,
}
