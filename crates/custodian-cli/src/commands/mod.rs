//! CLI command implementations.
//!
//! Each submodule implements one subcommand:
//! - [`backup`] - Back up one source
//! - [`rotate`] - Rotate one credential type
//! - [`verify`] - Verify a stored backup
//! - [`retention`] - Retention sweep
//! - [`run`] - Full orchestrated flow
//! - [`retry_replication`] - Re-copy failed regions
//! - [`retire`] - Retire versions past their grace window
//! - [`unlock`] - Manual lock release
//! - [`status`] - Lock, backups and credentials overview

pub mod backup;
pub mod retention;
pub mod retire;
pub mod retry_replication;
pub mod rotate;
pub mod run;
pub mod status;
pub mod unlock;
pub mod verify;

pub use backup::BackupCommand;
pub use retention::RetentionCommand;
pub use retire::RetireCommand;
pub use retry_replication::RetryReplicationCommand;
pub use rotate::RotateCommand;
pub use run::RunCommand;
pub use status::StatusCommand;
pub use unlock::UnlockCommand;
pub use verify::VerifyCommand;
