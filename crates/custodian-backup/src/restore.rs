//! Restore collaborators used by test restores.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::info;

use crate::dump::CommandLine;
use crate::error::{BackupError, Result};
use crate::types::SourceSystem;

/// Loads a decrypted dump into an isolated, disposable target.
#[async_trait]
pub trait RestoreTarget: Send + Sync {
    /// Restores the dump at `dump_path`. Failures should be reported as
    /// [`BackupError::RestoreFailed`].
    async fn restore(&self, source_system: SourceSystem, dump_path: &Path) -> Result<()>;
}

/// Restore target that shells out to `pg_restore` and `mongorestore`.
#[derive(Debug, Clone)]
pub struct CommandRestoreTarget {
    pg_restore: String,
    mongorestore: String,
    postgres_target: Option<String>,
    mongo_target: Option<String>,
}

impl CommandRestoreTarget {
    /// Creates a target with no databases configured.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pg_restore: "pg_restore".to_string(),
            mongorestore: "mongorestore".to_string(),
            postgres_target: None,
            mongo_target: None,
        }
    }

    /// Sets the scratch postgres database (also used for timescale).
    #[must_use]
    pub fn with_postgres_target(mut self, connection: impl Into<String>) -> Self {
        self.postgres_target = Some(connection.into());
        self
    }

    /// Sets the scratch mongo deployment.
    #[must_use]
    pub fn with_mongo_target(mut self, connection: impl Into<String>) -> Self {
        self.mongo_target = Some(connection.into());
        self
    }

    /// Overrides the tool paths.
    #[must_use]
    pub fn with_tools(mut self, pg_restore: impl Into<String>, mongorestore: impl Into<String>) -> Self {
        self.pg_restore = pg_restore.into();
        self.mongorestore = mongorestore.into();
        self
    }

    /// Builds the command line, or `None` if no target is configured for
    /// the engine.
    #[must_use]
    pub fn command_for(&self, source_system: SourceSystem, dump_path: &Path, gzip: bool) -> Option<CommandLine> {
        let path = dump_path.display().to_string();
        if source_system.is_postgres_family() {
            let target = self.postgres_target.as_ref()?;
            Some(CommandLine {
                program: self.pg_restore.clone(),
                args: vec![
                    "--clean".to_string(),
                    "--if-exists".to_string(),
                    "--no-owner".to_string(),
                    "--no-privileges".to_string(),
                    "--exit-on-error".to_string(),
                    format!("--dbname={target}"),
                    path,
                ],
            })
        } else {
            let target = self.mongo_target.as_ref()?;
            let mut args = vec![format!("--uri={target}"), format!("--archive={path}"), "--drop".to_string()];
            if gzip {
                args.push("--gzip".to_string());
            }
            Some(CommandLine {
                program: self.mongorestore.clone(),
                args,
            })
        }
    }
}

impl Default for CommandRestoreTarget {
    fn default() -> Self {
        Self::new()
    }
}

async fn is_gzip(path: &Path) -> std::io::Result<bool> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic).await {
        Ok(_) => Ok(magic == [0x1f, 0x8b]),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl RestoreTarget for CommandRestoreTarget {
    async fn restore(&self, source_system: SourceSystem, dump_path: &Path) -> Result<()> {
        let failed = |reason: String| BackupError::RestoreFailed { source_system, reason };

        let gzip = is_gzip(dump_path)
            .await
            .map_err(|e| failed(format!("cannot read {}: {e}", dump_path.display())))?;
        let command = self
            .command_for(source_system, dump_path, gzip)
            .ok_or_else(|| failed(format!("no restore target configured for {source_system}")))?;

        info!(%source_system, program = %command.program, "starting test restore");
        let output = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| failed(format!("failed to run {}: {e}", command.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last_line = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(failed(format!("{} exited with {}: {last_line}", command.program, output.status)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_restore_targets_scratch_database() {
        let target = CommandRestoreTarget::new().with_postgres_target("postgres://scratch/verify");
        let cmd = target
            .command_for(SourceSystem::Timescale, Path::new("/w/d.dump"), false)
            .expect("configured");
        assert_eq!(cmd.program, "pg_restore");
        assert!(cmd.args.contains(&"--dbname=postgres://scratch/verify".to_string()));
        assert_eq!(cmd.args.last().map(String::as_str), Some("/w/d.dump"));
    }

    #[test]
    fn mongo_restore_passes_gzip_through() {
        let target = CommandRestoreTarget::new().with_mongo_target("mongodb://scratch");
        let cmd = target
            .command_for(SourceSystem::Mongo, Path::new("/w/m.archive"), true)
            .expect("configured");
        assert_eq!(cmd.program, "mongorestore");
        assert!(cmd.args.contains(&"--gzip".to_string()));
        assert!(cmd.args.contains(&"--archive=/w/m.archive".to_string()));
    }

    #[test]
    fn unconfigured_engine_has_no_command() {
        let target = CommandRestoreTarget::new().with_postgres_target("postgres://scratch/verify");
        assert!(target.command_for(SourceSystem::Mongo, Path::new("/w/m"), false).is_none());
    }

    #[tokio::test]
    async fn unconfigured_restore_fails_cleanly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dump = dir.path().join("d.dump");
        std::fs::write(&dump, b"PGDMP").expect("write");

        let err = CommandRestoreTarget::new()
            .restore(SourceSystem::Postgres, &dump)
            .await
            .expect_err("no target");
        assert!(matches!(err, BackupError::RestoreFailed { .. }));
    }
}
