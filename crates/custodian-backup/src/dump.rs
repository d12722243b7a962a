//! Dump collaborators.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{BackupError, Result};
use crate::types::{DumpRequest, SourceSystem};

/// Produces a raw database dump at a given path.
#[async_trait]
pub trait Dumper: Send + Sync {
    /// Writes the dump for `request` to `output`. Failures should be
    /// reported as [`BackupError::DumpFailed`].
    async fn dump(&self, request: &DumpRequest, output: &Path) -> Result<()>;
}

/// A program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Program to run.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
}

/// Dumper that shells out to `pg_dump` and `mongodump`.
#[derive(Debug, Clone)]
pub struct CommandDumper {
    pg_dump: String,
    mongodump: String,
}

impl Default for CommandDumper {
    fn default() -> Self {
        Self {
            pg_dump: "pg_dump".to_string(),
            mongodump: "mongodump".to_string(),
        }
    }
}

impl CommandDumper {
    /// Creates a dumper using the given tool paths.
    #[must_use]
    pub fn new(pg_dump: impl Into<String>, mongodump: impl Into<String>) -> Self {
        Self {
            pg_dump: pg_dump.into(),
            mongodump: mongodump.into(),
        }
    }

    /// Builds the command line for `request`.
    #[must_use]
    pub fn command_for(&self, request: &DumpRequest, output: &Path) -> CommandLine {
        let output = output.display().to_string();
        match request.source_system {
            SourceSystem::Postgres | SourceSystem::Timescale => {
                if request.parallelism > 1 {
                    // Custom format is single-stream; parallel jobs need directory format.
                    debug!(parallelism = request.parallelism, "pg_dump custom format ignores parallelism");
                }
                CommandLine {
                    program: self.pg_dump.clone(),
                    args: vec![
                        "--format=custom".to_string(),
                        format!("--compress={}", request.compression_level),
                        "--no-password".to_string(),
                        format!("--file={output}"),
                        format!("--dbname={}", request.connection),
                    ],
                }
            }
            SourceSystem::Mongo => {
                let mut args = vec![
                    format!("--uri={}", request.connection),
                    format!("--archive={output}"),
                    format!("--numParallelCollections={}", request.parallelism),
                ];
                if request.compression_level > 0 {
                    args.push("--gzip".to_string());
                }
                if request.sharded {
                    args.push("--oplog".to_string());
                }
                CommandLine {
                    program: self.mongodump.clone(),
                    args,
                }
            }
        }
    }
}

#[async_trait]
impl Dumper for CommandDumper {
    async fn dump(&self, request: &DumpRequest, output: &Path) -> Result<()> {
        let command = self.command_for(request, output);
        info!(
            source_system = %request.source_system,
            program = %command.program,
            output = %output.display(),
            "starting dump"
        );

        let result = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackupError::dump(request.source_system, format!("failed to run {}: {e}", command.program)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let last_line = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(BackupError::dump(
                request.source_system,
                format!("{} exited with {}: {last_line}", command.program, result.status),
            ));
        }
        Ok(())
    }
}
