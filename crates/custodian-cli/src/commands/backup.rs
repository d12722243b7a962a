//! `backup <source>`.

use std::io::Write;

use custodian_backup::BackupStage;

use crate::cli::BackupArgs;
use crate::context::Context;
use crate::error::CliError;
use crate::output::{BackupReport, OutputFormat};

/// Backup command executor.
pub struct BackupCommand<'a> {
    context: &'a Context,
}

impl<'a> BackupCommand<'a> {
    /// Create a new backup command.
    #[must_use]
    pub const fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Dump, encrypt and replicate the named source under the workflow lock.
    ///
    /// A failed run names the last step it completed.
    pub async fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat, args: &BackupArgs) -> Result<(), CliError> {
        let source = self.context.config().backup.source(&args.source)?;
        let _guard = self.context.lock()?;
        let pipeline = self.context.backup_pipeline()?;

        let mut stage = BackupStage::default();
        let result = pipeline.run_tracked(&source.request(), &mut stage).await;
        let outcome = result.map_err(|e| CliError::after_step(e, stage))?;
        format.write(writer, &BackupReport::from(outcome))
    }
}
