//! `retry-replication <backup-id>`.

use std::io::Write;

use custodian_core::FailureKind;

use crate::cli::RetryReplicationArgs;
use crate::context::Context;
use crate::error::CliError;
use crate::output::OutputFormat;

/// Replication retry executor.
pub struct RetryReplicationCommand<'a> {
    context: &'a Context,
}

impl<'a> RetryReplicationCommand<'a> {
    /// Create a new retry-replication command.
    #[must_use]
    pub const fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Re-copy the failed regions of one backup from its primary.
    pub async fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        args: &RetryReplicationArgs,
    ) -> Result<(), CliError> {
        let _guard = self.context.lock()?;
        let report = self
            .context
            .backup_pipeline()?
            .retry_replication(&args.backup_id)
            .await?;
        format.write(writer, &report)?;

        match report.failed_regions().first() {
            None => Ok(()),
            Some(region) => Err(CliError::Failed {
                kind: FailureKind::UploadFailed((*region).to_string()),
                last_step: "retry-replication".to_string(),
                message: format!("backup '{}' is still degraded", args.backup_id),
            }),
        }
    }
}
