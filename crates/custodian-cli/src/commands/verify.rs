//! `verify <backup-id> [--test-restore]`.

use std::io::Write;

use custodian_backup::VerifyStage;
use custodian_core::FailureKind;

use crate::cli::VerifyArgs;
use crate::context::Context;
use crate::error::CliError;
use crate::output::OutputFormat;

/// Verify command executor.
pub struct VerifyCommand<'a> {
    context: &'a Context,
}

impl<'a> VerifyCommand<'a> {
    /// Create a new verify command.
    #[must_use]
    pub const fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Verify one backup. A checksum mismatch or a failed structure or size
    /// check exits as a verification failure.
    pub async fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat, args: &VerifyArgs) -> Result<(), CliError> {
        let engine = self.context.verification()?;
        let mut stage = VerifyStage::default();
        let result = engine.verify_tracked(&args.backup_id, args.test_restore, &mut stage).await;
        let report = result.map_err(|e| CliError::after_step(e, stage))?;
        format.write(writer, &report)?;

        if report.is_valid() {
            Ok(())
        } else {
            Err(CliError::Failed {
                kind: FailureKind::VerificationFailed,
                last_step: stage.to_string(),
                message: format!("backup '{}' failed its structure or size check", args.backup_id),
            })
        }
    }
}
