//! `rotate <credential-type>`.
//!
//! Rotates every configured target of one type, stopping at the first job
//! that does not succeed. With `--abandon-staged` it instead discards the
//! version a failed rollback left staged.

use std::io::Write;

use custodian_rotation::CredentialType;
use tracing::warn;

use crate::cli::RotateArgs;
use crate::context::Context;
use crate::error::CliError;
use crate::orchestrator::rotation_failure;
use crate::output::{OutputFormat, RetiredReport, RotationReport};

/// Rotate command executor.
pub struct RotateCommand<'a> {
    context: &'a Context,
}

impl<'a> RotateCommand<'a> {
    /// Create a new rotate command.
    #[must_use]
    pub const fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Execute the rotate command.
    pub async fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat, args: &RotateArgs) -> Result<(), CliError> {
        let credential_type: CredentialType = args
            .credential_type
            .parse()
            .map_err(|e: custodian_rotation::RotationError| CliError::InvalidArgument(e.to_string()))?;

        let mut guard = self.context.lock()?;
        let controller = self.context.rotation_controller()?;

        if args.abandon_staged {
            let discarded = controller.abandon_staged(credential_type)?;
            return format.write(
                writer,
                &RetiredReport {
                    retired: discarded.into_iter().collect(),
                },
            );
        }

        let targets = self.context.config().targets_of(credential_type);
        if targets.is_empty() {
            return Err(CliError::InvalidArgument(format!(
                "no [[rotation.targets]] configured for {credential_type}"
            )));
        }

        let mut report = RotationReport::default();
        let mut failure = None;
        for target in &targets {
            guard.renew()?;
            let job = controller.rotate(guard.token(), target).await?;
            failure = rotation_failure(&job);
            report.jobs.push(job);
            if failure.is_some() {
                warn!(
                    credential_type = %credential_type,
                    skipped = targets.len() - report.jobs.len(),
                    "stopping after unsuccessful rotation"
                );
                break;
            }
        }

        format.write(writer, &report)?;
        failure.map_or(Ok(()), |f| Err(f.into()))
    }
}
