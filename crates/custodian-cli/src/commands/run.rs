//! `run`: the full orchestrated flow.

use std::io::Write;

use crate::cli::RunArgs;
use crate::context::Context;
use crate::error::CliError;
use crate::orchestrator::Orchestrator;
use crate::output::OutputFormat;

/// Run command executor.
pub struct RunCommand<'a> {
    context: &'a Context,
}

impl<'a> RunCommand<'a> {
    /// Create a new run command.
    #[must_use]
    pub const fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Execute the run command; the report is printed even when a stage
    /// failed.
    pub async fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat, args: &RunArgs) -> Result<(), CliError> {
        let test_restore = self.context.config().backup.test_restore_on_run && !args.skip_test_restore;
        let report = Orchestrator::new(self.context, test_restore).run().await?;
        format.write(writer, &report)?;
        report.failure.map_or(Ok(()), |f| Err(f.into()))
    }
}
