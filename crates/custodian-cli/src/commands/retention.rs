//! `retention-sweep`.

use std::io::Write;

use chrono::Utc;
use custodian_backup::Classification;

use crate::cli::RetentionArgs;
use crate::context::Context;
use crate::error::CliError;
use crate::output::{ClassificationSweep, OutputFormat, SweepReport};

/// Retention sweep executor.
pub struct RetentionCommand<'a> {
    context: &'a Context,
}

impl<'a> RetentionCommand<'a> {
    /// Create a new retention command.
    #[must_use]
    pub const fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Sweep one classification, or all of them, under the workflow lock.
    pub async fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        args: &RetentionArgs,
    ) -> Result<(), CliError> {
        let classifications = match &args.classification {
            Some(name) => vec![
                name.parse::<Classification>()
                    .map_err(|e| CliError::InvalidArgument(e.to_string()))?,
            ],
            None => Classification::ALL.to_vec(),
        };

        let _guard = self.context.lock()?;
        let retention = self.context.retention();
        let policy = self.context.config().backup.retention.policy();
        let now = Utc::now();

        let mut report = SweepReport::default();
        for classification in classifications {
            let older_than_days = args.older_than_days.unwrap_or_else(|| policy.days_for(classification));
            let swept = retention.apply_retention(older_than_days, classification, now).await?;
            report.classifications.push(ClassificationSweep {
                classification: classification.to_string(),
                older_than_days,
                report: swept,
            });
        }
        format.write(writer, &report)
    }
}
