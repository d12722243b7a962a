//! `retire-expired`.

use std::io::Write;

use chrono::Utc;

use crate::context::Context;
use crate::error::CliError;
use crate::output::{OutputFormat, RetiredReport};

/// Retirement sweep executor.
pub struct RetireCommand<'a> {
    context: &'a Context,
}

impl<'a> RetireCommand<'a> {
    /// Create a new retire command.
    #[must_use]
    pub const fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Retire every version whose grace window has ended.
    pub async fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let guard = self.context.lock()?;
        let retired = self
            .context
            .rotation_controller()?
            .retire_expired(guard.token(), &self.context.config().targets(), Utc::now())
            .await?;
        format.write(writer, &RetiredReport { retired })
    }
}
