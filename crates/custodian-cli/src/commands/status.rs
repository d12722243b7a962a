//! `status`.
//!
//! Shows:
//! - The workflow lock holder
//! - Catalogued backups
//! - Credential versions and the last rotation job per type

use std::io::Write;

use custodian_rotation::CredentialType;

use crate::context::Context;
use crate::error::CliError;
use crate::output::{CredentialStatus, LockStatus, OutputFormat, StatusReport};

/// Status command executor.
pub struct StatusCommand<'a> {
    context: &'a Context,
}

impl<'a> StatusCommand<'a> {
    /// Create a new status command.
    #[must_use]
    pub const fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Execute the status command.
    pub async fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let status = self.collect()?;
        format.write(writer, &status)
    }

    /// Gather the status without taking the lock.
    pub fn collect(&self) -> Result<StatusReport, CliError> {
        let scope = self.context.config().lock.scope.clone();
        let token = self.context.locks().inspect(&scope)?;
        let lock = LockStatus {
            scope,
            holder: token.as_ref().map(|t| t.holder().to_string()),
            expires_at: token.as_ref().map(custodian_core::LockToken::expires_at),
        };

        let mut backups = self.context.catalog().list();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let registry = self.context.registry()?;
        let journal = self.context.journal()?;
        let credentials = CredentialType::ROTATION_ORDER
            .into_iter()
            .map(|t| CredentialStatus {
                credential_type: t,
                active: registry.active(t),
                retiring: registry.retiring(t),
                staged: registry.staged(t),
                last_job: journal.latest(t),
            })
            .collect();

        Ok(StatusReport {
            lock,
            backups,
            credentials,
        })
    }
}
