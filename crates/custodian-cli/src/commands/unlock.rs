//! `unlock --force`.

use std::io::Write;

use tracing::warn;

use crate::cli::UnlockArgs;
use crate::context::Context;
use crate::error::CliError;
use crate::output::{OutputFormat, UnlockReport};

/// Manual lock release executor.
pub struct UnlockCommand<'a> {
    context: &'a Context,
}

impl<'a> UnlockCommand<'a> {
    /// Create a new unlock command.
    #[must_use]
    pub const fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Remove the workflow lock. Refuses without `--force` while the lock
    /// is held.
    pub async fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat, args: &UnlockArgs) -> Result<(), CliError> {
        let scope = &self.context.config().lock.scope;
        let locks = self.context.locks();
        let current = locks.inspect(scope)?;

        if !args.force {
            if let Some(token) = current {
                return Err(CliError::InvalidArgument(format!(
                    "lock '{scope}' is held by {} until {}; pass --force to remove it",
                    token.holder(),
                    token.expires_at().to_rfc3339()
                )));
            }
            return format.write(
                writer,
                &UnlockReport {
                    scope: scope.clone(),
                    holder: None,
                    released: false,
                },
            );
        }

        let holder = current.map(|t| t.holder().to_string());
        let released = locks.force_release(scope)?;
        if released {
            warn!(scope = %scope, holder = ?holder, "lock forcibly released");
        }
        format.write(
            writer,
            &UnlockReport {
                scope: scope.clone(),
                holder,
                released,
            },
        )
    }
}
