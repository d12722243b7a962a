//! Append-only journal of finished rotation jobs (`rotation-jobs.json`).

use std::path::Path;
use std::sync::{PoisonError, RwLock};

use custodian_core::JsonStore;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RotationError};
use crate::types::{CredentialType, RotationJob};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    jobs: Vec<RotationJob>,
}

/// Record of every rotation attempt.
#[derive(Debug)]
pub struct JobJournal {
    state: RwLock<Snapshot>,
    store: Option<JsonStore>,
}

impl JobJournal {
    /// Opens `<state_dir>/rotation-jobs.json`.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let store = JsonStore::new(state_dir, "rotation-jobs");
        Ok(Self {
            state: RwLock::new(store.load()?),
            store: Some(store),
        })
    }

    /// A journal that is never written to disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(Snapshot::default()),
            store: None,
        }
    }

    /// Appends a finished job.
    pub fn append(&self, job: &RotationJob) -> Result<()> {
        if !job.is_finished() {
            return Err(RotationError::Config(format!(
                "job {} has no outcome and cannot be journaled",
                job.id
            )));
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.jobs.push(job.clone());
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&*state) {
                state.jobs.pop();
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Every job, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<RotationJob> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).jobs.clone()
    }

    /// The most recent job for `credential_type`.
    #[must_use]
    pub fn latest(&self, credential_type: CredentialType) -> Option<RotationJob> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .jobs
            .iter()
            .rev()
            .find(|j| j.credential_type == credential_type)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobOutcome;
    use custodian_core::{FileLockManager, LockManager};

    #[test]
    fn journals_finished_jobs_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = FileLockManager::new(dir.path().join("locks"), "test")
            .acquire("rotation")
            .expect("lock");

        let journal = JobJournal::open(dir.path()).expect("open");
        let mut running = RotationJob::begin(CredentialType::Jwt, &token);
        assert!(journal.append(&running).is_err());

        running.finish(JobOutcome::Success, None);
        journal.append(&running).expect("append");
        let mut second = RotationJob::begin(CredentialType::Jwt, &token);
        second.finish(JobOutcome::RolledBack, None);
        journal.append(&second).expect("append");

        let reopened = JobJournal::open(dir.path()).expect("reopen");
        assert_eq!(reopened.list().len(), 2);
        assert_eq!(
            reopened.latest(CredentialType::Jwt).and_then(|j| j.outcome),
            Some(JobOutcome::RolledBack)
        );
        assert!(reopened.latest(CredentialType::TlsCert).is_none());
    }
}
