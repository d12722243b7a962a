//! Retention sweeps.
//!
//! An artifact is removed from the catalog only after every region copy is
//! gone. A sweep that deletes only part of an artifact leaves it `expired`
//! with its remaining locations, and the next sweep picks it up again.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use custodian_core::{retry, RetryPolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::error::Result;
use crate::storage::ObjectStorage;
use crate::types::{ArtifactState, BackupArtifact, Classification, StorageLocation};

/// Artifacts younger than this are never deleted.
pub const DEFAULT_SAFETY_MARGIN_HOURS: i64 = 24;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    /// Artifacts fully deleted and dropped from the catalog.
    pub deleted: Vec<String>,
    /// Artifacts with at least one region copy left.
    pub partially_deleted: Vec<String>,
    /// Eligible artifacts skipped because of a live hold.
    pub skipped_held: Vec<String>,
}

/// Applies age-based retention to the catalog.
pub struct RetentionManager {
    catalog: Arc<Catalog>,
    storage: Arc<dyn ObjectStorage>,
    policy: RetryPolicy,
    safety_margin: Duration,
}

impl RetentionManager {
    /// Creates a manager; every region deletion runs under `policy`.
    #[must_use]
    pub fn new(catalog: Arc<Catalog>, storage: Arc<dyn ObjectStorage>, policy: RetryPolicy) -> Self {
        Self {
            catalog,
            storage,
            policy,
            safety_margin: Duration::hours(DEFAULT_SAFETY_MARGIN_HOURS),
        }
    }

    /// Sets the minimum age below which nothing is deleted.
    #[must_use]
    pub const fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    fn is_candidate(
        &self,
        artifact: &BackupArtifact,
        classification: Classification,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        artifact.classification == classification
            && (artifact.state.is_stored() || artifact.state == ArtifactState::Expired)
            && artifact.created_at < cutoff
            && now - artifact.created_at > self.safety_margin
    }

    /// Deletes `classification` artifacts older than `age_threshold_days`.
    pub async fn apply_retention(
        &self,
        age_threshold_days: u32,
        classification: Classification,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport> {
        let cutoff = now - Duration::days(i64::from(age_threshold_days));
        let mut report = RetentionReport::default();

        let candidates: Vec<BackupArtifact> = self
            .catalog
            .list()
            .into_iter()
            .filter(|a| self.is_candidate(a, classification, cutoff, now))
            .collect();
        debug!(%classification, age_threshold_days, candidates = candidates.len(), "retention sweep");

        for artifact in candidates {
            if self.catalog.is_held(&artifact.id, now) {
                info!(backup_id = %artifact.id, "skipping held backup");
                report.skipped_held.push(artifact.id);
                continue;
            }
            if self.expire(&artifact).await? {
                report.deleted.push(artifact.id);
            } else {
                report.partially_deleted.push(artifact.id);
            }
        }

        info!(
            %classification,
            deleted = report.deleted.len(),
            partial = report.partially_deleted.len(),
            held = report.skipped_held.len(),
            "retention sweep complete"
        );
        Ok(report)
    }

    /// Deletes every copy of one artifact. Returns true once it is gone
    /// from the catalog.
    async fn expire(&self, artifact: &BackupArtifact) -> Result<bool> {
        let id = artifact.id.as_str();
        if artifact.state != ArtifactState::Expired {
            self.catalog.update(id, |a| a.transition(ArtifactState::Expired))?;
        }

        let storage = self.storage.as_ref();
        for (region, object) in &artifact.storage_locations {
            let location = StorageLocation::new(region, &object.bucket);
            let (location_ref, key) = (&location, object.key.as_str());
            match retry(&self.policy, move |_| storage.delete(location_ref, key)).await {
                Ok(deleted) => {
                    if !deleted.value {
                        debug!(backup_id = id, %region, "object already absent");
                    }
                    self.catalog.update(id, |a| {
                        a.storage_locations.remove(region);
                        Ok(())
                    })?;
                }
                Err(e) => {
                    warn!(
                        backup_id = id,
                        %region,
                        attempts = e.attempts,
                        error = %e.last_error,
                        "region deletion failed; will retry next sweep"
                    );
                }
            }
        }

        let remaining = self.catalog.get(id)?.storage_locations.len();
        if remaining > 0 {
            warn!(backup_id = id, remaining, "backup partially deleted");
            return Ok(false);
        }

        self.catalog.update(id, |a| a.transition(ArtifactState::Deleted))?;
        self.catalog.remove(id)?;
        info!(backup_id = id, "backup deleted");
        Ok(true)
    }
}

impl std::fmt::Debug for RetentionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionManager")
            .field("policy", &self.policy)
            .field("safety_margin", &self.safety_margin)
            .finish_non_exhaustive()
    }
}
