//! Backup pipeline: dump, encrypt, replicate, catalog.

use std::sync::Arc;

use chrono::Duration;
use custodian_crypto::EncryptionPipeline;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::catalog::Catalog;
use crate::engine::BackupEngine;
use crate::error::{BackupError, Result};
use crate::replication::ReplicationManager;
use crate::types::{
    ArtifactState, BackupArtifact, BackupStage, Classification, DumpRequest, ReplicationReport, StorageLocation,
};

/// Retention period per classification, in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Daily backups.
    pub daily_days: u32,
    /// Weekly backups.
    pub weekly_days: u32,
    /// Monthly backups.
    pub monthly_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily_days: 7,
            weekly_days: 35,
            monthly_days: 365,
        }
    }
}

impl RetentionPolicy {
    /// Days to keep a backup of `classification`.
    #[must_use]
    pub const fn days_for(&self, classification: Classification) -> u32 {
        match classification {
            Classification::Daily => self.daily_days,
            Classification::Weekly => self.weekly_days,
            Classification::Monthly => self.monthly_days,
        }
    }
}

/// Where backups go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destinations {
    /// Authoritative location.
    pub primary: StorageLocation,
    /// Copies.
    pub secondaries: Vec<StorageLocation>,
}

/// A stored, catalogued backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOutcome {
    /// Catalog record.
    pub artifact: BackupArtifact,
    /// Where the copies went.
    pub replication: ReplicationReport,
}

/// Runs one backup from dump to catalog entry.
pub struct BackupPipeline {
    engine: BackupEngine,
    encryption: EncryptionPipeline,
    replication: ReplicationManager,
    catalog: Arc<Catalog>,
    kms_key_id: String,
    destinations: Destinations,
    retention: RetentionPolicy,
}

impl BackupPipeline {
    /// Assembles a pipeline.
    #[must_use]
    pub fn new(
        engine: BackupEngine,
        encryption: EncryptionPipeline,
        replication: ReplicationManager,
        catalog: Arc<Catalog>,
        kms_key_id: impl Into<String>,
        destinations: Destinations,
    ) -> Self {
        Self {
            engine,
            encryption,
            replication,
            catalog,
            kms_key_id: kms_key_id.into(),
            destinations,
            retention: RetentionPolicy::default(),
        }
    }

    /// Sets the retention periods stamped on new artifacts.
    #[must_use]
    pub const fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// The catalog this pipeline writes to.
    #[must_use]
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Dumps, encrypts and replicates one source, then records it.
    ///
    /// Nothing is catalogued unless the primary upload succeeded. The local
    /// working directory is removed on every path.
    pub async fn run(&self, request: &DumpRequest) -> Result<BackupOutcome> {
        self.run_tracked(request, &mut BackupStage::default()).await
    }

    /// [`run`](Self::run), recording in `stage` each step as it completes
    /// so a caller can report how far a failed run got.
    pub async fn run_tracked(&self, request: &DumpRequest, stage: &mut BackupStage) -> Result<BackupOutcome> {
        *stage = BackupStage::Started;
        let local = self.engine.backup(request).await?;
        let mut artifact = local.artifact.clone();
        *stage = BackupStage::Dumped;

        let encrypted = self
            .encryption
            .encrypt_file(&local.dump_path, &self.kms_key_id)
            .await
            .inspect_err(|e| error!(backup_id = %artifact.id, error = %e, "encryption failed"))?;
        artifact.transition(ArtifactState::Encrypted)?;
        *stage = BackupStage::Encrypted;
        artifact.retention_expires_at = Some(
            artifact.created_at + Duration::days(i64::from(self.retention.days_for(artifact.classification))),
        );

        let report = self
            .replication
            .replicate(
                &mut artifact,
                &encrypted,
                &self.destinations.primary,
                &self.destinations.secondaries,
            )
            .await?;
        drop(local);
        *stage = BackupStage::Replicated;

        self.catalog.insert(artifact.clone())?;
        self.catalog.record_replication(report.clone())?;
        *stage = BackupStage::Catalogued;

        if report.degraded {
            warn!(
                backup_id = %artifact.id,
                failed = ?report.failed_regions(),
                "backup stored but degraded; run retry-replication once the regions recover"
            );
        }
        info!(
            backup_id = %artifact.id,
            state = %artifact.state,
            classification = %artifact.classification,
            "backup complete"
        );
        Ok(BackupOutcome {
            artifact,
            replication: report,
        })
    }

    /// Re-copies the failed regions of a catalogued backup.
    pub async fn retry_replication(&self, backup_id: &str) -> Result<ReplicationReport> {
        let mut artifact = self.catalog.get(backup_id)?;
        let report = self.catalog.replication_report(backup_id).ok_or_else(|| {
            BackupError::InvalidRequest(format!("no replication report recorded for backup '{backup_id}'"))
        })?;

        let updated = self.replication.retry_failed(&mut artifact, &report).await?;
        self.catalog.put(artifact)?;
        self.catalog.record_replication(updated.clone())?;
        Ok(updated)
    }
}

impl std::fmt::Debug for BackupPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupPipeline")
            .field("kms_key_id", &self.kms_key_id)
            .field("destinations", &self.destinations)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}
