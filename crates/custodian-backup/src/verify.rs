//! Backup verification: download, decrypt, checksum, structure, restore.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use custodian_core::with_deadline;
use custodian_crypto::{CryptoError, EncryptionPipeline, PlaintextGuard};
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::catalog::Catalog;
use crate::engine::{sha256_hex, WorkDir};
use crate::error::{BackupError, Result};
use crate::restore::RestoreTarget;
use crate::storage::ObjectStorage;
use crate::types::{ArtifactState, BackupArtifact, SourceSystem, StorageLocation, VerificationReport, VerifyStage};

/// Default deadline for one download.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default deadline for a test restore.
pub const DEFAULT_RESTORE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Leading bytes of a `pg_dump` custom-format archive.
pub const PG_DUMP_MAGIC: &[u8] = b"PGDMP";
/// Leading bytes of an uncompressed `mongodump` archive.
pub const MONGO_ARCHIVE_MAGIC: &[u8] = &[0x6d, 0xe2, 0x99, 0x81];
/// Leading bytes of a gzip stream.
pub const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

/// Returns true if `dump` starts like a dump of `source_system`.
#[must_use]
pub fn structure_matches(source_system: SourceSystem, dump: &[u8]) -> bool {
    match source_system {
        SourceSystem::Postgres | SourceSystem::Timescale => dump.starts_with(PG_DUMP_MAGIC),
        SourceSystem::Mongo => dump.starts_with(MONGO_ARCHIVE_MAGIC) || dump.starts_with(GZIP_MAGIC),
    }
}

/// True when decryption failed because the stored bytes are not the bytes
/// that were sealed. KMS faults, unknown keys and timeouts are not.
fn is_integrity_failure(error: &CryptoError) -> bool {
    matches!(error, CryptoError::Decryption { .. } | CryptoError::Envelope { .. })
}

/// Verifies stored backups end to end.
pub struct VerificationEngine {
    catalog: Arc<Catalog>,
    storage: Arc<dyn ObjectStorage>,
    pipeline: EncryptionPipeline,
    restore: Option<Arc<dyn RestoreTarget>>,
    work_root: PathBuf,
    download_timeout: Duration,
    restore_timeout: Duration,
}

impl VerificationEngine {
    /// Creates an engine; test restores stage plaintext under `work_root`.
    #[must_use]
    pub fn new(
        catalog: Arc<Catalog>,
        storage: Arc<dyn ObjectStorage>,
        pipeline: EncryptionPipeline,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            storage,
            pipeline,
            restore: None,
            work_root: work_root.into(),
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            restore_timeout: DEFAULT_RESTORE_TIMEOUT,
        }
    }

    /// Sets the collaborator used for test restores.
    #[must_use]
    pub fn with_restore_target(mut self, target: Arc<dyn RestoreTarget>) -> Self {
        self.restore = Some(target);
        self
    }

    /// Sets the per-download and test-restore deadlines.
    #[must_use]
    pub const fn with_timeouts(mut self, download: Duration, restore: Duration) -> Self {
        self.download_timeout = download;
        self.restore_timeout = restore;
        self
    }

    /// Verifies backup `backup_id`.
    ///
    /// A checksum mismatch is an error and never marks the artifact. A
    /// failed structure or size check is reported in the returned report and
    /// leaves the artifact unverified. The test restore result is reported
    /// only.
    pub async fn verify(&self, backup_id: &str, perform_test_restore: bool) -> Result<VerificationReport> {
        self.verify_tracked(backup_id, perform_test_restore, &mut VerifyStage::default()).await
    }

    /// [`verify`](Self::verify), recording in `stage` each step as it
    /// completes.
    pub async fn verify_tracked(
        &self,
        backup_id: &str,
        perform_test_restore: bool,
        stage: &mut VerifyStage,
    ) -> Result<VerificationReport> {
        *stage = VerifyStage::Started;
        let artifact = self.catalog.get(backup_id)?;
        if !artifact.state.is_stored() {
            return Err(BackupError::VerificationFailed {
                backup_id: backup_id.to_string(),
                reason: format!("backup is {} and has no readable copy", artifact.state),
            });
        }

        let _hold = self.catalog.place_hold(backup_id, "verification")?;
        *stage = VerifyStage::Held;

        let (region, envelope) = self.download(&artifact).await?;
        *stage = VerifyStage::Downloaded;
        let plaintext = match self.pipeline.decrypt(&envelope).await {
            Ok(plaintext) => Zeroizing::new(plaintext),
            Err(e) if is_integrity_failure(&e) => {
                error!(backup_id, %region, error = %e, "stored envelope failed authentication; backup is corrupt");
                return Err(BackupError::ChecksumMismatch {
                    backup_id: backup_id.to_string(),
                    expected: artifact.checksum,
                    actual: format!("unreadable ({e})"),
                });
            }
            Err(e) => {
                warn!(backup_id, %region, error = %e, "envelope could not be opened");
                return Err(e.into());
            }
        };
        drop(envelope);
        *stage = VerifyStage::Decrypted;

        let checksum = sha256_hex(&plaintext);
        if checksum != artifact.checksum {
            error!(
                backup_id,
                %region,
                expected = %artifact.checksum,
                actual = %checksum,
                "checksum mismatch; backup is corrupt"
            );
            return Err(BackupError::ChecksumMismatch {
                backup_id: backup_id.to_string(),
                expected: artifact.checksum,
                actual: checksum,
            });
        }
        *stage = VerifyStage::ChecksumMatched;

        let structure_ok = structure_matches(artifact.source_system, &plaintext);
        let size_ok = plaintext.len() as u64 == artifact.size_bytes;
        if !structure_ok {
            warn!(backup_id, source_system = %artifact.source_system, "dump header does not match its engine");
        }
        if !size_ok {
            warn!(backup_id, expected = artifact.size_bytes, actual = plaintext.len(), "decrypted size differs");
        }

        let restore_ok = if perform_test_restore {
            self.test_restore(&artifact, &plaintext).await
        } else {
            None
        };

        let report = VerificationReport {
            backup_id: backup_id.to_string(),
            region,
            structure_ok,
            size_ok,
            restore_ok,
            checksum,
        };

        if report.is_valid() {
            self.catalog.update(backup_id, |a| {
                a.transition(ArtifactState::Verified)?;
                a.verified = true;
                Ok(())
            })?;
            *stage = VerifyStage::Verified;
            info!(backup_id, region = %report.region, ?restore_ok, "backup verified");
        }
        Ok(report)
    }

    async fn download(&self, artifact: &BackupArtifact) -> Result<(String, Vec<u8>)> {
        let mut failures = Vec::new();
        for region in artifact.download_order() {
            let Some(object) = artifact.storage_locations.get(&region) else {
                continue;
            };
            let location = StorageLocation::new(&region, &object.bucket);
            match with_deadline(self.download_timeout, self.storage.get(&location, &object.key)).await {
                Ok(Ok(bytes)) => return Ok((region, bytes)),
                Ok(Err(e)) => {
                    warn!(backup_id = %artifact.id, %region, error = %e, "download failed, trying next region");
                    failures.push(format!("{region}: {e}"));
                }
                Err(timeout) => {
                    warn!(backup_id = %artifact.id, %region, "download timed out, trying next region");
                    failures.push(format!("{region}: {timeout}"));
                }
            }
        }
        Err(BackupError::VerificationFailed {
            backup_id: artifact.id.clone(),
            reason: if failures.is_empty() {
                "no stored copies".to_string()
            } else {
                format!("no region could serve the backup ({})", failures.join("; "))
            },
        })
    }

    async fn test_restore(&self, artifact: &BackupArtifact, plaintext: &[u8]) -> Option<bool> {
        let Some(target) = &self.restore else {
            warn!(backup_id = %artifact.id, "test restore requested but no restore target is configured");
            return None;
        };

        let work_dir = match WorkDir::create(&self.work_root, &format!("verify-{}", artifact.id)) {
            Ok(dir) => dir,
            Err(e) => {
                warn!(backup_id = %artifact.id, error = %e, "cannot stage test restore");
                return Some(false);
            }
        };
        let dump_path = work_dir.path().join("restore.dump");
        let guard = PlaintextGuard::new(&dump_path);
        if let Err(e) = tokio::fs::write(&dump_path, plaintext).await {
            warn!(backup_id = %artifact.id, error = %e, "cannot stage test restore");
            return Some(false);
        }

        let ok = match with_deadline(self.restore_timeout, target.restore(artifact.source_system, &dump_path)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(backup_id = %artifact.id, error = %e, "test restore failed");
                false
            }
            Err(timeout) => {
                warn!(backup_id = %artifact.id, after = ?timeout.after, "test restore timed out");
                false
            }
        };
        drop(guard);
        Some(ok)
    }
}

impl std::fmt::Debug for VerificationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationEngine")
            .field("work_root", &self.work_root)
            .field("download_timeout", &self.download_timeout)
            .field("restore_timeout", &self.restore_timeout)
            .field("restore", &self.restore.is_some())
            .finish_non_exhaustive()
    }
}
