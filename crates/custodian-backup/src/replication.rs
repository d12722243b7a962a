//! Geo-replication of encrypted artifacts.
//!
//! The envelope is uploaded once, to the primary location. Secondaries are
//! filled by server-side copy from the primary and then checked
//! independently (existence and size). A failed secondary degrades the
//! artifact but never fails the backup.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Datelike;
use custodian_core::{retry, RetryPolicy};
use custodian_crypto::EncryptedArtifact;
use custodian_crypto::envelope::CIPHER;
use tracing::{info, warn};

use crate::error::{BackupError, Result};
use crate::storage::{ObjectInfo, ObjectMetadata, ObjectStorage, StorageError};
use crate::types::{
    ArtifactState, BackupArtifact, ReplicationReport, StorageLocation, StoredObject, UploadResult, UploadStatus,
};

/// Metadata tag: artifact id.
pub const TAG_BACKUP_ID: &str = "custodian-backup-id";
/// Metadata tag: source engine.
pub const TAG_SOURCE_SYSTEM: &str = "custodian-source-system";
/// Metadata tag: SHA-256 of the raw dump.
pub const TAG_CHECKSUM: &str = "custodian-checksum-sha256";
/// Metadata tag: envelope cipher.
pub const TAG_ENCRYPTION: &str = "custodian-encryption";
/// Metadata tag: KMS key that wrapped the data key.
pub const TAG_KMS_KEY_ID: &str = "custodian-kms-key-id";
/// Metadata tag: retention class.
pub const TAG_CLASSIFICATION: &str = "custodian-classification";

/// Object key for an artifact: `<source>/<yyyy>/<mm>/<dd>/<id>.enc`.
#[must_use]
pub fn object_key(artifact: &BackupArtifact) -> String {
    let at = artifact.created_at;
    format!(
        "{}/{:04}/{:02}/{:02}/{}.enc",
        artifact.source_system,
        at.year(),
        at.month(),
        at.day(),
        artifact.id
    )
}

fn object_metadata(artifact: &BackupArtifact, kms_key_id: &str) -> ObjectMetadata {
    ObjectMetadata::from([
        (TAG_BACKUP_ID.to_string(), artifact.id.clone()),
        (TAG_SOURCE_SYSTEM.to_string(), artifact.source_system.to_string()),
        (TAG_CHECKSUM.to_string(), artifact.checksum.clone()),
        (TAG_ENCRYPTION.to_string(), CIPHER.to_string()),
        (TAG_KMS_KEY_ID.to_string(), kms_key_id.to_string()),
        (TAG_CLASSIFICATION.to_string(), artifact.classification.to_string()),
    ])
}

async fn put_checked(
    storage: &dyn ObjectStorage,
    location: &StorageLocation,
    key: &str,
    bytes: Vec<u8>,
    metadata: ObjectMetadata,
) -> std::result::Result<ObjectInfo, StorageError> {
    let expected = bytes.len() as u64;
    let info = storage.put(location, key, bytes, metadata).await?;
    if info.size_bytes != expected {
        return Err(StorageError::Unavailable {
            region: location.region.clone(),
            reason: format!("stored {} bytes, expected {expected}", info.size_bytes),
        });
    }
    Ok(info)
}

async fn copy_checked(
    storage: &dyn ObjectStorage,
    from: &StorageLocation,
    key: &str,
    to: &StorageLocation,
    expected: u64,
) -> std::result::Result<ObjectInfo, StorageError> {
    storage.copy(from, key, to).await?;
    match storage.head(to, key).await? {
        Some(info) if info.size_bytes == expected => Ok(info),
        Some(info) => Err(StorageError::Unavailable {
            region: to.region.clone(),
            reason: format!("copy has {} bytes, expected {expected}", info.size_bytes),
        }),
        None => Err(StorageError::NotFound {
            region: to.region.clone(),
            key: key.to_string(),
        }),
    }
}

/// Uploads artifacts to a primary location and copies them to secondaries.
#[derive(Clone)]
pub struct ReplicationManager {
    storage: Arc<dyn ObjectStorage>,
    policy: RetryPolicy,
}

impl ReplicationManager {
    /// Creates a manager; every region operation runs under `policy`.
    #[must_use]
    pub fn new(storage: Arc<dyn ObjectStorage>, policy: RetryPolicy) -> Self {
        Self { storage, policy }
    }

    /// Uploads `encrypted` to `primary`, then copies it to each secondary.
    ///
    /// The artifact must be in state `encrypted`. On return it is
    /// `uploaded` (some secondary missing, or none configured) or
    /// `replicated`.
    pub async fn replicate(
        &self,
        artifact: &mut BackupArtifact,
        encrypted: &EncryptedArtifact,
        primary: &StorageLocation,
        secondaries: &[StorageLocation],
    ) -> Result<ReplicationReport> {
        if !artifact.state.can_transition_to(ArtifactState::Uploaded) {
            return Err(BackupError::InvalidTransition {
                id: artifact.id.clone(),
                from: artifact.state,
                to: ArtifactState::Uploaded,
            });
        }

        let bytes = tokio::fs::read(&encrypted.path)
            .await
            .map_err(|e| BackupError::io(&encrypted.path, e))?;
        let size = bytes.len() as u64;
        let key = object_key(artifact);
        let metadata = object_metadata(artifact, &encrypted.kms_key_id);

        let storage = self.storage.as_ref();
        let (key_ref, bytes_ref, metadata_ref) = (key.as_str(), &bytes, &metadata);
        let uploaded = retry(&self.policy, move |_| {
            put_checked(storage, primary, key_ref, bytes_ref.clone(), metadata_ref.clone())
        })
        .await
        .map_err(|e| {
            warn!(backup_id = %artifact.id, region = %primary.region, error = %e, "primary upload failed");
            BackupError::UploadFailed {
                region: primary.region.clone(),
                reason: e.to_string(),
            }
        })?;
        drop(bytes);

        artifact.transition(ArtifactState::Uploaded)?;
        artifact.encryption_key_id = Some(encrypted.kms_key_id.clone());
        artifact.encrypted_size_bytes = Some(size);
        artifact.primary_region = Some(primary.region.clone());
        artifact.storage_locations.insert(
            primary.region.clone(),
            StoredObject {
                bucket: primary.bucket.clone(),
                key: key.clone(),
            },
        );
        info!(
            backup_id = %artifact.id,
            location = %primary,
            key = %key,
            attempts = uploaded.attempts,
            "uploaded to primary"
        );

        let mut results = BTreeMap::new();
        results.insert(
            primary.region.clone(),
            UploadResult {
                region: primary.region.clone(),
                bucket: primary.bucket.clone(),
                object_key: key.clone(),
                status: UploadStatus::Succeeded,
                size_bytes: Some(uploaded.value.size_bytes),
                attempts: uploaded.attempts,
                error: None,
            },
        );

        for secondary in secondaries.iter().filter(|s| s.region != primary.region) {
            let result = self.copy_to(artifact, primary, &key, secondary, size).await;
            results.insert(secondary.region.clone(), result);
        }

        let report = ReplicationReport {
            artifact_id: artifact.id.clone(),
            primary: primary.clone(),
            results,
            degraded: false,
        };
        self.settle(artifact, report, !secondaries.is_empty())
    }

    /// Re-copies the regions that failed in `report` from the primary.
    ///
    /// Nothing is uploaded again; the primary copy is the only source.
    pub async fn retry_failed(
        &self,
        artifact: &mut BackupArtifact,
        report: &ReplicationReport,
    ) -> Result<ReplicationReport> {
        if !artifact.state.is_stored() {
            return Err(BackupError::InvalidRequest(format!(
                "backup '{}' is {} and cannot be replicated",
                artifact.id, artifact.state
            )));
        }
        let primary = &report.primary;
        let stored = artifact.storage_locations.get(&primary.region).cloned().ok_or_else(|| {
            BackupError::InvalidRequest(format!(
                "backup '{}' has no copy in primary region '{}'",
                artifact.id, primary.region
            ))
        })?;
        let size = match artifact.encrypted_size_bytes {
            Some(size) => size,
            None => self
                .storage
                .head(primary, &stored.key)
                .await?
                .map(|info| info.size_bytes)
                .ok_or_else(|| BackupError::NotFound { id: artifact.id.clone() })?,
        };

        let mut updated = report.clone();
        let failed: Vec<StorageLocation> = report
            .results
            .values()
            .filter(|r| !r.succeeded())
            .map(UploadResult::location)
            .collect();
        if failed.is_empty() {
            info!(backup_id = %artifact.id, "no failed regions to retry");
        }

        for location in &failed {
            let result = self.copy_to(artifact, primary, &stored.key, location, size).await;
            updated.results.insert(location.region.clone(), result);
        }

        let had_secondaries = updated.results.len() > 1;
        self.settle(artifact, updated, had_secondaries)
    }

    async fn copy_to(
        &self,
        artifact: &mut BackupArtifact,
        primary: &StorageLocation,
        key: &str,
        destination: &StorageLocation,
        size: u64,
    ) -> UploadResult {
        let storage = self.storage.as_ref();
        let outcome = retry(&self.policy, move |_| {
            copy_checked(storage, primary, key, destination, size)
        })
        .await;

        match outcome {
            Ok(copied) => {
                artifact.storage_locations.insert(
                    destination.region.clone(),
                    StoredObject {
                        bucket: destination.bucket.clone(),
                        key: key.to_string(),
                    },
                );
                info!(backup_id = %artifact.id, location = %destination, attempts = copied.attempts, "replicated");
                UploadResult {
                    region: destination.region.clone(),
                    bucket: destination.bucket.clone(),
                    object_key: key.to_string(),
                    status: UploadStatus::Succeeded,
                    size_bytes: Some(copied.value.size_bytes),
                    attempts: copied.attempts,
                    error: None,
                }
            }
            Err(e) => {
                warn!(
                    backup_id = %artifact.id,
                    region = %destination.region,
                    attempts = e.attempts,
                    error = %e.last_error,
                    "secondary replication failed; backup is degraded"
                );
                UploadResult {
                    region: destination.region.clone(),
                    bucket: destination.bucket.clone(),
                    object_key: key.to_string(),
                    status: UploadStatus::Failed,
                    size_bytes: None,
                    attempts: e.attempts,
                    error: Some(e.last_error.to_string()),
                }
            }
        }
    }

    fn settle(
        &self,
        artifact: &mut BackupArtifact,
        mut report: ReplicationReport,
        has_secondaries: bool,
    ) -> Result<ReplicationReport> {
        report.degraded = report.results.values().any(|r| !r.succeeded());
        artifact.degraded = report.degraded;
        if has_secondaries && !report.degraded && artifact.state == ArtifactState::Uploaded {
            artifact.transition(ArtifactState::Replicated)?;
        }
        Ok(report)
    }
}

impl std::fmt::Debug for ReplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationManager")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::MemoryObjectStorage;
    use crate::types::SourceSystem;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: Arc<MemoryObjectStorage>,
        manager: ReplicationManager,
        artifact: BackupArtifact,
        encrypted: EncryptedArtifact,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("postgres.dump.enc");
        std::fs::write(&path, vec![7u8; 4096]).expect("write");

        let created_at = Utc.with_ymd_and_hms(2024, 9, 10, 2, 0, 0).single().expect("date");
        let mut artifact = BackupArtifact::new(
            "postgres-20240910T020000000Z-abcd1234".into(),
            SourceSystem::Postgres,
            created_at,
            4000,
            "cd".repeat(32),
        );
        artifact.transition(ArtifactState::Encrypted).expect("encrypted");

        let storage = Arc::new(MemoryObjectStorage::new());
        let manager = ReplicationManager::new(storage.clone(), RetryPolicy::new(2, Duration::from_millis(1)));
        Fixture {
            _dir: dir,
            storage,
            manager,
            artifact,
            encrypted: EncryptedArtifact {
                path,
                kms_key_id: "backup-master".into(),
                size_bytes: 4096,
                plaintext_len: 4000,
            },
        }
    }

    fn primary() -> StorageLocation {
        StorageLocation::new("us-east", "backups-east")
    }

    fn secondaries() -> Vec<StorageLocation> {
        vec![
            StorageLocation::new("eu-west", "backups-west"),
            StorageLocation::new("ap-south", "backups-south"),
        ]
    }

    #[test]
    fn object_key_is_date_partitioned() {
        let f = fixture();
        assert_eq!(
            object_key(&f.artifact),
            "postgres/2024/09/10/postgres-20240910T020000000Z-abcd1234.enc"
        );
    }

    #[tokio::test]
    async fn replicates_to_every_region() {
        let mut f = fixture();
        let report = f
            .manager
            .replicate(&mut f.artifact, &f.encrypted, &primary(), &secondaries())
            .await
            .expect("replicate");

        assert!(!report.degraded);
        assert_eq!(report.results.len(), 3);
        assert_eq!(f.artifact.state, ArtifactState::Replicated);
        assert_eq!(f.artifact.storage_locations.len(), 3);
        assert_eq!(f.artifact.encrypted_size_bytes, Some(4096));
        assert_eq!(f.storage.object_count(), 3);

        let head = f
            .storage
            .head(&secondaries()[1], &object_key(&f.artifact))
            .await
            .expect("head")
            .expect("copied");
        assert_eq!(head.metadata.get(TAG_KMS_KEY_ID).map(String::as_str), Some("backup-master"));
        assert_eq!(head.metadata.get(TAG_ENCRYPTION).map(String::as_str), Some(CIPHER));
    }

    #[tokio::test]
    async fn primary_only_stays_uploaded() {
        let mut f = fixture();
        let report = f
            .manager
            .replicate(&mut f.artifact, &f.encrypted, &primary(), &[])
            .await
            .expect("replicate");
        assert!(!report.degraded);
        assert_eq!(f.artifact.state, ArtifactState::Uploaded);
    }

    #[tokio::test]
    async fn primary_failure_is_fatal() {
        let mut f = fixture();
        f.storage.fail_region("us-east");
        let err = f
            .manager
            .replicate(&mut f.artifact, &f.encrypted, &primary(), &secondaries())
            .await
            .expect_err("primary down");

        assert_eq!(err.kind(), custodian_core::FailureKind::UploadFailed("us-east".into()));
        assert_eq!(f.artifact.state, ArtifactState::Encrypted);
        assert_eq!(f.storage.object_count(), 0);
    }

    #[tokio::test]
    async fn secondary_failure_degrades_and_retry_recovers() {
        let mut f = fixture();
        f.storage.fail_region("ap-south");

        let report = f
            .manager
            .replicate(&mut f.artifact, &f.encrypted, &primary(), &secondaries())
            .await
            .expect("degraded replication still succeeds");
        assert!(report.degraded);
        assert!(f.artifact.degraded);
        assert_eq!(report.failed_regions(), vec!["ap-south"]);
        assert_eq!(report.results["ap-south"].attempts, 2);
        assert_eq!(f.artifact.state, ArtifactState::Uploaded);
        assert!(!f.artifact.storage_locations.contains_key("ap-south"));

        f.storage.restore_region("ap-south");
        let retried = f.manager.retry_failed(&mut f.artifact, &report).await.expect("retry");
        assert!(!retried.degraded);
        assert!(!f.artifact.degraded);
        assert_eq!(f.artifact.state, ArtifactState::Replicated);
        assert_eq!(f.storage.object_count(), 3);
        // Regions that already succeeded were not touched again.
        assert_eq!(retried.results["eu-west"], report.results["eu-west"]);
    }

    #[tokio::test]
    async fn replicate_requires_an_encrypted_artifact() {
        let mut f = fixture();
        f.artifact.state = ArtifactState::Created;
        assert!(matches!(
            f.manager.replicate(&mut f.artifact, &f.encrypted, &primary(), &[]).await,
            Err(BackupError::InvalidTransition { .. })
        ));
    }
}
