//! Core types for backups: artifacts, locations and reports.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{BackupError, Result};

/// Database engine a backup was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceSystem {
    /// `PostgreSQL`.
    Postgres,
    /// `MongoDB`.
    Mongo,
    /// `TimescaleDB` (dumped with the postgres tools).
    Timescale,
}

impl SourceSystem {
    /// Returns true for engines dumped with `pg_dump`.
    #[must_use]
    pub const fn is_postgres_family(&self) -> bool {
        matches!(self, Self::Postgres | Self::Timescale)
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mongo => "mongo",
            Self::Timescale => "timescale",
        }
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceSystem {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mongo" | "mongodb" => Ok(Self::Mongo),
            "timescale" | "timescaledb" => Ok(Self::Timescale),
            other => Err(BackupError::InvalidRequest(format!("unknown source system '{other}'"))),
        }
    }
}

/// Retention class of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// Short-lived daily backup.
    Daily,
    /// Weekly backup.
    Weekly,
    /// Long-lived monthly backup.
    Monthly,
}

impl Classification {
    /// Classifies a backup by the day it was taken: the first of the month
    /// is monthly, Sundays are weekly, every other day is daily.
    #[must_use]
    pub fn for_date(at: DateTime<Utc>) -> Self {
        if at.day() == 1 {
            Self::Monthly
        } else if at.weekday() == Weekday::Sun {
            Self::Weekly
        } else {
            Self::Daily
        }
    }

    /// All classes.
    pub const ALL: [Self; 3] = [Self::Daily, Self::Weekly, Self::Monthly];
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

impl FromStr for Classification {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(BackupError::InvalidRequest(format!("unknown classification '{other}'"))),
        }
    }
}

/// Lifecycle state of a backup artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactState {
    /// Dump taken, plaintext in the working directory.
    Created,
    /// Envelope written, plaintext erased.
    Encrypted,
    /// Stored in the primary region.
    Uploaded,
    /// Stored in every configured region.
    Replicated,
    /// Downloaded, decrypted and matched against its checksum.
    Verified,
    /// Past retention; region copies are being removed.
    Expired,
    /// Every copy removed.
    Deleted,
}

impl ArtifactState {
    /// Returns true if the artifact has at least one stored copy.
    #[must_use]
    pub const fn is_stored(&self) -> bool {
        matches!(self, Self::Uploaded | Self::Replicated | Self::Verified)
    }

    /// Returns true if moving to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Encrypted)
                | (Self::Encrypted, Self::Uploaded)
                | (Self::Uploaded, Self::Replicated | Self::Verified | Self::Expired)
                | (Self::Replicated, Self::Verified | Self::Expired)
                | (Self::Verified, Self::Verified | Self::Expired)
                | (Self::Expired, Self::Expired | Self::Deleted)
        )
    }
}

impl fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Encrypted => "encrypted",
            Self::Uploaded => "uploaded",
            Self::Replicated => "replicated",
            Self::Verified => "verified",
            Self::Expired => "expired",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Furthest step a backup run completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackupStage {
    /// Nothing completed yet.
    #[default]
    Started,
    /// The dump is on local disk with its checksum.
    Dumped,
    /// The envelope is written and the plaintext erased.
    Encrypted,
    /// The primary copy is stored; secondaries were attempted.
    Replicated,
    /// The catalog records the artifact.
    Catalogued,
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::Dumped => "dumped",
            Self::Encrypted => "encrypted",
            Self::Replicated => "replicated",
            Self::Catalogued => "catalogued",
        };
        f.write_str(s)
    }
}

/// Furthest step a verification completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum VerifyStage {
    /// Nothing completed yet.
    #[default]
    Started,
    /// A hold protects the artifact from retention.
    Held,
    /// An envelope was fetched from some region.
    Downloaded,
    /// The envelope opened through the KMS.
    Decrypted,
    /// The plaintext matches the catalogued checksum.
    ChecksumMatched,
    /// Structure and size passed and the catalog marks the backup verified.
    Verified,
}

impl fmt::Display for VerifyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::Held => "held",
            Self::Downloaded => "downloaded",
            Self::Decrypted => "decrypted",
            Self::ChecksumMatched => "checksum",
            Self::Verified => "verified",
        };
        f.write_str(s)
    }
}

/// A bucket in a region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageLocation {
    /// Region name.
    pub region: String,
    /// Bucket name.
    pub bucket: String,
}

impl StorageLocation {
    /// Creates a location.
    #[must_use]
    pub fn new(region: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            bucket: bucket.into(),
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region, self.bucket)
    }
}

/// Where one copy of an artifact lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    /// Bucket within the region.
    pub bucket: String,
    /// Object key.
    pub key: String,
}

/// A backup and its catalog metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    /// Unique id, `<source>-<timestamp>-<suffix>`.
    pub id: String,
    /// Engine the dump came from.
    pub source_system: SourceSystem,
    /// When the dump was taken.
    pub created_at: DateTime<Utc>,
    /// Size of the raw dump.
    pub size_bytes: u64,
    /// SHA-256 hex of the raw dump.
    pub checksum: String,
    /// KMS key that wrapped the data key.
    pub encryption_key_id: Option<String>,
    /// Size of the envelope.
    pub encrypted_size_bytes: Option<u64>,
    /// Region holding the authoritative copy.
    pub primary_region: Option<String>,
    /// Copies by region.
    pub storage_locations: BTreeMap<String, StoredObject>,
    /// When retention may delete the artifact.
    pub retention_expires_at: Option<DateTime<Utc>>,
    /// Retention class.
    pub classification: Classification,
    /// Set once a verification matched the checksum.
    pub verified: bool,
    /// Set while a configured secondary region lacks a copy.
    pub degraded: bool,
    /// Lifecycle state.
    pub state: ArtifactState,
}

impl BackupArtifact {
    /// Creates a freshly dumped artifact.
    #[must_use]
    pub fn new(
        id: String,
        source_system: SourceSystem,
        created_at: DateTime<Utc>,
        size_bytes: u64,
        checksum: String,
    ) -> Self {
        Self {
            id,
            source_system,
            created_at,
            size_bytes,
            checksum,
            encryption_key_id: None,
            encrypted_size_bytes: None,
            primary_region: None,
            storage_locations: BTreeMap::new(),
            retention_expires_at: None,
            classification: Classification::for_date(created_at),
            verified: false,
            degraded: false,
            state: ArtifactState::Created,
        }
    }

    /// Moves to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: ArtifactState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(BackupError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Regions to try for a download, primary first.
    #[must_use]
    pub fn download_order(&self) -> Vec<String> {
        let mut regions: Vec<String> = Vec::with_capacity(self.storage_locations.len());
        if let Some(primary) = &self.primary_region {
            if self.storage_locations.contains_key(primary) {
                regions.push(primary.clone());
            }
        }
        regions.extend(
            self.storage_locations
                .keys()
                .filter(|r| Some(*r) != self.primary_region.as_ref())
                .cloned(),
        );
        regions
    }
}

/// What to dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpRequest {
    /// Engine.
    pub source_system: SourceSystem,
    /// Connection string handed to the dump tool; may contain credentials.
    pub connection: String,
    /// Compression level, 0-9.
    pub compression_level: u8,
    /// Parallel dump jobs or collections.
    pub parallelism: u16,
    /// Request a point-in-time consistent dump of a sharded / replica-set
    /// deployment.
    pub sharded: bool,
}

impl DumpRequest {
    /// Checks compression and parallelism bounds.
    pub fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(BackupError::InvalidRequest(format!(
                "compression level must be 0-9, got {}",
                self.compression_level
            )));
        }
        if self.parallelism == 0 {
            return Err(BackupError::InvalidRequest("parallelism must be at least 1".into()));
        }
        Ok(())
    }
}

/// Outcome of one region operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Stored and validated.
    Succeeded,
    /// Every attempt failed.
    Failed,
}

/// Result of storing an artifact in one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    /// Region.
    pub region: String,
    /// Bucket.
    pub bucket: String,
    /// Object key.
    pub object_key: String,
    /// Outcome.
    pub status: UploadStatus,
    /// Size confirmed by the post-copy check.
    pub size_bytes: Option<u64>,
    /// Attempts used.
    pub attempts: u32,
    /// Last error, if failed.
    pub error: Option<String>,
}

impl UploadResult {
    /// Location this result refers to.
    #[must_use]
    pub fn location(&self) -> StorageLocation {
        StorageLocation::new(&self.region, &self.bucket)
    }

    /// Returns true if the region holds a validated copy.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == UploadStatus::Succeeded
    }
}

/// Result of replicating one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationReport {
    /// Artifact id.
    pub artifact_id: String,
    /// Primary location.
    pub primary: StorageLocation,
    /// Per-region results, primary included.
    pub results: BTreeMap<String, UploadResult>,
    /// True if any secondary failed.
    pub degraded: bool,
}

impl ReplicationReport {
    /// Regions whose copy failed.
    #[must_use]
    pub fn failed_regions(&self) -> Vec<&str> {
        self.results
            .values()
            .filter(|r| !r.succeeded())
            .map(|r| r.region.as_str())
            .collect()
    }
}

/// Result of verifying a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Artifact id.
    pub backup_id: String,
    /// Region the copy was read from.
    pub region: String,
    /// Dump header matched the engine's format.
    pub structure_ok: bool,
    /// Decrypted length matched the catalog.
    pub size_ok: bool,
    /// Test restore outcome, if one was requested and possible.
    pub restore_ok: Option<bool>,
    /// Recomputed SHA-256 hex.
    pub checksum: String,
}

impl VerificationReport {
    /// Returns true if the structure and size checks passed.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.structure_ok && self.size_ok
    }
}
