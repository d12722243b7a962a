//! # custodian-backup
//!
//! Encrypted, geo-replicated database backups.
//!
//! - [`engine`] and [`dump`]: private working directories, dump tools, checksums
//! - [`replication`]: primary upload and verified secondary copies
//! - [`verify`] and [`restore`]: download, decrypt, checksum, structure and test restore
//! - [`retention`]: age-based sweeps that never touch held backups
//! - [`catalog`]: the persisted record of every stored artifact
//! - [`pipeline`]: the whole path from dump to catalog entry
//!
//! ## Example
//!
//! ```rust
//! use custodian_backup::storage::{MemoryObjectStorage, ObjectMetadata, ObjectStorage};
//! use custodian_backup::StorageLocation;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let storage = MemoryObjectStorage::new();
//! let east = StorageLocation::new("us-east", "backups");
//!
//! storage.put(&east, "postgres/b1.enc", vec![1, 2, 3], ObjectMetadata::new()).await.expect("put");
//! assert_eq!(storage.get(&east, "postgres/b1.enc").await.expect("get"), vec![1, 2, 3]);
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod catalog;
pub mod dump;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod replication;
pub mod restore;
pub mod retention;
pub mod storage;
pub mod types;
pub mod verify;

pub use catalog::{Catalog, HoldGuard};
pub use dump::{CommandDumper, CommandLine, Dumper};
pub use engine::{BackupEngine, LocalBackup, WorkDir};
pub use error::{BackupError, Result};
pub use pipeline::{BackupOutcome, BackupPipeline, Destinations, RetentionPolicy};
pub use replication::ReplicationManager;
pub use restore::{CommandRestoreTarget, RestoreTarget};
pub use retention::{RetentionManager, RetentionReport};
pub use storage::{FsObjectStorage, MemoryObjectStorage, ObjectStorage, StorageError};
pub use types::{
    ArtifactState, BackupArtifact, BackupStage, Classification, DumpRequest, ReplicationReport, SourceSystem,
    StorageLocation, UploadResult, UploadStatus, VerificationReport, VerifyStage,
};
pub use verify::VerificationEngine;
