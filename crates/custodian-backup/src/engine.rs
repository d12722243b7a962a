//! Backup engine: dump, checksum, size.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use custodian_core::with_deadline;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

use crate::dump::Dumper;
use crate::error::{BackupError, Result};
use crate::types::{BackupArtifact, DumpRequest, SourceSystem};

/// Default deadline for a single dump.
pub const DEFAULT_DUMP_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// A private working directory, removed with its contents on drop.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    /// Creates `<root>/<name>` with owner-only permissions.
    pub fn create(root: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| BackupError::io(root, e))?;
        let path = root.join(name);

        let mut builder = std::fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&path).map_err(|e| BackupError::io(&path, e))?;
        Ok(Self { path })
    }

    /// Directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove working directory");
            }
        }
    }
}

/// A dump on local disk, with the artifact describing it.
#[derive(Debug)]
pub struct LocalBackup {
    /// Catalog record in state `created`.
    pub artifact: BackupArtifact,
    /// Path of the raw dump.
    pub dump_path: PathBuf,
    /// Owning working directory; dropping it deletes the dump.
    pub work_dir: WorkDir,
}

/// Takes dumps into private working directories.
#[derive(Clone)]
pub struct BackupEngine {
    work_root: PathBuf,
    dumper: Arc<dyn Dumper>,
    dump_timeout: Duration,
}

impl BackupEngine {
    /// Creates an engine writing under `work_root`.
    #[must_use]
    pub fn new(work_root: impl Into<PathBuf>, dumper: Arc<dyn Dumper>) -> Self {
        Self {
            work_root: work_root.into(),
            dumper,
            dump_timeout: DEFAULT_DUMP_TIMEOUT,
        }
    }

    /// Sets the dump deadline.
    #[must_use]
    pub const fn with_dump_timeout(mut self, timeout: Duration) -> Self {
        self.dump_timeout = timeout;
        self
    }

    /// Root of the working directories.
    #[must_use]
    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    /// Dumps `request.source_system` and describes the result.
    ///
    /// On any failure the working directory is removed and no artifact is
    /// returned.
    pub async fn backup(&self, request: &DumpRequest) -> Result<LocalBackup> {
        request.validate()?;
        let source = request.source_system;

        let created_at = Utc::now();
        let id = format!(
            "{source}-{}-{}",
            created_at.format("%Y%m%dT%H%M%S%3fZ"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let work_dir = WorkDir::create(&self.work_root, &id)?;
        let dump_path = work_dir.path().join(dump_file_name(source));

        if request.sharded && source != SourceSystem::Mongo {
            warn!(%source, "sharded mode only applies to mongo; ignoring");
        }

        match with_deadline(self.dump_timeout, self.dumper.dump(request, &dump_path)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(%source, backup_id = %id, error = %e, "dump failed");
                return Err(match e {
                    e @ BackupError::DumpFailed { .. } => e,
                    other => BackupError::dump(source, other.to_string()),
                });
            }
            Err(timeout) => {
                error!(%source, backup_id = %id, after = ?timeout.after, "dump timed out");
                return Err(BackupError::dump(source, timeout.to_string()));
            }
        }

        let (size_bytes, checksum) = match sha256_file(&dump_path).await {
            Ok(digest) => digest,
            Err(e) => return Err(BackupError::dump(source, format!("dump output unreadable: {e}"))),
        };
        if size_bytes == 0 {
            return Err(BackupError::dump(source, "dump produced no data"));
        }

        info!(backup_id = %id, %source, size_bytes, %checksum, "dump complete");

        Ok(LocalBackup {
            artifact: BackupArtifact::new(id, source, created_at, size_bytes, checksum),
            dump_path,
            work_dir,
        })
    }
}

impl std::fmt::Debug for BackupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupEngine")
            .field("work_root", &self.work_root)
            .field("dump_timeout", &self.dump_timeout)
            .finish_non_exhaustive()
    }
}

fn dump_file_name(source: SourceSystem) -> &'static str {
    match source {
        SourceSystem::Postgres => "postgres.dump",
        SourceSystem::Timescale => "timescale.dump",
        SourceSystem::Mongo => "mongo.archive",
    }
}

/// Streams a file through SHA-256, returning `(size, hex digest)`.
pub async fn sha256_file(path: &Path) -> std::io::Result<(u64, String)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hex::encode(hasher.finalize())))
}

/// SHA-256 hex digest of a buffer.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FailingDumper, StaticDumper, pg_request};

    #[tokio::test]
    async fn backup_records_checksum_and_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let content = b"PGDMP\x01\x0e\x00 some rows".to_vec();
        let engine = BackupEngine::new(dir.path(), Arc::new(StaticDumper::new(content.clone())));

        let local = engine.backup(&pg_request()).await.expect("backup");

        assert_eq!(local.artifact.size_bytes, content.len() as u64);
        assert_eq!(local.artifact.checksum, sha256_hex(&content));
        assert!(local.artifact.id.starts_with("postgres-"));
        assert_eq!(std::fs::read(&local.dump_path).expect("read"), content);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(local.work_dir.path()).expect("meta").permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        let work = local.work_dir.path().to_path_buf();
        drop(local);
        assert!(!work.exists());
    }

    #[tokio::test]
    async fn dump_failure_removes_working_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = BackupEngine::new(dir.path(), Arc::new(FailingDumper));

        let err = engine.backup(&pg_request()).await.expect_err("dump fails");
        assert_eq!(err.kind(), custodian_core::FailureKind::DumpFailed);
        assert_eq!(std::fs::read_dir(dir.path()).expect("read_dir").count(), 0);
    }

    #[tokio::test]
    async fn empty_dump_is_a_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = BackupEngine::new(dir.path(), Arc::new(StaticDumper::new(Vec::new())));
        assert!(matches!(
            engine.backup(&pg_request()).await,
            Err(BackupError::DumpFailed { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_compression_is_rejected_before_dumping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = BackupEngine::new(dir.path(), Arc::new(StaticDumper::new(b"PGDMP".to_vec())));
        let mut request = pg_request();
        request.compression_level = 12;
        assert!(matches!(engine.backup(&request).await, Err(BackupError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn streaming_digest_matches_in_memory_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blob");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).expect("write");

        let (size, digest) = sha256_file(&path).await.expect("digest");
        assert_eq!(size, data.len() as u64);
        assert_eq!(digest, sha256_hex(&data));
    }
}
