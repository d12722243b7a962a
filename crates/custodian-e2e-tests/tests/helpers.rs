//! Test helpers for E2E tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use custodian_backup::{
    BackupEngine, BackupError, BackupPipeline, Catalog, Destinations, DumpRequest, Dumper, MemoryObjectStorage,
    ReplicationManager, RetentionManager, SourceSystem, StorageLocation, VerificationEngine,
};
use custodian_core::{FileLockManager, LockManager, LockToken, RetryPolicy};
use custodian_crypto::{EncryptionPipeline, LocalKms, SecretKey};
use custodian_rotation::{
    CredentialRegistry, CredentialType, Deployment, HealthStatus, JobJournal, LocalSecretStore, PolicySet,
    RolloutHealthVerifier, RotationController, RotationError, RotationTarget, SecretRef, SecretStoreClient,
};
use tempfile::TempDir;

/// KMS master key used by every backup fixture.
pub const KMS_KEY_ID: &str = "e2e-backup-master";

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Backups
// ============================================================================

/// Writes fixed bytes as the dump.
pub struct StaticDumper {
    content: Vec<u8>,
}

impl StaticDumper {
    pub fn new(content: Vec<u8>) -> Self {
        Self { content }
    }
}

#[async_trait]
impl Dumper for StaticDumper {
    async fn dump(&self, _request: &DumpRequest, output: &Path) -> Result<(), BackupError> {
        tokio::fs::write(output, &self.content)
            .await
            .map_err(|e| BackupError::Io {
                path: output.to_path_buf(),
                source: e,
            })
    }
}

/// A `pg_dump` custom-format header followed by `len` filler bytes.
pub fn pg_dump_bytes(len: usize) -> Vec<u8> {
    let mut bytes = b"PGDMP\x01\x0e\x00".to_vec();
    let mut state: u32 = 0x9e37_79b9;
    bytes.extend((0..len).map(|_| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state.to_le_bytes()[0]
    }));
    bytes
}

pub fn pg_request() -> DumpRequest {
    DumpRequest {
        source_system: SourceSystem::Postgres,
        connection: "postgres://backup@orders-db/orders".to_string(),
        compression_level: 6,
        parallelism: 1,
        sharded: false,
    }
}

pub fn primary() -> StorageLocation {
    StorageLocation::new("us-east-1", "custodian-primary")
}

pub fn secondaries() -> Vec<StorageLocation> {
    vec![
        StorageLocation::new("eu-west-1", "custodian-copy"),
        StorageLocation::new("ap-south-1", "custodian-copy"),
    ]
}

/// Backup stack over in-memory storage and a temporary working directory.
pub struct BackupHarness {
    pub dir: TempDir,
    pub storage: Arc<MemoryObjectStorage>,
    pub catalog: Arc<Catalog>,
    kms: Arc<LocalKms>,
}

impl BackupHarness {
    pub fn new() -> Self {
        let kms = LocalKms::in_memory();
        kms.ensure_key(KMS_KEY_ID).expect("kms key");
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
            storage: Arc::new(MemoryObjectStorage::new()),
            catalog: Arc::new(Catalog::in_memory()),
            kms: Arc::new(kms),
        }
    }

    fn encryption(&self) -> EncryptionPipeline {
        EncryptionPipeline::new(self.kms.clone())
    }

    fn region_policy() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1))
    }

    pub fn pipeline(&self, dump: Vec<u8>) -> BackupPipeline {
        BackupPipeline::new(
            BackupEngine::new(self.dir.path().join("work"), Arc::new(StaticDumper::new(dump))),
            self.encryption(),
            ReplicationManager::new(self.storage.clone(), Self::region_policy()),
            self.catalog.clone(),
            KMS_KEY_ID,
            Destinations {
                primary: primary(),
                secondaries: secondaries(),
            },
        )
    }

    pub fn verification(&self) -> VerificationEngine {
        VerificationEngine::new(
            self.catalog.clone(),
            self.storage.clone(),
            self.encryption(),
            self.dir.path().join("verify"),
        )
    }

    pub fn retention(&self) -> RetentionManager {
        RetentionManager::new(self.catalog.clone(), self.storage.clone(), Self::region_policy())
    }
}

// ============================================================================
// Rotation
// ============================================================================

/// Deployment with a default health answer and a queue of scripted answers.
pub struct ScriptedDeployment {
    default: Mutex<HealthStatus>,
    scripted: Mutex<VecDeque<HealthStatus>>,
    reloads: AtomicU32,
}

impl ScriptedDeployment {
    pub fn healthy() -> Self {
        Self {
            default: Mutex::new(HealthStatus::HEALTHY),
            scripted: Mutex::new(VecDeque::new()),
            reloads: AtomicU32::new(0),
        }
    }

    /// Answers consumed before the default applies again.
    pub fn script(&self, statuses: impl IntoIterator<Item = HealthStatus>) {
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(statuses);
    }

    pub fn set_default(&self, status: HealthStatus) {
        *self.default.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn reloads(&self) -> u32 {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Deployment for ScriptedDeployment {
    async fn restart_or_reload(&self, _service: &str) -> Result<(), RotationError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health(&self, _service: &str) -> Result<HealthStatus, RotationError> {
        let next = self.scripted.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        Ok(next.unwrap_or_else(|| *self.default.lock().unwrap_or_else(PoisonError::into_inner)))
    }
}

pub const UNREADY: HealthStatus = HealthStatus { ready: false, live: true };

/// Health probes per rollout check in the rotation harness.
pub const HEALTH_ATTEMPTS: u32 = 2;

/// Rotation controller over an in-memory secret store with a scripted
/// deployment, holding the workflow lock.
pub struct RotationHarness {
    pub dir: TempDir,
    pub locks: FileLockManager,
    pub token: LockToken,
    pub secrets: SecretStoreClient,
    pub deployment: Arc<ScriptedDeployment>,
    pub controller: RotationController,
}

impl RotationHarness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let locks = FileLockManager::new(dir.path().join("locks"), "e2e");
        let token = locks.acquire("custodian").expect("lock");
        let secrets = SecretStoreClient::new(Arc::new(LocalSecretStore::in_memory(SecretKey::generate())));
        let deployment = Arc::new(ScriptedDeployment::healthy());
        let controller = RotationController::new(
            secrets.clone(),
            Arc::new(CredentialRegistry::in_memory()),
            Arc::new(JobJournal::in_memory()),
            RolloutHealthVerifier::new(deployment.clone()),
            PolicySet::default().with_health(HEALTH_ATTEMPTS, Duration::from_millis(1)),
        );
        Self {
            dir,
            locks,
            token,
            secrets,
            deployment,
            controller,
        }
    }

    pub fn jwt_target() -> RotationTarget {
        RotationTarget::new(CredentialType::Jwt, SecretRef::new("prod", "auth-signing"), "auth")
    }

    pub fn dek_target() -> RotationTarget {
        RotationTarget::new(CredentialType::SymmetricKey, SecretRef::new("prod", "data-key"), "api")
    }

    pub async fn fields(&self, target: &RotationTarget) -> std::collections::BTreeMap<String, Vec<u8>> {
        self.secrets
            .snapshot(&target.secret)
            .await
            .expect("snapshot")
            .fields()
            .clone()
    }
}
