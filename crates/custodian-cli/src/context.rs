//! Wiring of configured components.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use custodian_backup::{
    BackupEngine, BackupPipeline, Catalog, CommandDumper, CommandRestoreTarget, Destinations, FsObjectStorage,
    ObjectStorage, ReplicationManager, RetentionManager, VerificationEngine,
};
use custodian_core::{FileLockManager, LockManager, LockToken, RetryPolicy};
use custodian_crypto::{CertificateIssuer, EncryptionPipeline, LocalCertificateAuthority, LocalKms, SecretKey};
use custodian_rotation::{
    CredentialRegistry, JobJournal, LocalSecretStore, RolloutHealthVerifier, RotationController, SecretStoreClient,
};
use tracing::{info, warn};

use crate::adapters::{HttpDeployment, HttpsCertificateProbe, PsqlDatabaseAdmin};
use crate::config::Config;
use crate::error::CliError;

/// Holds the workflow lock until dropped.
pub struct LockGuard {
    manager: Arc<dyn LockManager>,
    token: LockToken,
}

impl LockGuard {
    /// The current token.
    #[must_use]
    pub const fn token(&self) -> &LockToken {
        &self.token
    }

    /// Pushes the lock expiry out before a long step.
    pub fn renew(&mut self) -> Result<(), CliError> {
        self.token = self.manager.renew(&self.token)?;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match self.manager.release(&self.token) {
            Ok(()) => info!(token = %self.token, "lock released"),
            Err(e) => warn!(token = %self.token, error = %e, "failed to release lock"),
        }
    }
}

/// Components built from a [`Config`].
pub struct Context {
    config: Config,
    locks: Arc<dyn LockManager>,
    catalog: Arc<Catalog>,
    storage: Arc<dyn ObjectStorage>,
}

impl Context {
    /// Opens the state directory and the catalog.
    pub fn open(config: Config) -> Result<Self, CliError> {
        std::fs::create_dir_all(&config.state_dir)?;
        let holder = config.lock.holder.clone().unwrap_or_else(default_holder);
        let locks = FileLockManager::new(config.lock_dir(), holder)
            .with_ttl(chrono::Duration::minutes(config.lock.ttl_minutes));
        let catalog = Arc::new(Catalog::open(&config.state_dir)?);
        let storage: Arc<dyn ObjectStorage> = Arc::new(FsObjectStorage::new(config.storage_root()));
        Ok(Self {
            config,
            locks: Arc::new(locks),
            catalog,
            storage,
        })
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The lock manager.
    #[must_use]
    pub fn locks(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    /// The backup catalog.
    #[must_use]
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Takes the workflow lock, failing fast if it is held.
    pub fn lock(&self) -> Result<LockGuard, CliError> {
        let token = self.locks.acquire(&self.config.lock.scope)?;
        info!(token = %token, "lock acquired");
        Ok(LockGuard {
            manager: Arc::clone(&self.locks),
            token,
        })
    }

    fn region_policy(&self) -> RetryPolicy {
        let backup = &self.config.backup;
        RetryPolicy::new(backup.region_attempts, Duration::from_millis(backup.region_interval_ms))
            .with_attempt_timeout(Duration::from_secs(self.config.timeouts.region_attempt_secs))
    }

    fn encryption(&self) -> Result<EncryptionPipeline, CliError> {
        let kms = LocalKms::open(&self.config.keyring_dir())?;
        kms.ensure_key(&self.config.kms.key_id)?;
        Ok(EncryptionPipeline::new(Arc::new(kms)))
    }

    /// Dump, encrypt, replicate and catalog.
    pub fn backup_pipeline(&self) -> Result<BackupPipeline, CliError> {
        let backup = &self.config.backup;
        let dumper = CommandDumper::new(&backup.pg_dump, &backup.mongodump);
        let engine = BackupEngine::new(self.config.work_dir(), Arc::new(dumper))
            .with_dump_timeout(Duration::from_secs(self.config.timeouts.dump_secs));
        let destinations = Destinations {
            primary: backup.primary.clone(),
            secondaries: backup.secondary_regions.clone(),
        };
        Ok(BackupPipeline::new(
            engine,
            self.encryption()?,
            ReplicationManager::new(Arc::clone(&self.storage), self.region_policy()),
            Arc::clone(&self.catalog),
            &self.config.kms.key_id,
            destinations,
        )
        .with_retention(backup.retention.policy()))
    }

    /// Backup verification, with a restore target when one is configured.
    pub fn verification(&self) -> Result<VerificationEngine, CliError> {
        let backup = &self.config.backup;
        let timeouts = &self.config.timeouts;
        let mut engine = VerificationEngine::new(
            Arc::clone(&self.catalog),
            Arc::clone(&self.storage),
            self.encryption()?,
            self.config.work_dir(),
        )
        .with_timeouts(
            Duration::from_secs(timeouts.download_secs),
            Duration::from_secs(timeouts.restore_secs),
        );

        if backup.restore_postgres.is_some() || backup.restore_mongo.is_some() {
            let mut target = CommandRestoreTarget::new().with_tools(&backup.pg_restore, &backup.mongorestore);
            if let Some(connection) = &backup.restore_postgres {
                target = target.with_postgres_target(connection);
            }
            if let Some(connection) = &backup.restore_mongo {
                target = target.with_mongo_target(connection);
            }
            engine = engine.with_restore_target(Arc::new(target));
        }
        Ok(engine)
    }

    /// Retention sweeps.
    #[must_use]
    pub fn retention(&self) -> RetentionManager {
        RetentionManager::new(Arc::clone(&self.catalog), Arc::clone(&self.storage), self.region_policy())
            .with_safety_margin(chrono::Duration::hours(self.config.backup.retention.safety_margin_hours))
    }

    /// Rollout health verification against the configured services.
    pub fn health_verifier(&self) -> Result<RolloutHealthVerifier, CliError> {
        let deployment = HttpDeployment::new(
            self.config.services.clone(),
            Duration::from_secs(self.config.timeouts.call_secs),
        )?;
        Ok(RolloutHealthVerifier::new(Arc::new(deployment))
            .with_probe_timeout(Duration::from_secs(self.config.timeouts.probe_secs)))
    }

    /// Credential registry.
    pub fn registry(&self) -> Result<CredentialRegistry, CliError> {
        Ok(CredentialRegistry::open(&self.config.state_dir)?)
    }

    /// Rotation job journal.
    pub fn journal(&self) -> Result<JobJournal, CliError> {
        Ok(JobJournal::open(&self.config.state_dir)?)
    }

    /// A rotation controller with every collaborator the configuration
    /// enables.
    pub fn rotation_controller(&self) -> Result<RotationController, CliError> {
        let config = &self.config;
        let master = load_or_create_master_key(&config.master_key_file())?;
        let store = LocalSecretStore::open(&config.state_dir, master)?;
        let secrets = SecretStoreClient::new(Arc::new(store))
            .with_timeout(Duration::from_secs(config.timeouts.secret_store_secs));

        let call_timeout = Duration::from_secs(config.timeouts.call_secs);
        let mut controller = RotationController::new(
            secrets,
            Arc::new(self.registry()?),
            Arc::new(self.journal()?),
            self.health_verifier()?,
            config.policies()?,
        )
        .with_call_timeout(call_timeout);

        if let Some(database) = &config.database {
            controller = controller.with_database(Arc::new(PsqlDatabaseAdmin::new(database)));
        }
        if config.services.values().any(|s| s.tls_url.is_some()) {
            let ca = LocalCertificateAuthority::load_or_create(&config.ca_dir(), &config.tls.ca_name)?;
            let probe = HttpsCertificateProbe::new(config.services.clone(), ca.ca_certificate_pem(), call_timeout)?;
            controller = controller.with_tls(Arc::new(probe), Arc::new(ca));
        }
        Ok(controller)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("state_dir", &self.config.state_dir)
            .field("scope", &self.config.lock.scope)
            .finish_non_exhaustive()
    }
}

fn default_holder() -> String {
    let pid = std::process::id();
    std::env::var("HOSTNAME").map_or_else(|_| format!("custodian-{pid}"), |host| format!("{host}:{pid}"))
}

/// Reads the base64 secret-store master key, creating it with mode 0600 on
/// first use.
pub fn load_or_create_master_key(path: &Path) -> Result<SecretKey, CliError> {
    if path.exists() {
        let encoded = std::fs::read_to_string(path)?;
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CliError::Config(format!("master key '{}' is not base64: {e}", path.display())))?;
        return Ok(SecretKey::from_bytes(&bytes)?);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let key = SecretKey::generate();
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    writeln!(file, "{}", BASE64.encode(key.as_bytes()))?;
    file.sync_all()?;
    warn!(path = %path.display(), "created new secret-store master key; back it up");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_key_is_created_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys/secret-store.key");
        let first = load_or_create_master_key(&path).expect("create");
        let second = load_or_create_master_key(&path).expect("load");
        assert_eq!(first, second);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn garbage_master_key_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secret-store.key");
        std::fs::write(&path, "not base64!").expect("write");
        assert!(matches!(load_or_create_master_key(&path), Err(CliError::Config(_))));
    }

    #[test]
    fn lock_guard_releases_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            state_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let context = Context::open(config).expect("open");
        {
            let _guard = context.lock().expect("first");
            assert!(matches!(context.lock(), Err(CliError::Lock(_))));
        }
        assert!(context.lock().is_ok());
    }
}
