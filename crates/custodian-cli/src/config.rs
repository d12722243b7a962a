//! Custodian configuration.
//!
//! Loaded from a TOML file. Every section is optional and falls back to its
//! defaults:
//! - `state_dir`, `[lock]`, `[timeouts]`, `[health]`
//! - `[backup]` with `[[backup.sources]]`, `[backup.primary]`,
//!   `[[backup.secondary_regions]]` and `[backup.retention]`
//! - `[kms]`, `[secrets]`, `[tls]`, `[database]`
//! - `[rotation]` with `[rotation.grace_minutes]` and `[[rotation.targets]]`
//! - `[services.<name>]` endpoints

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use custodian_backup::{DumpRequest, RetentionPolicy, SourceSystem, StorageLocation};
use custodian_rotation::{CredentialType, PolicySet, RotationTarget, SecretRef, TlsSubject};
use serde::{Deserialize, Serialize};

use crate::error::CliError;

/// Workflow lock settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// Lock scope shared by every mutating command.
    pub scope: String,
    /// Lock time-to-live in minutes.
    pub ttl_minutes: i64,
    /// Holder identity recorded in the lock file.
    pub holder: Option<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            scope: "custodian".to_string(),
            ttl_minutes: custodian_core::lock::DEFAULT_TTL_MINUTES,
            holder: None,
        }
    }
}

/// Deadlines for external calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Database dump.
    pub dump_secs: u64,
    /// One backup download during verification.
    pub download_secs: u64,
    /// Test restore.
    pub restore_secs: u64,
    /// One region upload, copy or delete attempt.
    pub region_attempt_secs: u64,
    /// Secret store calls.
    pub secret_store_secs: u64,
    /// Deployment, database and TLS probe calls.
    pub call_secs: u64,
    /// One health probe.
    pub probe_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dump_secs: 60 * 60,
            download_secs: 5 * 60,
            restore_secs: 30 * 60,
            region_attempt_secs: 10 * 60,
            secret_store_secs: 10,
            call_secs: 30,
            probe_secs: 5,
        }
    }
}

/// Rollout health verification budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    /// Probes before a rollout is declared failed.
    pub attempts: u32,
    /// Delay between probes, in milliseconds.
    pub interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval_ms: 6_000,
        }
    }
}

impl HealthConfig {
    /// Delay between probes.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// One database to back up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    /// Name used on the command line.
    pub name: String,
    /// Source system.
    pub system: SourceSystem,
    /// Connection string handed to the dump tool.
    pub connection: String,
    /// Compression level, 0-9.
    #[serde(default = "default_compression")]
    pub compression_level: u8,
    /// Parallel collections (mongo).
    #[serde(default = "default_parallelism")]
    pub parallelism: u16,
    /// Request a point-in-time oplog marker (sharded mongo).
    #[serde(default)]
    pub sharded: bool,
}

const fn default_compression() -> u8 {
    6
}

const fn default_parallelism() -> u16 {
    1
}

impl SourceConfig {
    /// The dump request for this source.
    #[must_use]
    pub fn request(&self) -> DumpRequest {
        DumpRequest {
            source_system: self.system,
            connection: self.connection.clone(),
            compression_level: self.compression_level,
            parallelism: self.parallelism,
            sharded: self.sharded,
        }
    }
}

/// Retention periods and sweep safety margin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    /// Daily backups, in days.
    pub daily_days: u32,
    /// Weekly backups, in days.
    pub weekly_days: u32,
    /// Monthly backups, in days.
    pub monthly_days: u32,
    /// Backups younger than this are never swept.
    pub safety_margin_hours: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        let policy = RetentionPolicy::default();
        Self {
            daily_days: policy.daily_days,
            weekly_days: policy.weekly_days,
            monthly_days: policy.monthly_days,
            safety_margin_hours: custodian_backup::retention::DEFAULT_SAFETY_MARGIN_HOURS,
        }
    }
}

impl RetentionConfig {
    /// Retention periods per classification.
    #[must_use]
    pub const fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            daily_days: self.daily_days,
            weekly_days: self.weekly_days,
            monthly_days: self.monthly_days,
        }
    }
}

/// Backup settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackupConfig {
    /// Where dumps are staged; defaults to `<state_dir>/work`.
    pub work_dir: Option<PathBuf>,
    /// Root of the filesystem object store; defaults to `<state_dir>/objects`.
    pub storage_root: Option<PathBuf>,
    /// `pg_dump` binary.
    pub pg_dump: String,
    /// `mongodump` binary.
    pub mongodump: String,
    /// `pg_restore` binary.
    pub pg_restore: String,
    /// `mongorestore` binary.
    pub mongorestore: String,
    /// Disposable postgres database for test restores.
    pub restore_postgres: Option<String>,
    /// Disposable mongo deployment for test restores.
    pub restore_mongo: Option<String>,
    /// Attempts per region operation.
    pub region_attempts: u32,
    /// Delay between region attempts, in milliseconds.
    pub region_interval_ms: u64,
    /// Run a test restore when `run` verifies its backups.
    pub test_restore_on_run: bool,
    /// Databases to back up.
    pub sources: Vec<SourceConfig>,
    /// Authoritative location.
    pub primary: StorageLocation,
    /// Copies.
    pub secondary_regions: Vec<StorageLocation>,
    /// Retention.
    pub retention: RetentionConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            storage_root: None,
            pg_dump: "pg_dump".to_string(),
            mongodump: "mongodump".to_string(),
            pg_restore: "pg_restore".to_string(),
            mongorestore: "mongorestore".to_string(),
            restore_postgres: None,
            restore_mongo: None,
            region_attempts: 3,
            region_interval_ms: 2_000,
            test_restore_on_run: true,
            sources: Vec::new(),
            primary: StorageLocation::new("primary", "custodian-backups"),
            secondary_regions: Vec::new(),
            retention: RetentionConfig::default(),
        }
    }
}

impl BackupConfig {
    /// Looks up a source by name.
    pub fn source(&self, name: &str) -> Result<&SourceConfig, CliError> {
        self.sources
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CliError::InvalidArgument(format!("no backup source named '{name}'")))
    }
}

/// KMS settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KmsConfig {
    /// Master key that wraps backup data keys.
    pub key_id: String,
    /// Keyring directory; defaults to `state_dir`.
    pub keyring_dir: Option<PathBuf>,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            key_id: "custodian-backup".to_string(),
            keyring_dir: None,
        }
    }
}

/// Local secret store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecretsConfig {
    /// Base64 master key file; defaults to `<state_dir>/secret-store.key`
    /// and is created on first use.
    pub master_key_file: Option<PathBuf>,
}

/// Certificate issuer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TlsConfig {
    /// CA key and root certificate directory; defaults to `<state_dir>/ca`.
    pub ca_dir: Option<PathBuf>,
    /// CA common name.
    pub ca_name: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_dir: None,
            ca_name: "Custodian Internal CA".to_string(),
        }
    }
}

/// Database administration settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// `psql` binary.
    #[serde(default = "default_psql")]
    pub psql: String,
    /// Connection string of an administrative role.
    pub admin_dsn: String,
    /// Connection string used to test logins; `user=<role>` is appended.
    pub login_dsn: String,
}

fn default_psql() -> String {
    "psql".to_string()
}

/// Endpoints of one consuming service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    /// POSTed to reload or restart the service.
    pub reload_url: String,
    /// Readiness endpoint; any 2xx answer means ready.
    pub ready_url: String,
    /// Liveness endpoint; defaults to the readiness endpoint.
    #[serde(default)]
    pub live_url: Option<String>,
    /// HTTPS URL whose presented certificate is checked after TLS rotation.
    #[serde(default)]
    pub tls_url: Option<String>,
}

/// Certificate subject of a TLS target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsSubjectConfig {
    /// Common name.
    pub common_name: String,
    /// Subject alternative names.
    #[serde(default)]
    pub dns_names: Vec<String>,
    /// Validity in days.
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
}

const fn default_validity_days() -> u32 {
    custodian_rotation::controller::DEFAULT_TLS_VALIDITY_DAYS
}

/// One secret to rotate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetConfig {
    /// Credential type.
    #[serde(rename = "type")]
    pub credential_type: CredentialType,
    /// Secret namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Secret name.
    pub secret: String,
    /// Consuming service, a key of `[services]`.
    pub service: String,
    /// Base login role (database targets).
    #[serde(default)]
    pub db_role: Option<String>,
    /// Certificate subject (TLS targets).
    #[serde(default)]
    pub tls: Option<TlsSubjectConfig>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl TargetConfig {
    /// The rotation target.
    #[must_use]
    pub fn target(&self) -> RotationTarget {
        let mut target = RotationTarget::new(
            self.credential_type,
            SecretRef::new(&self.namespace, &self.secret),
            &self.service,
        );
        if let Some(role) = &self.db_role {
            target = target.with_db_role(role);
        }
        if let Some(tls) = &self.tls {
            target = target.with_tls(TlsSubject {
                common_name: tls.common_name.clone(),
                dns_names: tls.dns_names.clone(),
                validity_days: tls.validity_days,
            });
        }
        target
    }
}

/// Rotation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RotationConfig {
    /// Grace window overrides keyed by credential type, in minutes.
    pub grace_minutes: BTreeMap<String, i64>,
    /// Secrets to rotate.
    pub targets: Vec<TargetConfig>,
}

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Catalog, registry, journal, keyrings and locks live here.
    pub state_dir: PathBuf,
    /// Workflow lock.
    pub lock: LockConfig,
    /// External call deadlines.
    pub timeouts: TimeoutConfig,
    /// Rollout health budget.
    pub health: HealthConfig,
    /// Backups.
    pub backup: BackupConfig,
    /// KMS.
    pub kms: KmsConfig,
    /// Secret store.
    pub secrets: SecretsConfig,
    /// Credential rotation.
    pub rotation: RotationConfig,
    /// Consuming services by name.
    pub services: BTreeMap<String, ServiceConfig>,
    /// Database administration; required for `db-password` targets.
    pub database: Option<DatabaseConfig>,
    /// Certificate issuer.
    pub tls: TlsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/custodian"),
            lock: LockConfig::default(),
            timeouts: TimeoutConfig::default(),
            health: HealthConfig::default(),
            backup: BackupConfig::default(),
            kms: KmsConfig::default(),
            secrets: SecretsConfig::default(),
            rotation: RotationConfig::default(),
            services: BTreeMap::new(),
            database: None,
            tls: TlsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CliError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CliError::Config(format!("failed to read config file '{}': {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, CliError> {
        let config: Self = toml::from_str(content).map_err(|e| CliError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CliError> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(CliError::Config("state_dir cannot be empty".to_string()));
        }
        if self.lock.scope.is_empty() {
            return Err(CliError::Config("lock.scope cannot be empty".to_string()));
        }
        if self.lock.ttl_minutes <= 0 {
            return Err(CliError::Config("lock.ttl_minutes must be positive".to_string()));
        }
        if self.health.attempts == 0 {
            return Err(CliError::Config("health.attempts must be at least 1".to_string()));
        }
        if self.backup.region_attempts == 0 {
            return Err(CliError::Config("backup.region_attempts must be at least 1".to_string()));
        }
        if self.kms.key_id.is_empty() || self.kms.key_id.len() > 255 {
            return Err(CliError::Config("kms.key_id must be 1-255 bytes".to_string()));
        }

        self.validate_backup()?;
        self.grace_overrides()?;
        self.validate_targets()
    }

    fn validate_backup(&self) -> Result<(), CliError> {
        let mut names = BTreeSet::new();
        for source in &self.backup.sources {
            if source.name.is_empty() {
                return Err(CliError::Config("backup source name cannot be empty".to_string()));
            }
            if !names.insert(source.name.as_str()) {
                return Err(CliError::Config(format!("duplicate backup source '{}'", source.name)));
            }
            source
                .request()
                .validate()
                .map_err(|e| CliError::Config(format!("backup source '{}': {e}", source.name)))?;
        }

        let mut regions = BTreeSet::from([self.backup.primary.region.as_str()]);
        for location in &self.backup.secondary_regions {
            if !regions.insert(location.region.as_str()) {
                return Err(CliError::Config(format!(
                    "region '{}' is configured more than once",
                    location.region
                )));
            }
        }
        Ok(())
    }

    fn validate_targets(&self) -> Result<(), CliError> {
        let mut types = BTreeSet::new();
        for target in &self.rotation.targets {
            let name = format!("{}/{}", target.namespace, target.secret);
            if !types.insert(target.credential_type) {
                return Err(CliError::Config(format!(
                    "rotation target '{name}': only one {} target may be configured",
                    target.credential_type
                )));
            }
            let service = self.services.get(&target.service).ok_or_else(|| {
                CliError::Config(format!(
                    "rotation target '{name}' names unknown service '{}'",
                    target.service
                ))
            })?;
            match target.credential_type {
                CredentialType::Jwt | CredentialType::SymmetricKey => {}
                CredentialType::DbPassword => {
                    if self.database.is_none() {
                        return Err(CliError::Config(format!(
                            "rotation target '{name}' needs a [database] section"
                        )));
                    }
                    let role = target.db_role.as_deref().unwrap_or_default();
                    if !is_identifier(role) {
                        return Err(CliError::Config(format!(
                            "rotation target '{name}' needs a db_role of [a-z0-9_] characters"
                        )));
                    }
                }
                CredentialType::TlsCert => {
                    if target.tls.is_none() {
                        return Err(CliError::Config(format!("rotation target '{name}' needs a tls subject")));
                    }
                    if service.tls_url.is_none() {
                        return Err(CliError::Config(format!(
                            "service '{}' needs a tls_url for certificate rotation",
                            target.service
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn grace_overrides(&self) -> Result<Vec<(CredentialType, chrono::Duration)>, CliError> {
        self.rotation
            .grace_minutes
            .iter()
            .map(|(name, minutes)| {
                let credential_type = CredentialType::from_str(name)
                    .map_err(|e| CliError::Config(format!("rotation.grace_minutes: {e}")))?;
                if *minutes < 0 {
                    return Err(CliError::Config(format!(
                        "rotation.grace_minutes.{name} cannot be negative"
                    )));
                }
                Ok((credential_type, chrono::Duration::minutes(*minutes)))
            })
            .collect()
    }

    /// Rotation policies with the configured overrides applied.
    pub fn policies(&self) -> Result<PolicySet, CliError> {
        let set = self
            .grace_overrides()?
            .into_iter()
            .fold(PolicySet::default(), |set, (t, grace)| set.with_grace(t, grace));
        Ok(set.with_health(self.health.attempts, self.health.interval()))
    }

    /// Configured targets of one type.
    #[must_use]
    pub fn targets_of(&self, credential_type: CredentialType) -> Vec<RotationTarget> {
        self.rotation
            .targets
            .iter()
            .filter(|t| t.credential_type == credential_type)
            .map(TargetConfig::target)
            .collect()
    }

    /// Every configured target.
    #[must_use]
    pub fn targets(&self) -> Vec<RotationTarget> {
        self.rotation.targets.iter().map(TargetConfig::target).collect()
    }

    /// Lock files directory.
    #[must_use]
    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    /// Dump staging directory.
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        self.backup.work_dir.clone().unwrap_or_else(|| self.state_dir.join("work"))
    }

    /// Object store root.
    #[must_use]
    pub fn storage_root(&self) -> PathBuf {
        self.backup
            .storage_root
            .clone()
            .unwrap_or_else(|| self.state_dir.join("objects"))
    }

    /// KMS keyring directory.
    #[must_use]
    pub fn keyring_dir(&self) -> PathBuf {
        self.kms.keyring_dir.clone().unwrap_or_else(|| self.state_dir.clone())
    }

    /// Secret store master key file.
    #[must_use]
    pub fn master_key_file(&self) -> PathBuf {
        self.secrets
            .master_key_file
            .clone()
            .unwrap_or_else(|| self.state_dir.join("secret-store.key"))
    }

    /// CA directory.
    #[must_use]
    pub fn ca_dir(&self) -> PathBuf {
        self.tls.ca_dir.clone().unwrap_or_else(|| self.state_dir.join("ca"))
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 60
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
