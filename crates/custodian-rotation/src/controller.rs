//! Rotation controller.
//!
//! Drives one credential through
//! `Generating → Staged → Applying → RollingOut → Verifying → Finalized`.
//! A failure in any step moves the job to `RollingBack`: the secret is put
//! back to its pre-rotation snapshot, a freshly written database role is
//! revoked, the service is reloaded and re-verified. A rotation that cannot
//! be rolled back ends `failed` with [`FailureKind::RollbackFailed`] and
//! leaves its version staged, which blocks further rotations of that type
//! until an operator calls [`RotationController::abandon_staged`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use custodian_core::{FailureKind, LockToken, with_deadline};
use custodian_crypto::ca::IssuedCertificate;
use custodian_crypto::jwt::{ACTIVE_KID_FIELD, SIGNING_KEY_FIELD, kid_for, public_key_field};
use custodian_crypto::keyring::{ACTIVE_FIELD, key_field};
use custodian_crypto::material::sha256_hex;
use custodian_crypto::{
    CertificateIssuer, Ed25519Material, Material, PasswordMaterial, SymmetricMaterial, TlsMaterial,
};
use tracing::{debug, error, info, warn};

use crate::database::{DatabaseAdmin, alternate_role};
use crate::error::{Result, RotationError};
use crate::health::{RolloutHealthVerifier, TlsEndpointProbe};
use crate::journal::JobJournal;
use crate::policy::{PolicySet, RotationPolicy};
use crate::registry::CredentialRegistry;
use crate::secret_store::{SecretPatch, SecretRef, SecretSnapshot, SecretStoreClient};
use crate::types::{CredentialType, CredentialVersion, JobFailure, JobOutcome, RotationJob, RotationState};

/// Default deadline for deployment, database and TLS probe calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default certificate lifetime.
pub const DEFAULT_TLS_VALIDITY_DAYS: u32 = 90;

/// Secret field holding the database login role.
pub const DB_USERNAME_FIELD: &str = "db.username";
/// Secret field holding the database password.
pub const DB_PASSWORD_FIELD: &str = "db.password";
/// Secret field holding the PEM certificate.
pub const TLS_CERT_FIELD: &str = "tls.crt";
/// Secret field holding the PEM private key.
pub const TLS_KEY_FIELD: &str = "tls.key";
/// Secret field holding the issuing CA certificate.
pub const TLS_CA_FIELD: &str = "ca.crt";

/// Subject of a rotated TLS certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSubject {
    /// Common name.
    pub common_name: String,
    /// Subject alternative names.
    pub dns_names: Vec<String>,
    /// Requested lifetime.
    pub validity_days: u32,
}

/// What to rotate and who consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationTarget {
    /// Credential kind.
    pub credential_type: CredentialType,
    /// Secret holding the material.
    pub secret: SecretRef,
    /// Service that reads the secret.
    pub service: String,
    /// Base login role (`<role>_a` / `<role>_b` are used); database only.
    pub db_role: Option<String>,
    /// Certificate subject; TLS only.
    pub tls: Option<TlsSubject>,
}

impl RotationTarget {
    /// Creates a target.
    #[must_use]
    pub fn new(credential_type: CredentialType, secret: SecretRef, service: impl Into<String>) -> Self {
        Self {
            credential_type,
            secret,
            service: service.into(),
            db_role: None,
            tls: None,
        }
    }

    /// Sets the base database role.
    #[must_use]
    pub fn with_db_role(mut self, role: impl Into<String>) -> Self {
        self.db_role = Some(role.into());
        self
    }

    /// Sets the certificate subject.
    #[must_use]
    pub fn with_tls(mut self, subject: TlsSubject) -> Self {
        self.tls = Some(subject);
        self
    }
}

struct Fresh {
    material: Material,
    certificate: Option<IssuedCertificate>,
}

impl Fresh {
    fn fingerprint(&self) -> String {
        self.certificate
            .as_ref()
            .map_or_else(|| self.material.fingerprint(), |c| c.fingerprint.clone())
    }
}

#[derive(Default)]
struct Progress {
    snapshot: Option<SecretSnapshot>,
    version: Option<u32>,
    new_role: Option<String>,
    active_role: Option<String>,
    applied: bool,
}

struct StepFailure {
    state: RotationState,
    error: RotationError,
}

async fn run_step<T>(
    job: &mut RotationJob,
    state: RotationState,
    step: impl Future<Output = Result<(T, String)>>,
) -> std::result::Result<T, StepFailure> {
    let started_at = Utc::now();
    debug!(job_id = %job.id, state = %state, "step started");
    match step.await {
        Ok((value, detail)) => {
            debug!(job_id = %job.id, state = %state, detail = %detail, "step finished");
            job.record(state, started_at, true, detail);
            Ok(value)
        }
        Err(error) => {
            warn!(job_id = %job.id, state = %state, error = %error, kind = %error.kind(), "step failed");
            job.record(state, started_at, false, error.to_string());
            Err(StepFailure { state, error })
        }
    }
}

/// Fields holding material of a version that is no longer accepted.
fn retirement_patch(version: &CredentialVersion, current: &SecretSnapshot) -> SecretPatch {
    let field = match version.credential_type {
        CredentialType::Jwt => public_key_field(&kid_for(version.version)),
        CredentialType::SymmetricKey => key_field(version.version),
        CredentialType::DbPassword | CredentialType::TlsCert => return SecretPatch::new(),
    };
    if current.field(&field).is_some() {
        SecretPatch::new().remove(field)
    } else {
        SecretPatch::new()
    }
}

/// Runs rotations.
pub struct RotationController {
    secrets: SecretStoreClient,
    registry: Arc<CredentialRegistry>,
    journal: Arc<JobJournal>,
    verifier: RolloutHealthVerifier,
    policies: PolicySet,
    database: Option<Arc<dyn DatabaseAdmin>>,
    tls_probe: Option<Arc<dyn TlsEndpointProbe>>,
    issuer: Option<Arc<dyn CertificateIssuer>>,
    call_timeout: Duration,
}

impl RotationController {
    /// Creates a controller for JWT and symmetric-key rotation; database and
    /// TLS rotation need [`with_database`](Self::with_database) and
    /// [`with_tls`](Self::with_tls).
    #[must_use]
    pub fn new(
        secrets: SecretStoreClient,
        registry: Arc<CredentialRegistry>,
        journal: Arc<JobJournal>,
        verifier: RolloutHealthVerifier,
        policies: PolicySet,
    ) -> Self {
        Self {
            secrets,
            registry,
            journal,
            verifier,
            policies,
            database: None,
            tls_probe: None,
            issuer: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Enables database password rotation.
    #[must_use]
    pub fn with_database(mut self, database: Arc<dyn DatabaseAdmin>) -> Self {
        self.database = Some(database);
        self
    }

    /// Enables TLS certificate rotation.
    #[must_use]
    pub fn with_tls(mut self, probe: Arc<dyn TlsEndpointProbe>, issuer: Arc<dyn CertificateIssuer>) -> Self {
        self.tls_probe = Some(probe);
        self.issuer = Some(issuer);
        self
    }

    /// Sets the deadline for deployment, database and probe calls.
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// The credential registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<CredentialRegistry> {
        &self.registry
    }

    /// The job journal.
    #[must_use]
    pub fn journal(&self) -> &Arc<JobJournal> {
        &self.journal
    }

    async fn bounded<T>(&self, operation: &str, kind: FailureKind, fut: impl Future<Output = Result<T>>) -> Result<T> {
        with_deadline(self.call_timeout, fut)
            .await
            .map_err(|t| RotationError::timeout(operation, t.after, kind))?
    }

    fn database(&self) -> Result<&Arc<dyn DatabaseAdmin>> {
        self.database
            .as_ref()
            .ok_or_else(|| RotationError::Config("database rotation needs a database admin".into()))
    }

    fn tls_probe(&self) -> Result<&Arc<dyn TlsEndpointProbe>> {
        self.tls_probe
            .as_ref()
            .ok_or_else(|| RotationError::Config("TLS rotation needs an endpoint probe".into()))
    }

    fn issuer(&self) -> Result<&Arc<dyn CertificateIssuer>> {
        self.issuer
            .as_ref()
            .ok_or_else(|| RotationError::Config("TLS rotation needs a certificate issuer".into()))
    }

    fn check_target(&self, target: &RotationTarget) -> Result<()> {
        match target.credential_type {
            CredentialType::Jwt | CredentialType::SymmetricKey => Ok(()),
            CredentialType::DbPassword => {
                self.database()?;
                if target.db_role.as_deref().is_none_or(str::is_empty) {
                    return Err(RotationError::Config(format!(
                        "database target '{}' has no login role",
                        target.secret
                    )));
                }
                Ok(())
            }
            CredentialType::TlsCert => {
                self.tls_probe()?;
                self.issuer()?;
                if target.tls.is_none() {
                    return Err(RotationError::Config(format!(
                        "TLS target '{}' has no certificate subject",
                        target.secret
                    )));
                }
                Ok(())
            }
        }
    }

    /// Rotates one credential under `token`.
    ///
    /// Returns `Err` only when the job could not start: an expired lock
    /// token, an in-flight rotation of the same type, an incomplete target,
    /// or a target whose secret differs from the one the type's live
    /// versions were written to. Once started, the job is journaled and returned whatever its
    /// outcome.
    pub async fn rotate(&self, token: &LockToken, target: &RotationTarget) -> Result<RotationJob> {
        if token.is_expired_at(Utc::now()) {
            return Err(RotationError::LockExpired {
                token: token.to_string(),
            });
        }
        self.check_target(target)?;
        if let Some(bound) = self.registry.bound_secret(target.credential_type) {
            if bound != target.secret.to_string() {
                return Err(RotationError::Config(format!(
                    "{} credentials live in '{bound}', not '{}'; one target per credential type",
                    target.credential_type, target.secret
                )));
            }
        }
        if let Some(staged) = self.registry.staged(target.credential_type) {
            return Err(RotationError::ConcurrentRotation {
                credential_type: target.credential_type,
                version: staged.version,
            });
        }

        let policy = self.policies.for_type(target.credential_type);
        let mut job = RotationJob::begin(target.credential_type, token);
        let mut progress = Progress::default();
        info!(
            job_id = %job.id,
            credential_type = %target.credential_type,
            secret = %target.secret,
            service = %target.service,
            "rotation started"
        );

        let outcome = self.execute(&mut job, target, &policy, &mut progress).await;
        match outcome {
            Ok(()) => {
                job.finish(JobOutcome::Success, None);
                info!(job_id = %job.id, version = ?job.version, "rotation finalized");
            }
            Err(failure) => self.roll_back(&mut job, target, &policy, &progress, failure).await,
        }

        if let Err(e) = self.journal.append(&job) {
            error!(job_id = %job.id, error = %e, "failed to journal rotation job");
        }
        Ok(job)
    }

    async fn execute(
        &self,
        job: &mut RotationJob,
        target: &RotationTarget,
        policy: &RotationPolicy,
        progress: &mut Progress,
    ) -> std::result::Result<(), StepFailure> {
        let fresh = run_step(job, RotationState::Generating, self.generate(target)).await?;
        let patch = run_step(job, RotationState::Staged, self.stage(target, &fresh, progress)).await?;
        job.version = progress.version;
        run_step(job, RotationState::Applying, self.apply(target, &fresh, &patch, progress)).await?;
        run_step(job, RotationState::RollingOut, self.roll_out(target)).await?;
        run_step(job, RotationState::Verifying, self.verify(target, &fresh, policy, progress)).await?;
        run_step(job, RotationState::Finalized, self.finalize(target, policy, progress)).await?;
        Ok(())
    }

    async fn generate(&self, target: &RotationTarget) -> Result<(Fresh, String)> {
        let fresh = match target.credential_type {
            CredentialType::Jwt => Fresh {
                material: Material::Ed25519(Ed25519Material::generate()?),
                certificate: None,
            },
            CredentialType::SymmetricKey => Fresh {
                material: Material::Symmetric(SymmetricMaterial::generate()),
                certificate: None,
            },
            CredentialType::DbPassword => Fresh {
                material: Material::Password(PasswordMaterial::generate()),
                certificate: None,
            },
            CredentialType::TlsCert => {
                let subject = target
                    .tls
                    .as_ref()
                    .ok_or_else(|| RotationError::Config("missing TLS subject".into()))?;
                let material = TlsMaterial::generate(&subject.common_name, &subject.dns_names)?;
                let certificate = self.issuer()?.issue(material.csr_pem(), subject.validity_days)?;
                Fresh {
                    material: Material::Tls(material),
                    certificate: Some(certificate),
                }
            }
        };
        let detail = format!("{} material generated ({})", fresh.material.kind_name(), fresh.fingerprint());
        Ok((fresh, detail))
    }

    async fn stage(&self, target: &RotationTarget, fresh: &Fresh, progress: &mut Progress) -> Result<(SecretPatch, String)> {
        let snapshot = self.secrets.snapshot(&target.secret).await?;

        if let Some(base) = &target.db_role {
            if target.credential_type == CredentialType::DbPassword {
                let active_role = self
                    .registry
                    .active(CredentialType::DbPassword)
                    .and_then(|v| v.login_role);
                progress.new_role = Some(alternate_role(base, active_role.as_deref()));
                progress.active_role = active_role;
            }
        }

        let staged = self.registry.stage(
            target.credential_type,
            &target.secret.to_string(),
            fresh.fingerprint(),
            progress.new_role.clone(),
            Utc::now(),
        )?;
        progress.version = Some(staged.version);

        let patch = self.compose_patch(fresh, staged.version, progress.new_role.as_deref())?;
        let detail = format!(
            "v{} staged; patch of {} touches {:?} at revision {}",
            staged.version,
            target.secret,
            patch.touched(),
            snapshot.revision()
        );
        progress.snapshot = Some(snapshot);
        Ok((patch, detail))
    }

    fn compose_patch(&self, fresh: &Fresh, version: u32, role: Option<&str>) -> Result<SecretPatch> {
        let patch = match &fresh.material {
            Material::Ed25519(key) => {
                let kid = kid_for(version);
                SecretPatch::new()
                    .set(public_key_field(&kid), key.public_key().to_vec())
                    .set(SIGNING_KEY_FIELD, key.pkcs8_der().to_vec())
                    .set(ACTIVE_KID_FIELD, kid.into_bytes())
            }
            Material::Symmetric(key) => SecretPatch::new()
                .set(key_field(version), key.as_bytes().to_vec())
                .set(ACTIVE_FIELD, version.to_string().into_bytes()),
            Material::Password(password) => {
                let role = role.ok_or_else(|| RotationError::Config("database rotation without a login role".into()))?;
                SecretPatch::new()
                    .set(DB_USERNAME_FIELD, role.as_bytes().to_vec())
                    .set(DB_PASSWORD_FIELD, password.expose().as_bytes().to_vec())
            }
            Material::Tls(tls) => {
                let certificate = fresh
                    .certificate
                    .as_ref()
                    .ok_or_else(|| RotationError::Config("TLS material without a certificate".into()))?;
                SecretPatch::new()
                    .set(TLS_CERT_FIELD, certificate.pem.clone().into_bytes())
                    .set(TLS_KEY_FIELD, tls.key_pem().as_bytes().to_vec())
                    .set(TLS_CA_FIELD, self.issuer()?.ca_certificate_pem().as_bytes().to_vec())
            }
        };
        Ok(patch)
    }

    async fn apply(
        &self,
        target: &RotationTarget,
        fresh: &Fresh,
        patch: &SecretPatch,
        progress: &mut Progress,
    ) -> Result<((), String)> {
        let expected = progress.snapshot.as_ref().map_or(0, SecretSnapshot::revision);

        if let (Material::Password(password), Some(role)) = (&fresh.material, progress.new_role.clone()) {
            let database = self.database()?;
            progress.applied = true;
            self.bounded(
                "database set_password",
                FailureKind::SecretPatchFailed,
                database.set_password(&role, password.expose()),
            )
            .await
            .map_err(|e| match e {
                RotationError::Database { role, reason } => RotationError::SecretPatch {
                    secret: format!("login role {role}"),
                    reason,
                },
                other => other,
            })?;
            info!(role = %role, "password set on alternate role");
        }

        progress.applied = true;
        let revision = self.secrets.apply_patch(&target.secret, patch, expected).await?;
        Ok(((), format!("{} patched to revision {revision}", target.secret)))
    }

    async fn roll_out(&self, target: &RotationTarget) -> Result<((), String)> {
        let deployment = self.verifier.deployment();
        self.bounded(
            "deployment reload",
            FailureKind::RolloutHealthFailed,
            deployment.restart_or_reload(&target.service),
        )
        .await?;
        Ok(((), format!("{} reloaded", target.service)))
    }

    async fn verify(
        &self,
        target: &RotationTarget,
        fresh: &Fresh,
        policy: &RotationPolicy,
        progress: &Progress,
    ) -> Result<((), String)> {
        let verdict = self
            .verifier
            .check(&target.service, policy.health_attempts, policy.health_interval)
            .await
            .into_result()?;
        let mut detail = verdict.summary();

        match &fresh.material {
            Material::Password(password) => {
                let role = progress
                    .new_role
                    .as_deref()
                    .ok_or_else(|| RotationError::Config("database rotation without a login role".into()))?;
                let ok = self
                    .bounded(
                        "database login check",
                        FailureKind::RolloutHealthFailed,
                        self.database()?.check_login(role, password.expose()),
                    )
                    .await?;
                if !ok {
                    return Err(RotationError::Database {
                        role: role.to_string(),
                        reason: "login with the new credential was rejected".into(),
                    });
                }
                detail.push_str(&format!("; login as {role} succeeded"));
            }
            Material::Tls(_) => {
                let expected = fresh.fingerprint();
                let der = self
                    .bounded(
                        "TLS endpoint probe",
                        FailureKind::RolloutHealthFailed,
                        self.tls_probe()?.presented_certificate(&target.service),
                    )
                    .await?;
                let actual = sha256_hex(&der);
                if actual != expected {
                    return Err(RotationError::CertificateMismatch {
                        service: target.service.clone(),
                        expected,
                        actual,
                    });
                }
                detail.push_str("; endpoint presents the new certificate");
            }
            Material::Ed25519(_) | Material::Symmetric(_) => {}
        }
        Ok(((), detail))
    }

    async fn finalize(&self, target: &RotationTarget, policy: &RotationPolicy, progress: &Progress) -> Result<((), String)> {
        let version = progress
            .version
            .ok_or_else(|| RotationError::Config("finalize without a staged version".into()))?;
        let activation = self
            .registry
            .activate(target.credential_type, version, policy.grace, Utc::now())?;

        let mut detail = format!("v{version} active");
        if let Some(previous) = &activation.previous {
            match previous.retire_after {
                Some(at) => detail.push_str(&format!("; v{} retiring until {at}", previous.version)),
                None => detail.push_str(&format!("; v{} retired", previous.version)),
            }
        }

        if !activation.retired_now.is_empty() {
            let active_role = activation.activated.login_role.as_deref();
            if let Err(e) = self.remove_material(target, &activation.retired_now, active_role).await {
                warn!(
                    credential_type = %target.credential_type,
                    error = %e,
                    "leftover material of retired versions not removed; retire-expired will retry"
                );
                detail.push_str("; cleanup of retired material deferred");
            }
        }
        Ok(((), detail))
    }

    async fn roll_back(
        &self,
        job: &mut RotationJob,
        target: &RotationTarget,
        policy: &RotationPolicy,
        progress: &Progress,
        failure: StepFailure,
    ) {
        let StepFailure { state, error: original } = failure;
        warn!(
            job_id = %job.id,
            failed_in = %state,
            kind = %original.kind(),
            error = %original,
            "rolling back rotation"
        );

        let started_at = Utc::now();
        match self.undo(target, policy, progress).await {
            Ok(detail) => {
                job.record(RotationState::RollingBack, started_at, true, detail);
                job.finish(
                    JobOutcome::RolledBack,
                    Some(JobFailure {
                        kind: original.kind(),
                        state,
                        message: original.to_string(),
                    }),
                );
                info!(job_id = %job.id, "rotation rolled back");
            }
            Err(e) => {
                let fatal = RotationError::RollbackFailed {
                    original: original.to_string(),
                    reason: e.to_string(),
                };
                job.record(RotationState::RollingBack, started_at, false, e.to_string());
                error!(
                    job_id = %job.id,
                    error = %fatal,
                    "rollback failed; manual intervention required"
                );
                job.finish(
                    JobOutcome::Failed,
                    Some(JobFailure {
                        kind: fatal.kind(),
                        state: RotationState::RollingBack,
                        message: fatal.to_string(),
                    }),
                );
            }
        }
    }

    async fn undo(&self, target: &RotationTarget, policy: &RotationPolicy, progress: &Progress) -> Result<String> {
        let mut done = Vec::new();

        if progress.applied {
            if let Some(snapshot) = &progress.snapshot {
                let revision = self.secrets.restore(snapshot).await?;
                done.push(format!("{} restored (revision {revision})", target.secret));
            }
            if let Some(role) = &progress.new_role {
                if progress.active_role.as_ref() != Some(role) {
                    self.bounded(
                        "database revoke_login",
                        FailureKind::RollbackFailed,
                        self.database()?.revoke_login(role),
                    )
                    .await?;
                    done.push(format!("login {role} revoked"));
                }
            }

            self.bounded(
                "deployment reload",
                FailureKind::RollbackFailed,
                self.verifier.deployment().restart_or_reload(&target.service),
            )
            .await?;
            let verdict = self
                .verifier
                .check(&target.service, policy.health_attempts, policy.health_interval)
                .await
                .into_result()?;
            done.push(format!("{} reloaded, {}", target.service, verdict.summary()));
        }

        if progress.version.is_some() {
            if let Some(discarded) = self.registry.discard_staged(target.credential_type, Utc::now())? {
                done.push(format!("v{} discarded", discarded.version));
            }
        }
        if done.is_empty() {
            done.push("nothing to undo".into());
        }
        Ok(done.join("; "))
    }

    async fn remove_material(
        &self,
        target: &RotationTarget,
        versions: &[CredentialVersion],
        active_role: Option<&str>,
    ) -> Result<()> {
        let current = self.secrets.snapshot(&target.secret).await?;
        let mut patch = SecretPatch::new();
        for version in versions {
            for field in retirement_patch(version, &current).removed() {
                patch = patch.remove(field.to_string());
            }
        }
        if !patch.is_empty() {
            self.secrets.apply_patch(&target.secret, &patch, current.revision()).await?;
        }

        for version in versions {
            let Some(role) = version.login_role.as_deref() else {
                continue;
            };
            if Some(role) == active_role {
                continue;
            }
            self.bounded(
                "database revoke_login",
                FailureKind::RolloutHealthFailed,
                self.database()?.revoke_login(role),
            )
            .await?;
            info!(role, version = version.version, "retired login revoked");
        }
        Ok(())
    }

    /// Retires every version whose grace window ended at or before `now`,
    /// removing its leftover material first.
    ///
    /// Each version is cleaned up in the secret it was written to; versions
    /// with no matching target are left retiring.
    pub async fn retire_expired(
        &self,
        token: &LockToken,
        targets: &[RotationTarget],
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<CredentialVersion>> {
        if token.is_expired_at(Utc::now()) {
            return Err(RotationError::LockExpired {
                token: token.to_string(),
            });
        }

        let mut retired = Vec::new();
        for version in self.registry.due_for_retirement(now) {
            let Some(target) = owning_target(targets, &version) else {
                warn!(
                    credential_type = %version.credential_type,
                    version = version.version,
                    secret = version.secret.as_deref().unwrap_or("-"),
                    "no matching target configured; version left retiring"
                );
                continue;
            };
            let active_role = self
                .registry
                .active(version.credential_type)
                .and_then(|v| v.login_role);
            self.remove_material(target, std::slice::from_ref(&version), active_role.as_deref())
                .await?;
            retired.push(self.registry.retire(version.credential_type, version.version, now)?);
        }
        Ok(retired)
    }

    /// Discards the staged version left by a failed rollback, once an
    /// operator has repaired the secret and the service by hand.
    pub fn abandon_staged(&self, credential_type: CredentialType) -> Result<Option<CredentialVersion>> {
        let discarded = self.registry.discard_staged(credential_type, Utc::now())?;
        if let Some(version) = &discarded {
            warn!(credential_type = %credential_type, version = version.version, "staged version abandoned");
        }
        Ok(discarded)
    }
}

/// The target holding `version`'s secret. Records without a secret only
/// resolve when a single target of their type is configured.
fn owning_target<'a>(targets: &'a [RotationTarget], version: &CredentialVersion) -> Option<&'a RotationTarget> {
    let mut of_type = targets.iter().filter(|t| t.credential_type == version.credential_type);
    match version.secret.as_deref() {
        Some(secret) => of_type.find(|t| t.secret.to_string() == secret),
        None => of_type.next().filter(|_| of_type.next().is_none()),
    }
}

impl std::fmt::Debug for RotationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationController")
            .field("secrets", &self.secrets)
            .field("database", &self.database.is_some())
            .field("tls", &self.tls_probe.is_some())
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Duration as ChronoDuration;
    use custodian_core::{FileLockManager, LockManager};
    use custodian_crypto::{JwtSigner, JwtVerifier, LocalCertificateAuthority, SecretKey, TokenClaims, VersionedKeyring};

    use super::*;
    use crate::health::HealthStatus;
    use crate::secret_store::LocalSecretStore;
    use crate::test_support::{FakeDatabase, FakeDeployment, FakeTlsProbe, pem_to_der};
    use crate::types::VersionStatus;

    struct Harness {
        _dir: tempfile::TempDir,
        token: LockToken,
        secrets: SecretStoreClient,
        deployment: Arc<FakeDeployment>,
        database: Arc<FakeDatabase>,
        controller: RotationController,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = FileLockManager::new(dir.path(), "test").acquire("rotation").expect("lock");
        let secrets = SecretStoreClient::new(Arc::new(LocalSecretStore::in_memory(SecretKey::generate())));
        let deployment = Arc::new(FakeDeployment::healthy());
        let database = Arc::new(FakeDatabase::default());
        let probe = Arc::new(FakeTlsProbe::new(secrets.clone(), tls_target().secret));
        let issuer = Arc::new(LocalCertificateAuthority::new("custodian-test-ca").expect("ca"));

        let controller = RotationController::new(
            secrets.clone(),
            Arc::new(CredentialRegistry::in_memory()),
            Arc::new(JobJournal::in_memory()),
            RolloutHealthVerifier::new(deployment.clone()),
            PolicySet::default().with_health(2, Duration::from_millis(1)),
        )
        .with_database(database.clone())
        .with_tls(probe, issuer);

        Harness {
            _dir: dir,
            token,
            secrets,
            deployment,
            database,
            controller,
        }
    }

    fn jwt_target() -> RotationTarget {
        RotationTarget::new(CredentialType::Jwt, SecretRef::new("prod", "auth-jwt"), "auth")
    }

    fn dek_target() -> RotationTarget {
        RotationTarget::new(CredentialType::SymmetricKey, SecretRef::new("prod", "data-key"), "api")
    }

    fn db_target() -> RotationTarget {
        RotationTarget::new(CredentialType::DbPassword, SecretRef::new("prod", "db"), "api").with_db_role("app")
    }

    fn tls_target() -> RotationTarget {
        RotationTarget::new(CredentialType::TlsCert, SecretRef::new("prod", "api-tls"), "api").with_tls(TlsSubject {
            common_name: "api.internal".into(),
            dns_names: vec!["api.internal".into()],
            validity_days: 30,
        })
    }

    impl Harness {
        async fn rotate(&self, target: &RotationTarget) -> RotationJob {
            self.controller.rotate(&self.token, target).await.expect("job starts")
        }

        async fn fields(&self, target: &RotationTarget) -> BTreeMap<String, Vec<u8>> {
            self.secrets.snapshot(&target.secret).await.expect("snapshot").fields().clone()
        }

        fn status_of(&self, credential_type: CredentialType, version: u32) -> Option<VersionStatus> {
            self.controller
                .registry()
                .versions(credential_type)
                .into_iter()
                .find(|v| v.version == version)
                .map(|v| v.status)
        }
    }

    #[tokio::test]
    async fn jwt_rotation_keeps_previous_key_during_grace() {
        let h = harness();
        let first = h.rotate(&jwt_target()).await;
        assert_eq!(first.outcome, Some(JobOutcome::Success));

        let v1_fields = h.fields(&jwt_target()).await;
        let old_token = JwtSigner::from_fields(&v1_fields)
            .expect("signer")
            .sign(&TokenClaims::new("user-1", "auth", ChronoDuration::hours(1)))
            .expect("sign");

        let second = h.rotate(&jwt_target()).await;
        assert_eq!(second.outcome, Some(JobOutcome::Success));
        assert_eq!(second.version, Some(2));

        let fields = h.fields(&jwt_target()).await;
        assert_eq!(fields.get(ACTIVE_KID_FIELD).map(Vec::as_slice), Some(&b"v2"[..]));
        let verifier = JwtVerifier::from_fields(&fields).expect("verifier");
        let claims: TokenClaims = verifier.verify(&old_token).expect("v1 token still valid");
        assert_eq!(claims.sub, "user-1");

        assert_eq!(h.status_of(CredentialType::Jwt, 1), Some(VersionStatus::Retiring));
        assert_eq!(h.status_of(CredentialType::Jwt, 2), Some(VersionStatus::Active));
        assert_eq!(h.controller.journal().list().len(), 2);
    }

    #[tokio::test]
    async fn retire_expired_removes_old_jwt_key_after_grace() {
        let h = harness();
        h.rotate(&jwt_target()).await;
        h.rotate(&jwt_target()).await;

        let early = h
            .controller
            .retire_expired(&h.token, &[jwt_target()], Utc::now())
            .await
            .expect("sweep");
        assert!(early.is_empty());
        assert!(h.fields(&jwt_target()).await.contains_key(&public_key_field("v1")));

        let later = Utc::now() + ChronoDuration::hours(25);
        let retired = h
            .controller
            .retire_expired(&h.token, &[jwt_target()], later)
            .await
            .expect("sweep");
        assert_eq!(retired.len(), 1);
        assert_eq!(h.status_of(CredentialType::Jwt, 1), Some(VersionStatus::Retired));

        let fields = h.fields(&jwt_target()).await;
        assert!(!fields.contains_key(&public_key_field("v1")));
        assert!(fields.contains_key(&public_key_field("v2")));
    }

    #[tokio::test]
    async fn second_jwt_target_cannot_take_over_the_type() {
        let h = harness();
        let api_jwt = RotationTarget::new(CredentialType::Jwt, SecretRef::new("prod", "api-jwt"), "api");
        h.rotate(&jwt_target()).await;
        let auth_token = JwtSigner::from_fields(&h.fields(&jwt_target()).await)
            .expect("signer")
            .sign(&TokenClaims::new("user-1", "auth", ChronoDuration::hours(1)))
            .expect("sign");

        let err = h.controller.rotate(&h.token, &api_jwt).await.expect_err("other secret");
        assert!(matches!(err, RotationError::Config(_)));
        assert_eq!(h.status_of(CredentialType::Jwt, 1), Some(VersionStatus::Active));
        assert_eq!(h.controller.journal().list().len(), 1);
        assert_eq!(h.deployment.reloads(), 1);

        let later = Utc::now() + ChronoDuration::hours(25);
        let retired = h
            .controller
            .retire_expired(&h.token, &[api_jwt, jwt_target()], later)
            .await
            .expect("sweep");
        assert!(retired.is_empty());
        let verifier = JwtVerifier::from_fields(&h.fields(&jwt_target()).await).expect("verifier");
        let claims: TokenClaims = verifier.verify(&auth_token).expect("auth token still valid");
        assert_eq!(claims.sub, "user-1");
    }

    #[tokio::test]
    async fn retirement_cleans_the_secret_the_version_lives_in() {
        let h = harness();
        let decoy = RotationTarget::new(CredentialType::Jwt, SecretRef::new("prod", "api-jwt"), "api");
        h.rotate(&jwt_target()).await;
        h.rotate(&jwt_target()).await;

        let later = Utc::now() + ChronoDuration::hours(25);
        let retired = h
            .controller
            .retire_expired(&h.token, &[decoy.clone(), jwt_target()], later)
            .await
            .expect("sweep");
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].secret.as_deref(), Some("prod/auth-jwt"));
        assert!(!h.fields(&jwt_target()).await.contains_key(&public_key_field("v1")));
        assert!(h.fields(&decoy).await.is_empty());
    }

    #[tokio::test]
    async fn symmetric_rotation_keeps_old_ciphertexts_readable() {
        let h = harness();
        h.rotate(&dek_target()).await;
        let before = h.fields(&dek_target()).await;
        let sealed = VersionedKeyring::from_fields(before.iter().map(|(k, v)| (k.as_str(), v.as_slice())))
            .expect("keyring")
            .encrypt(b"customer record")
            .expect("encrypt");

        h.rotate(&dek_target()).await;
        let after = h.fields(&dek_target()).await;
        let keyring =
            VersionedKeyring::from_fields(after.iter().map(|(k, v)| (k.as_str(), v.as_slice()))).expect("keyring");
        assert_eq!(keyring.active_version(), 2);
        assert_eq!(keyring.decrypt(&sealed).expect("decrypt"), b"customer record");
        assert_eq!(VersionedKeyring::version_of(&keyring.encrypt(b"x").expect("encrypt")).expect("tag"), 2);
    }

    #[tokio::test]
    async fn db_rotation_alternates_roles_and_revokes_after_grace() {
        let h = harness();
        h.rotate(&db_target()).await;
        let v1 = h.fields(&db_target()).await;
        assert_eq!(v1.get(DB_USERNAME_FIELD).map(Vec::as_slice), Some(&b"app_a"[..]));
        let v1_password = String::from_utf8(v1[DB_PASSWORD_FIELD].clone()).expect("utf8");

        let job = h.rotate(&db_target()).await;
        assert_eq!(job.outcome, Some(JobOutcome::Success));
        let v2 = h.fields(&db_target()).await;
        assert_eq!(v2.get(DB_USERNAME_FIELD).map(Vec::as_slice), Some(&b"app_b"[..]));
        let v2_password = String::from_utf8(v2[DB_PASSWORD_FIELD].clone()).expect("utf8");

        // Both credentials work during the grace window.
        assert!(h.database.can_login("app_a", &v1_password));
        assert!(h.database.can_login("app_b", &v2_password));

        let later = Utc::now() + ChronoDuration::minutes(16);
        let retired = h
            .controller
            .retire_expired(&h.token, &[db_target()], later)
            .await
            .expect("sweep");
        assert_eq!(retired.len(), 1);
        assert!(h.database.is_revoked("app_a"));
        assert!(h.database.can_login("app_b", &v2_password));
    }

    #[tokio::test]
    async fn rejected_db_login_rolls_back_and_revokes_new_role() {
        let h = harness();
        h.rotate(&db_target()).await;
        let before = h.fields(&db_target()).await;

        h.database.reject_logins(true);
        let job = h.rotate(&db_target()).await;
        assert_eq!(job.outcome, Some(JobOutcome::RolledBack));
        assert_eq!(job.failure.as_ref().map(|f| f.state), Some(RotationState::Verifying));
        assert_eq!(h.fields(&db_target()).await, before);
        assert!(h.database.is_revoked("app_b"));
        assert!(!h.database.is_revoked("app_a"));
        assert_eq!(h.status_of(CredentialType::DbPassword, 1), Some(VersionStatus::Active));
        assert_eq!(h.status_of(CredentialType::DbPassword, 2), Some(VersionStatus::Retired));
    }

    #[tokio::test]
    async fn tls_rotation_requires_the_endpoint_to_present_the_new_certificate() {
        let h = harness();
        let job = h.rotate(&tls_target()).await;
        assert_eq!(job.outcome, Some(JobOutcome::Success));

        let fields = h.fields(&tls_target()).await;
        let pem = String::from_utf8(fields[TLS_CERT_FIELD].clone()).expect("utf8");
        let active = h.controller.registry().active(CredentialType::TlsCert).expect("active");
        assert_eq!(active.fingerprint, sha256_hex(&pem_to_der(&pem)));
        assert!(fields.contains_key(TLS_KEY_FIELD));
        assert!(fields.contains_key(TLS_CA_FIELD));
    }

    #[tokio::test]
    async fn stale_certificate_rolls_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = FileLockManager::new(dir.path(), "test").acquire("rotation").expect("lock");
        let secrets = SecretStoreClient::new(Arc::new(LocalSecretStore::in_memory(SecretKey::generate())));
        let probe = Arc::new(FakeTlsProbe::new(secrets.clone(), tls_target().secret));
        probe.serve_stale(vec![0x30, 0x03, 0x02, 0x01, 0x01]);
        let controller = RotationController::new(
            secrets.clone(),
            Arc::new(CredentialRegistry::in_memory()),
            Arc::new(JobJournal::in_memory()),
            RolloutHealthVerifier::new(Arc::new(FakeDeployment::healthy())),
            PolicySet::default().with_health(1, Duration::from_millis(1)),
        )
        .with_tls(probe, Arc::new(LocalCertificateAuthority::new("ca").expect("ca")));

        let job = controller.rotate(&token, &tls_target()).await.expect("job");
        assert_eq!(job.outcome, Some(JobOutcome::RolledBack));
        let failure = job.failure.expect("failure");
        assert_eq!(failure.kind, FailureKind::RolloutHealthFailed);
        assert!(failure.message.contains("presents certificate"));
        assert!(secrets.snapshot(&tls_target().secret).await.expect("snapshot").fields().is_empty());
    }

    #[tokio::test]
    async fn health_failure_restores_pre_rotation_material() {
        let h = harness();
        h.rotate(&jwt_target()).await;
        let before = h.fields(&jwt_target()).await;

        // Two failed probes during verification, healthy again for rollback.
        h.deployment.script(vec![
            HealthStatus { ready: false, live: true },
            HealthStatus { ready: false, live: true },
        ]);
        let job = h.rotate(&jwt_target()).await;

        assert_eq!(job.outcome, Some(JobOutcome::RolledBack));
        let failure = job.failure.as_ref().expect("failure");
        assert_eq!(failure.kind, FailureKind::RolloutHealthFailed);
        assert_eq!(failure.state, RotationState::Verifying);
        assert_eq!(job.last_completed_state(), Some(RotationState::RollingBack));

        assert_eq!(h.fields(&jwt_target()).await, before);
        assert_eq!(h.status_of(CredentialType::Jwt, 1), Some(VersionStatus::Active));
        assert_eq!(h.status_of(CredentialType::Jwt, 2), Some(VersionStatus::Retired));
        assert_eq!(h.deployment.reloads(), 3);
        assert_eq!(
            h.controller.journal().latest(CredentialType::Jwt).and_then(|j| j.outcome),
            Some(JobOutcome::RolledBack)
        );

        // The next rotation starts cleanly.
        let retry = h.rotate(&jwt_target()).await;
        assert_eq!(retry.outcome, Some(JobOutcome::Success));
        assert_eq!(retry.version, Some(3));
    }

    #[tokio::test]
    async fn failed_rollback_is_fatal_and_blocks_the_type() {
        let h = harness();
        h.rotate(&dek_target()).await;
        h.deployment.set_default(HealthStatus { ready: false, live: false });

        let job = h.rotate(&dek_target()).await;
        assert_eq!(job.outcome, Some(JobOutcome::Failed));
        let failure = job.failure.as_ref().expect("failure");
        assert_eq!(failure.kind, FailureKind::RollbackFailed);
        assert!(failure.kind.requires_operator());
        assert_eq!(h.status_of(CredentialType::SymmetricKey, 2), Some(VersionStatus::Staged));

        let err = h.controller.rotate(&h.token, &dek_target()).await.expect_err("blocked");
        assert!(matches!(err, RotationError::ConcurrentRotation { version: 2, .. }));

        h.deployment.set_default(HealthStatus::HEALTHY);
        h.controller.abandon_staged(CredentialType::SymmetricKey).expect("abandon");
        assert_eq!(h.rotate(&dek_target()).await.outcome, Some(JobOutcome::Success));
    }

    #[tokio::test]
    async fn reload_failure_with_unrecoverable_rollback_is_fatal() {
        let h = harness();
        h.deployment.fail_reloads(true);
        let job = h.rotate(&jwt_target()).await;
        // Reload failed after the patch; rollback also cannot reload.
        assert_eq!(job.outcome, Some(JobOutcome::Failed));
        assert_eq!(
            job.steps.iter().find(|s| !s.ok).map(|s| s.state),
            Some(RotationState::RollingOut)
        );
    }

    #[tokio::test]
    async fn expired_token_never_starts_a_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = FileLockManager::new(dir.path(), "test")
            .with_ttl(ChronoDuration::seconds(-1))
            .acquire("rotation")
            .expect("lock");
        let h = harness();
        let err = h.controller.rotate(&token, &jwt_target()).await.expect_err("expired");
        assert!(matches!(err, RotationError::LockExpired { .. }));
        assert_eq!(err.kind(), FailureKind::LockHeld);
        assert!(h.controller.journal().list().is_empty());
    }

    #[tokio::test]
    async fn incomplete_targets_are_rejected_up_front() {
        let h = harness();
        let target = RotationTarget::new(CredentialType::DbPassword, SecretRef::new("prod", "db"), "api");
        let err = h.controller.rotate(&h.token, &target).await.expect_err("no role");
        assert!(matches!(err, RotationError::Config(_)));
        assert!(h.controller.registry().staged(CredentialType::DbPassword).is_none());
    }
}
