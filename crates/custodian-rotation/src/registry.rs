//! Credential version registry.
//!
//! Tracks every version of every credential type and its lifecycle status,
//! persisted as `credentials.json`. Material is never recorded here, only
//! fingerprints.
//!
//! Per type there is at most one `staged` version (an in-flight rotation),
//! one `active` version and one `retiring` version. A type's live versions
//! all belong to one secret object, recorded on each version.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use custodian_core::JsonStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, RotationError};
use crate::types::{CredentialType, CredentialVersion, VersionStatus};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    credentials: BTreeMap<CredentialType, Vec<CredentialVersion>>,
}

/// What an activation changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    /// The version now active.
    pub activated: CredentialVersion,
    /// The previously active version, now retiring (or retired when the
    /// grace window is zero).
    pub previous: Option<CredentialVersion>,
    /// Versions retired by this activation, whose material can be removed.
    pub retired_now: Vec<CredentialVersion>,
}

/// The credential version registry.
#[derive(Debug)]
pub struct CredentialRegistry {
    state: RwLock<Snapshot>,
    store: Option<JsonStore>,
}

impl CredentialRegistry {
    /// Opens `<state_dir>/credentials.json`.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let store = JsonStore::new(state_dir, "credentials");
        let snapshot: Snapshot = store.load()?;
        debug!(types = snapshot.credentials.len(), "credential registry loaded");
        Ok(Self {
            state: RwLock::new(snapshot),
            store: Some(store),
        })
    }

    /// A registry that is never written to disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(Snapshot::default()),
            store: None,
        }
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Snapshot) -> Result<T>) -> Result<T> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut working = Snapshot {
            credentials: state.credentials.clone(),
        };
        let out = f(&mut working)?;
        if let Some(store) = &self.store {
            store.save(&working)?;
        }
        *state = working;
        Ok(out)
    }

    /// Every version of `credential_type`, oldest first.
    #[must_use]
    pub fn versions(&self, credential_type: CredentialType) -> Vec<CredentialVersion> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .credentials
            .get(&credential_type)
            .cloned()
            .unwrap_or_default()
    }

    fn with_status(&self, credential_type: CredentialType, status: VersionStatus) -> Vec<CredentialVersion> {
        self.versions(credential_type)
            .into_iter()
            .filter(|v| v.status == status)
            .collect()
    }

    /// The active version.
    #[must_use]
    pub fn active(&self, credential_type: CredentialType) -> Option<CredentialVersion> {
        self.with_status(credential_type, VersionStatus::Active).pop()
    }

    /// The staged version of an in-flight rotation.
    #[must_use]
    pub fn staged(&self, credential_type: CredentialType) -> Option<CredentialVersion> {
        self.with_status(credential_type, VersionStatus::Staged).pop()
    }

    /// Versions still inside their grace window.
    #[must_use]
    pub fn retiring(&self, credential_type: CredentialType) -> Vec<CredentialVersion> {
        self.with_status(credential_type, VersionStatus::Retiring)
    }

    /// Retiring versions of any type whose grace window ended at or before `now`.
    #[must_use]
    pub fn due_for_retirement(&self, now: DateTime<Utc>) -> Vec<CredentialVersion> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .credentials
            .values()
            .flatten()
            .filter(|v| v.status == VersionStatus::Retiring && v.retire_after.is_some_and(|at| at <= now))
            .cloned()
            .collect()
    }

    /// The secret object the live versions of `credential_type` were
    /// written to, if any version is still staged, active or retiring.
    #[must_use]
    pub fn bound_secret(&self, credential_type: CredentialType) -> Option<String> {
        self.versions(credential_type)
            .into_iter()
            .rev()
            .filter(|v| v.status != VersionStatus::Retired)
            .find_map(|v| v.secret)
    }

    /// The version number the next rotation of `credential_type` will use.
    #[must_use]
    pub fn next_version(&self, credential_type: CredentialType) -> u32 {
        self.versions(credential_type)
            .iter()
            .map(|v| v.version)
            .max()
            .map_or(1, |v| v + 1)
    }

    /// Records a new staged version of the credential held in `secret`.
    ///
    /// Fails with [`RotationError::ConcurrentRotation`] while another version
    /// of the same type is staged, and with [`RotationError::Config`] when
    /// the type's live versions belong to a different secret.
    pub fn stage(
        &self,
        credential_type: CredentialType,
        secret: &str,
        fingerprint: impl Into<String>,
        login_role: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<CredentialVersion> {
        let fingerprint = fingerprint.into();
        self.mutate(|s| {
            let versions = s.credentials.entry(credential_type).or_default();
            if let Some(staged) = versions.iter().find(|v| v.status == VersionStatus::Staged) {
                return Err(RotationError::ConcurrentRotation {
                    credential_type,
                    version: staged.version,
                });
            }
            if let Some(bound) = versions
                .iter()
                .rev()
                .filter(|v| v.status != VersionStatus::Retired)
                .find_map(|v| v.secret.as_deref())
            {
                if bound != secret {
                    return Err(RotationError::Config(format!(
                        "{credential_type} credentials live in '{bound}'; refusing to stage one for '{secret}'"
                    )));
                }
            }
            let version = versions.iter().map(|v| v.version).max().map_or(1, |v| v + 1);
            let record = CredentialVersion {
                credential_type,
                version,
                created_at: now,
                activated_at: None,
                retired_at: None,
                retire_after: None,
                status: VersionStatus::Staged,
                fingerprint,
                login_role,
                secret: Some(secret.to_string()),
            };
            versions.push(record.clone());
            info!(credential_type = %credential_type, version, "version staged");
            Ok(record)
        })
    }

    /// Activates a staged version.
    ///
    /// The previous active version starts retiring with
    /// `retire_after = now + grace`; with a zero grace window it is retired
    /// at once. A version already retiring is retired immediately so at
    /// most one retiring version remains.
    pub fn activate(
        &self,
        credential_type: CredentialType,
        version: u32,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<Activation> {
        self.mutate(|s| {
            let versions = s.credentials.entry(credential_type).or_default();
            let target = find(versions, credential_type, version)?;
            if versions[target].status != VersionStatus::Staged {
                return Err(invalid(&versions[target], "activate"));
            }

            let mut retired_now = Vec::new();
            for v in versions.iter_mut().filter(|v| v.status == VersionStatus::Retiring) {
                v.status = VersionStatus::Retired;
                v.retired_at = Some(now);
                retired_now.push(v.clone());
            }

            let mut previous = None;
            if let Some(old) = versions.iter_mut().find(|v| v.status == VersionStatus::Active) {
                if grace <= Duration::zero() {
                    old.status = VersionStatus::Retired;
                    old.retired_at = Some(now);
                    retired_now.push(old.clone());
                } else {
                    old.status = VersionStatus::Retiring;
                    old.retire_after = Some(now + grace);
                }
                previous = Some(old.clone());
            }

            let new = &mut versions[target];
            new.status = VersionStatus::Active;
            new.activated_at = Some(now);
            let activated = new.clone();

            info!(
                credential_type = %credential_type,
                version,
                previous = previous.as_ref().map(|p| p.version),
                retired = retired_now.len(),
                "version activated"
            );
            Ok(Activation {
                activated,
                previous,
                retired_now,
            })
        })
    }

    /// Retires a rolled-back staged version so a new rotation can start.
    pub fn discard_staged(&self, credential_type: CredentialType, now: DateTime<Utc>) -> Result<Option<CredentialVersion>> {
        self.mutate(|s| {
            let Some(staged) = s
                .credentials
                .get_mut(&credential_type)
                .and_then(|versions| versions.iter_mut().find(|v| v.status == VersionStatus::Staged))
            else {
                return Ok(None);
            };
            staged.status = VersionStatus::Retired;
            staged.retired_at = Some(now);
            info!(credential_type = %credential_type, version = staged.version, "staged version discarded");
            Ok(Some(staged.clone()))
        })
    }

    /// Retires a retiring version at the end of its grace window.
    pub fn retire(&self, credential_type: CredentialType, version: u32, now: DateTime<Utc>) -> Result<CredentialVersion> {
        self.mutate(|s| {
            let versions = s.credentials.entry(credential_type).or_default();
            let target = find(versions, credential_type, version)?;
            let record = &mut versions[target];
            match record.status {
                VersionStatus::Retiring => {
                    record.status = VersionStatus::Retired;
                    record.retired_at = Some(now);
                    info!(credential_type = %credential_type, version, "version retired");
                    Ok(record.clone())
                }
                VersionStatus::Retired => Ok(record.clone()),
                VersionStatus::Staged | VersionStatus::Active => Err(invalid(record, "retire")),
            }
        })
    }
}

fn find(versions: &[CredentialVersion], credential_type: CredentialType, version: u32) -> Result<usize> {
    versions
        .iter()
        .position(|v| v.version == version)
        .ok_or(RotationError::UnknownVersion {
            credential_type,
            version,
        })
}

fn invalid(record: &CredentialVersion, operation: &'static str) -> RotationError {
    RotationError::InvalidVersionState {
        credential_type: record.credential_type,
        version: record.version,
        status: record.status,
        operation,
    }
}
