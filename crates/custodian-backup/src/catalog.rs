//! Backup catalog: artifacts, replication reports and holds.
//!
//! Persisted as one JSON snapshot (`catalog.json`) rewritten after every
//! mutation. A hold marks an artifact as in use by a verification or
//! restore; retention never deletes a held artifact.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use custodian_core::JsonStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BackupError, Result};
use crate::types::{BackupArtifact, ReplicationReport};

/// Holds older than this are ignored; their holder is assumed dead.
pub const DEFAULT_HOLD_TTL_HOURS: i64 = 6;

/// A hold placed on an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    /// Hold id.
    pub id: Uuid,
    /// Who placed it.
    pub reason: String,
    /// When it was placed.
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    artifacts: BTreeMap<String, BackupArtifact>,
    #[serde(default)]
    replication: BTreeMap<String, ReplicationReport>,
    #[serde(default)]
    holds: BTreeMap<String, Vec<Hold>>,
}

/// The backup catalog.
#[derive(Debug)]
pub struct Catalog {
    state: RwLock<Snapshot>,
    store: Option<JsonStore>,
    hold_ttl: Duration,
}

impl Catalog {
    /// Opens `<state_dir>/catalog.json`.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let store = JsonStore::new(state_dir, "catalog");
        let snapshot: Snapshot = store.load()?;
        debug!(artifacts = snapshot.artifacts.len(), "catalog loaded");
        Ok(Self {
            state: RwLock::new(snapshot),
            store: Some(store),
            hold_ttl: Duration::hours(DEFAULT_HOLD_TTL_HOURS),
        })
    }

    /// A catalog that is never written to disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(Snapshot::default()),
            store: None,
            hold_ttl: Duration::hours(DEFAULT_HOLD_TTL_HOURS),
        }
    }

    /// Sets how long a hold stays effective.
    #[must_use]
    pub const fn with_hold_ttl(mut self, ttl: Duration) -> Self {
        self.hold_ttl = ttl;
        self
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Snapshot) -> Result<T>) -> Result<T> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut state)?;
        if let Some(store) = &self.store {
            store.save(&*state)?;
        }
        Ok(out)
    }

    /// Adds a new artifact. Ids are unique.
    pub fn insert(&self, artifact: BackupArtifact) -> Result<()> {
        self.mutate(|s| {
            if s.artifacts.contains_key(&artifact.id) {
                return Err(BackupError::InvalidRequest(format!(
                    "backup '{}' already exists",
                    artifact.id
                )));
            }
            s.artifacts.insert(artifact.id.clone(), artifact);
            Ok(())
        })
    }

    /// Returns an artifact.
    pub fn get(&self, id: &str) -> Result<BackupArtifact> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .artifacts
            .get(id)
            .cloned()
            .ok_or_else(|| BackupError::NotFound { id: id.to_string() })
    }

    /// Applies `f` to an artifact and persists the result. Nothing is
    /// written if `f` fails.
    pub fn update<T>(&self, id: &str, f: impl FnOnce(&mut BackupArtifact) -> Result<T>) -> Result<T> {
        self.mutate(|s| {
            let current = s
                .artifacts
                .get(id)
                .ok_or_else(|| BackupError::NotFound { id: id.to_string() })?;
            let mut working = current.clone();
            let out = f(&mut working)?;
            s.artifacts.insert(id.to_string(), working);
            Ok(out)
        })
    }

    /// Replaces a stored artifact wholesale.
    pub fn put(&self, artifact: BackupArtifact) -> Result<()> {
        self.mutate(|s| {
            s.artifacts.insert(artifact.id.clone(), artifact);
            Ok(())
        })
    }

    /// Removes an artifact and everything recorded about it.
    pub fn remove(&self, id: &str) -> Result<Option<BackupArtifact>> {
        self.mutate(|s| {
            s.replication.remove(id);
            s.holds.remove(id);
            Ok(s.artifacts.remove(id))
        })
    }

    /// All artifacts, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<BackupArtifact> {
        let mut all: Vec<BackupArtifact> = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .artifacts
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Records the latest replication report for an artifact.
    pub fn record_replication(&self, report: ReplicationReport) -> Result<()> {
        self.mutate(|s| {
            s.replication.insert(report.artifact_id.clone(), report);
            Ok(())
        })
    }

    /// Latest replication report for an artifact.
    #[must_use]
    pub fn replication_report(&self, id: &str) -> Option<ReplicationReport> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .replication
            .get(id)
            .cloned()
    }

    /// Places a hold; released when the returned guard drops.
    pub fn place_hold(self: &Arc<Self>, id: &str, reason: &str) -> Result<HoldGuard> {
        let hold = Hold {
            id: Uuid::new_v4(),
            reason: reason.to_string(),
            placed_at: Utc::now(),
        };
        let hold_id = hold.id;
        self.mutate(|s| {
            if !s.artifacts.contains_key(id) {
                return Err(BackupError::NotFound { id: id.to_string() });
            }
            s.holds.entry(id.to_string()).or_default().push(hold);
            Ok(())
        })?;
        debug!(backup_id = id, reason, "hold placed");

        Ok(HoldGuard {
            catalog: Arc::clone(self),
            artifact_id: id.to_string(),
            hold_id,
        })
    }

    fn release_hold(&self, artifact_id: &str, hold_id: Uuid) -> Result<()> {
        self.mutate(|s| {
            if let Some(holds) = s.holds.get_mut(artifact_id) {
                holds.retain(|h| h.id != hold_id);
                if holds.is_empty() {
                    s.holds.remove(artifact_id);
                }
            }
            Ok(())
        })
    }

    /// Returns true if the artifact has a hold younger than the hold TTL.
    #[must_use]
    pub fn is_held(&self, id: &str, now: DateTime<Utc>) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.holds.get(id).is_some_and(|holds| {
            holds.iter().any(|h| {
                let live = now - h.placed_at < self.hold_ttl;
                if !live {
                    warn!(backup_id = id, reason = %h.reason, placed_at = %h.placed_at, "ignoring stale hold");
                }
                live
            })
        })
    }
}

/// Releases a hold on drop.
#[derive(Debug)]
pub struct HoldGuard {
    catalog: Arc<Catalog>,
    artifact_id: String,
    hold_id: Uuid,
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        if let Err(e) = self.catalog.release_hold(&self.artifact_id, self.hold_id) {
            warn!(backup_id = %self.artifact_id, error = %e, "failed to release hold");
        } else {
            debug!(backup_id = %self.artifact_id, "hold released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArtifactState, SourceSystem};

    fn artifact(id: &str) -> BackupArtifact {
        BackupArtifact::new(id.into(), SourceSystem::Postgres, Utc::now(), 42, "ab".repeat(32))
    }

    #[test]
    fn insert_get_update_remove() {
        let catalog = Catalog::in_memory();
        catalog.insert(artifact("b1")).expect("insert");
        assert!(catalog.insert(artifact("b1")).is_err());

        catalog
            .update("b1", |a| a.transition(ArtifactState::Encrypted))
            .expect("update");
        assert_eq!(catalog.get("b1").expect("get").state, ArtifactState::Encrypted);

        assert!(catalog.remove("b1").expect("remove").is_some());
        assert!(matches!(catalog.get("b1"), Err(BackupError::NotFound { .. })));
    }

    #[test]
    fn failed_update_changes_nothing() {
        let catalog = Catalog::in_memory();
        catalog.insert(artifact("b1")).expect("insert");

        let result = catalog.update("b1", |a| {
            a.size_bytes = 0;
            a.transition(ArtifactState::Deleted)
        });
        assert!(result.is_err());
        assert_eq!(catalog.get("b1").expect("get").size_bytes, 42);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let catalog = Catalog::open(dir.path()).expect("open");
            catalog.insert(artifact("b1")).expect("insert");
            catalog.insert(artifact("b2")).expect("insert");
        }
        let catalog = Catalog::open(dir.path()).expect("reopen");
        assert_eq!(catalog.list().len(), 2);
        assert!(dir.path().join("catalog.json").exists());
    }

    #[test]
    fn holds_are_released_on_drop() {
        let catalog = Arc::new(Catalog::in_memory());
        catalog.insert(artifact("b1")).expect("insert");

        let guard = catalog.place_hold("b1", "verification").expect("hold");
        let second = catalog.place_hold("b1", "restore").expect("hold");
        assert!(catalog.is_held("b1", Utc::now()));

        drop(guard);
        assert!(catalog.is_held("b1", Utc::now()));
        drop(second);
        assert!(!catalog.is_held("b1", Utc::now()));
    }

    #[test]
    fn stale_holds_are_ignored() {
        let catalog = Arc::new(Catalog::in_memory().with_hold_ttl(Duration::minutes(10)));
        catalog.insert(artifact("b1")).expect("insert");
        let _guard = catalog.place_hold("b1", "verification").expect("hold");

        assert!(catalog.is_held("b1", Utc::now()));
        assert!(!catalog.is_held("b1", Utc::now() + Duration::hours(1)));
    }

    #[test]
    fn hold_on_unknown_artifact_fails() {
        let catalog = Arc::new(Catalog::in_memory());
        assert!(catalog.place_hold("missing", "verification").is_err());
    }
}
