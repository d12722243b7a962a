//! Secret store client and the local encrypted secret backend.
//!
//! A secret is a named map of binary fields under a namespace. Every write
//! goes through a [`SecretPatch`], which applies atomically against an
//! expected revision: all fields change or none do, and a concurrent writer
//! makes the patch fail with [`RotationError::RevisionConflict`].
//!
//! [`LocalSecretStore`] keeps each field encrypted at rest with
//! ChaCha20-Poly1305 under a key derived per secret from a master key.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use custodian_core::{FailureKind, JsonStore, with_deadline};
use custodian_crypto::SecretKey;
use custodian_crypto::cipher::{decrypt_with_aad, encrypt_with_aad};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Result, RotationError};

/// Default deadline for one secret store call.
pub const DEFAULT_SECRET_TIMEOUT: Duration = Duration::from_secs(10);

/// Revision records kept per secret.
pub const HISTORY_LIMIT: usize = 20;

const KEY_PURPOSE: &str = "custodian secret-store field key";

/// Identifies a secret object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecretRef {
    /// Namespace.
    pub namespace: String,
    /// Secret name.
    pub name: String,
}

impl SecretRef {
    /// Creates a reference.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A set of field writes and removals applied as one unit.
#[derive(Clone, Default)]
pub struct SecretPatch {
    set: BTreeMap<String, Zeroizing<Vec<u8>>>,
    remove: BTreeSet<String>,
}

impl SecretPatch {
    /// An empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `field`. A later `remove` of the same field wins over this.
    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        let field = field.into();
        self.remove.remove(&field);
        self.set.insert(field, Zeroizing::new(value.into()));
        self
    }

    /// Removes `field`.
    #[must_use]
    pub fn remove(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.set.remove(&field);
        self.remove.insert(field);
        self
    }

    /// Returns true if the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }

    /// Fields written by the patch.
    pub fn written(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.set.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Fields removed by the patch.
    pub fn removed(&self) -> impl Iterator<Item = &str> {
        self.remove.iter().map(String::as_str)
    }

    /// Names of every field the patch touches.
    #[must_use]
    pub fn touched(&self) -> Vec<&str> {
        self.set.keys().chain(self.remove.iter()).map(String::as_str).collect()
    }

    /// Applies the patch to a plaintext field map.
    pub fn apply_to(&self, fields: &mut BTreeMap<String, Vec<u8>>) {
        for name in &self.remove {
            if let Some(mut old) = fields.remove(name) {
                old.zeroize();
            }
        }
        for (name, value) in &self.set {
            if let Some(mut old) = fields.insert(name.clone(), value.to_vec()) {
                old.zeroize();
            }
        }
    }
}

impl fmt::Debug for SecretPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretPatch")
            .field("set", &self.set.keys().collect::<Vec<_>>())
            .field("remove", &self.remove)
            .finish()
    }
}

/// The content of a secret at one revision.
///
/// Revision 0 means the secret does not exist yet.
#[derive(Clone)]
pub struct SecretSnapshot {
    secret: SecretRef,
    revision: u64,
    fields: BTreeMap<String, Vec<u8>>,
}

impl SecretSnapshot {
    /// Creates a snapshot.
    #[must_use]
    pub const fn new(secret: SecretRef, revision: u64, fields: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            secret,
            revision,
            fields,
        }
    }

    /// The secret this is a snapshot of.
    #[must_use]
    pub const fn secret(&self) -> &SecretRef {
        &self.secret
    }

    /// Store revision the snapshot was read at.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// All fields.
    #[must_use]
    pub const fn fields(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.fields
    }

    /// One field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&[u8]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    /// Returns true if the secret did not exist.
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        self.revision == 0
    }

    /// The patch that turns `current` back into this snapshot.
    #[must_use]
    pub fn inverse_of(&self, current: &Self) -> SecretPatch {
        let mut patch = SecretPatch::new();
        for name in current.fields.keys() {
            if !self.fields.contains_key(name) {
                patch = patch.remove(name.clone());
            }
        }
        for (name, value) in &self.fields {
            if current.fields.get(name) != Some(value) {
                patch = patch.set(name.clone(), value.clone());
            }
        }
        patch
    }
}

impl Drop for SecretSnapshot {
    fn drop(&mut self) {
        for value in self.fields.values_mut() {
            value.zeroize();
        }
    }
}

impl fmt::Debug for SecretSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretSnapshot")
            .field("secret", &self.secret)
            .field("revision", &self.revision)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Storage for secrets.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Reads a secret. A missing secret is returned at revision 0 with no fields.
    async fn get(&self, secret: &SecretRef) -> Result<SecretSnapshot>;

    /// Applies `patch` if the secret is still at `expected_revision`,
    /// returning the new revision.
    async fn apply_patch(&self, secret: &SecretRef, patch: &SecretPatch, expected_revision: u64) -> Result<u64>;
}

/// One entry of a secret's revision history. Field names only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    /// Revision produced.
    pub revision: u64,
    /// When it was written.
    pub written_at: DateTime<Utc>,
    /// Fields written.
    pub set: Vec<String>,
    /// Fields removed.
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredSecret {
    revision: u64,
    /// Base64 of nonce || ciphertext per field.
    fields: BTreeMap<String, String>,
    #[serde(default)]
    history: Vec<RevisionRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    secrets: BTreeMap<String, StoredSecret>,
}

/// Secret backend encrypted at rest and persisted as `secrets.json`.
pub struct LocalSecretStore {
    master: SecretKey,
    state: RwLock<Snapshot>,
    store: Option<JsonStore>,
}

impl LocalSecretStore {
    /// Opens `<state_dir>/secrets.json`.
    pub fn open(state_dir: &Path, master: SecretKey) -> Result<Self> {
        let store = JsonStore::new(state_dir, "secrets");
        let snapshot: Snapshot = store.load()?;
        debug!(secrets = snapshot.secrets.len(), "secret store loaded");
        Ok(Self {
            master,
            state: RwLock::new(snapshot),
            store: Some(store),
        })
    }

    /// A store that is never written to disk.
    #[must_use]
    pub fn in_memory(master: SecretKey) -> Self {
        Self {
            master,
            state: RwLock::new(Snapshot::default()),
            store: None,
        }
    }

    /// Revision history of a secret, oldest first.
    #[must_use]
    pub fn history(&self, secret: &SecretRef) -> Vec<RevisionRecord> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .secrets
            .get(&secret.to_string())
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    fn key_for(&self, secret: &SecretRef) -> SecretKey {
        self.master.derive(KEY_PURPOSE, &secret.to_string())
    }

    fn aad(secret: &SecretRef, field: &str) -> Vec<u8> {
        format!("{secret}#{field}").into_bytes()
    }

    fn seal(&self, secret: &SecretRef, field: &str, value: &[u8]) -> Result<String> {
        let sealed = encrypt_with_aad(&self.key_for(secret), value, &Self::aad(secret, field)).map_err(|e| {
            RotationError::SecretPatch {
                secret: secret.to_string(),
                reason: format!("cannot encrypt field '{field}': {e}"),
            }
        })?;
        Ok(STANDARD.encode(sealed))
    }

    fn open_field(&self, secret: &SecretRef, field: &str, encoded: &str) -> Result<Vec<u8>> {
        let unreadable = |reason: String| RotationError::SecretStore {
            secret: secret.to_string(),
            reason,
        };
        let sealed = STANDARD
            .decode(encoded)
            .map_err(|e| unreadable(format!("field '{field}' is not base64: {e}")))?;
        decrypt_with_aad(&self.key_for(secret), &sealed, &Self::aad(secret, field))
            .map_err(|e| unreadable(format!("field '{field}' cannot be decrypted: {e}")))
    }
}

#[async_trait]
impl SecretBackend for LocalSecretStore {
    async fn get(&self, secret: &SecretRef) -> Result<SecretSnapshot> {
        let stored = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .secrets
            .get(&secret.to_string())
            .cloned();

        let Some(stored) = stored else {
            return Ok(SecretSnapshot::new(secret.clone(), 0, BTreeMap::new()));
        };

        let mut fields = BTreeMap::new();
        for (name, encoded) in &stored.fields {
            fields.insert(name.clone(), self.open_field(secret, name, encoded)?);
        }
        Ok(SecretSnapshot::new(secret.clone(), stored.revision, fields))
    }

    async fn apply_patch(&self, secret: &SecretRef, patch: &SecretPatch, expected_revision: u64) -> Result<u64> {
        let key = secret.to_string();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let current = state.secrets.get(&key).cloned().unwrap_or_default();
        if current.revision != expected_revision {
            return Err(RotationError::RevisionConflict {
                secret: key,
                expected: expected_revision,
                actual: current.revision,
            });
        }

        // Seal everything before touching state so a failure leaves the secret as it was.
        let mut next = current.clone();
        for name in patch.removed() {
            next.fields.remove(name);
        }
        for (name, value) in patch.written() {
            next.fields.insert(name.to_string(), self.seal(secret, name, value)?);
        }
        next.revision = current.revision + 1;
        next.history.push(RevisionRecord {
            revision: next.revision,
            written_at: Utc::now(),
            set: patch.written().map(|(name, _)| name.to_string()).collect(),
            removed: patch.removed().map(str::to_string).collect(),
        });
        if next.history.len() > HISTORY_LIMIT {
            let excess = next.history.len() - HISTORY_LIMIT;
            next.history.drain(..excess);
        }

        let revision = next.revision;
        let previous = state.secrets.insert(key.clone(), next);
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&*state) {
                match previous {
                    Some(previous) => state.secrets.insert(key, previous),
                    None => state.secrets.remove(&key),
                };
                return Err(e.into());
            }
        }
        Ok(revision)
    }
}

impl fmt::Debug for LocalSecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSecretStore")
            .field("persistent", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

/// Deadline-bounded access to a [`SecretBackend`].
#[derive(Clone)]
pub struct SecretStoreClient {
    backend: Arc<dyn SecretBackend>,
    timeout: Duration,
}

impl SecretStoreClient {
    /// Wraps a backend with the default deadline.
    #[must_use]
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        Self {
            backend,
            timeout: DEFAULT_SECRET_TIMEOUT,
        }
    }

    /// Sets the per-call deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reads the current content of a secret.
    pub async fn snapshot(&self, secret: &SecretRef) -> Result<SecretSnapshot> {
        with_deadline(self.timeout, self.backend.get(secret))
            .await
            .map_err(|t| {
                RotationError::timeout(format!("read of secret '{secret}'"), t.after, FailureKind::SecretPatchFailed)
            })?
    }

    /// Applies `patch` atomically against `expected_revision`.
    pub async fn apply_patch(&self, secret: &SecretRef, patch: &SecretPatch, expected_revision: u64) -> Result<u64> {
        let revision = with_deadline(self.timeout, self.backend.apply_patch(secret, patch, expected_revision))
            .await
            .map_err(|t| {
                RotationError::timeout(format!("patch of secret '{secret}'"), t.after, FailureKind::SecretPatchFailed)
            })??;
        info!(
            secret = %secret,
            revision,
            fields = ?patch.touched(),
            "secret patched"
        );
        Ok(revision)
    }

    /// Puts a secret back to the content of `snapshot`.
    ///
    /// The inverse patch is applied against whatever revision the secret is
    /// at now, so restoring after a successful patch works without knowing
    /// the intermediate revision.
    pub async fn restore(&self, snapshot: &SecretSnapshot) -> Result<u64> {
        let current = self.snapshot(snapshot.secret()).await?;
        let inverse = snapshot.inverse_of(&current);
        if inverse.is_empty() {
            debug!(secret = %snapshot.secret(), "secret already matches snapshot");
            return Ok(current.revision());
        }
        self.apply_patch(snapshot.secret(), &inverse, current.revision()).await
    }
}

impl fmt::Debug for SecretStoreClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStoreClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt_ref() -> SecretRef {
        SecretRef::new("prod", "auth-jwt")
    }

    fn client(store: LocalSecretStore) -> SecretStoreClient {
        SecretStoreClient::new(Arc::new(store))
    }

    #[tokio::test]
    async fn missing_secret_reads_as_revision_zero() {
        let store = LocalSecretStore::in_memory(SecretKey::generate());
        let snap = store.get(&jwt_ref()).await.expect("get");
        assert!(snap.is_absent());
        assert!(snap.fields().is_empty());
    }

    #[tokio::test]
    async fn patch_applies_all_fields_and_bumps_revision() {
        let store = LocalSecretStore::in_memory(SecretKey::generate());
        let patch = SecretPatch::new().set("a", b"1".to_vec()).set("b", b"2".to_vec());
        assert_eq!(store.apply_patch(&jwt_ref(), &patch, 0).await.expect("patch"), 1);

        let patch = SecretPatch::new().remove("a").set("c", b"3".to_vec());
        assert_eq!(store.apply_patch(&jwt_ref(), &patch, 1).await.expect("patch"), 2);

        let snap = store.get(&jwt_ref()).await.expect("get");
        assert_eq!(snap.revision(), 2);
        assert_eq!(snap.field("a"), None);
        assert_eq!(snap.field("b"), Some(&b"2"[..]));
        assert_eq!(snap.field("c"), Some(&b"3"[..]));
        assert_eq!(store.history(&jwt_ref()).len(), 2);
    }

    #[tokio::test]
    async fn stale_revision_is_rejected_without_changes() {
        let store = LocalSecretStore::in_memory(SecretKey::generate());
        store
            .apply_patch(&jwt_ref(), &SecretPatch::new().set("a", b"1".to_vec()), 0)
            .await
            .expect("patch");

        let err = store
            .apply_patch(&jwt_ref(), &SecretPatch::new().set("a", b"2".to_vec()), 0)
            .await
            .expect_err("conflict");
        assert!(matches!(err, RotationError::RevisionConflict { expected: 0, actual: 1, .. }));
        assert_eq!(err.kind(), FailureKind::SecretPatchFailed);

        let snap = store.get(&jwt_ref()).await.expect("get");
        assert_eq!(snap.field("a"), Some(&b"1"[..]));
    }

    #[tokio::test]
    async fn values_are_encrypted_at_rest_and_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let master = SecretKey::from_bytes(&[7u8; 32]).expect("key");
        let store = LocalSecretStore::open(dir.path(), master.clone()).expect("open");
        store
            .apply_patch(&jwt_ref(), &SecretPatch::new().set("db.password", b"hunter2-hunter2".to_vec()), 0)
            .await
            .expect("patch");

        let raw = std::fs::read_to_string(dir.path().join("secrets.json")).expect("read");
        assert!(!raw.contains("hunter2"));

        let reopened = LocalSecretStore::open(dir.path(), master).expect("reopen");
        let snap = reopened.get(&jwt_ref()).await.expect("get");
        assert_eq!(snap.field("db.password"), Some(&b"hunter2-hunter2"[..]));
    }

    #[tokio::test]
    async fn wrong_master_key_cannot_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalSecretStore::open(dir.path(), SecretKey::generate()).expect("open");
        store
            .apply_patch(&jwt_ref(), &SecretPatch::new().set("k", b"v".to_vec()), 0)
            .await
            .expect("patch");

        let other = LocalSecretStore::open(dir.path(), SecretKey::generate()).expect("open");
        let err = other.get(&jwt_ref()).await.expect_err("unreadable");
        assert!(matches!(err, RotationError::SecretStore { .. }));
    }

    #[tokio::test]
    async fn restore_reverts_to_snapshot() {
        let client = client(LocalSecretStore::in_memory(SecretKey::generate()));
        client
            .apply_patch(&jwt_ref(), &SecretPatch::new().set("a", b"1".to_vec()).set("b", b"2".to_vec()), 0)
            .await
            .expect("seed");
        let before = client.snapshot(&jwt_ref()).await.expect("snapshot");

        client
            .apply_patch(
                &jwt_ref(),
                &SecretPatch::new().set("a", b"changed".to_vec()).remove("b").set("c", b"3".to_vec()),
                before.revision(),
            )
            .await
            .expect("patch");

        let revision = client.restore(&before).await.expect("restore");
        assert_eq!(revision, 3);
        let after = client.snapshot(&jwt_ref()).await.expect("snapshot");
        assert_eq!(after.fields(), before.fields());
    }

    #[tokio::test]
    async fn restore_of_unchanged_secret_writes_nothing() {
        let client = client(LocalSecretStore::in_memory(SecretKey::generate()));
        client
            .apply_patch(&jwt_ref(), &SecretPatch::new().set("a", b"1".to_vec()), 0)
            .await
            .expect("seed");
        let before = client.snapshot(&jwt_ref()).await.expect("snapshot");
        assert_eq!(client.restore(&before).await.expect("restore"), 1);
    }

    struct Stalled;

    #[async_trait]
    impl SecretBackend for Stalled {
        async fn get(&self, _secret: &SecretRef) -> Result<SecretSnapshot> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(SecretSnapshot::new(jwt_ref(), 0, BTreeMap::new()))
        }

        async fn apply_patch(&self, _secret: &SecretRef, _patch: &SecretPatch, _expected: u64) -> Result<u64> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn calls_time_out() {
        let client = SecretStoreClient::new(Arc::new(Stalled)).with_timeout(Duration::from_secs(2));
        let err = client
            .apply_patch(&jwt_ref(), &SecretPatch::new().set("a", b"1".to_vec()), 0)
            .await
            .expect_err("timeout");
        assert!(matches!(err, RotationError::Timeout { .. }));
        assert_eq!(err.kind(), FailureKind::SecretPatchFailed);
    }

    #[test]
    fn debug_output_never_shows_values() {
        let patch = SecretPatch::new().set("db.password", b"s3cr3t".to_vec());
        let snap = SecretSnapshot::new(
            jwt_ref(),
            4,
            BTreeMap::from([("db.password".to_string(), b"s3cr3t".to_vec())]),
        );
        assert!(!format!("{patch:?}").contains("s3cr3t"));
        assert!(!format!("{snap:?}").contains("s3cr3t"));
        assert!(format!("{snap:?}").contains("db.password"));
    }
}
