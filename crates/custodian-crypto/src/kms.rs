//! Key management service contract.
//!
//! The pipeline only ever asks a KMS to wrap and unwrap data keys. A
//! wrapped key is self-describing: [`Kms::decrypt`] needs no key id.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use custodian_core::JsonStore;
use tracing::{debug, info};

use crate::cipher::{self, SecretKey};
use crate::error::{CryptoError, Result};

/// A key management service able to wrap small secrets.
#[async_trait]
pub trait Kms: Send + Sync {
    /// Encrypts `plaintext` under the master key `key_id`.
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypts a ciphertext produced by [`Kms::encrypt`].
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// A KMS backed by a local keyring of 256-bit master keys.
///
/// Ciphertext layout: `key_id_len (u8) || key_id || nonce || ct || tag`,
/// with the key id authenticated as associated data.
#[derive(Debug)]
pub struct LocalKms {
    keys: RwLock<BTreeMap<String, SecretKey>>,
    store: Option<JsonStore>,
}

impl LocalKms {
    /// Creates an empty, memory-only KMS.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            keys: RwLock::new(BTreeMap::new()),
            store: None,
        }
    }

    /// Opens (or starts) the keyring `<dir>/kms-keyring.json`.
    pub fn open(dir: &Path) -> Result<Self> {
        let store = JsonStore::new(dir, "kms-keyring");
        let encoded: BTreeMap<String, String> = store.load()?;

        let mut keys = BTreeMap::new();
        for (key_id, b64) in encoded {
            let bytes = BASE64.decode(b64.as_bytes()).map_err(|e| CryptoError::InvalidKey {
                reason: format!("keyring entry '{key_id}' is not base64: {e}"),
            })?;
            keys.insert(key_id, SecretKey::from_bytes(&bytes)?);
        }
        debug!(path = %store.path().display(), keys = keys.len(), "opened KMS keyring");

        Ok(Self {
            keys: RwLock::new(keys),
            store: Some(store),
        })
    }

    /// Adds a fresh master key under `key_id` if none exists yet.
    /// Returns true if a key was created.
    pub fn ensure_key(&self, key_id: &str) -> Result<bool> {
        if key_id.is_empty() || key_id.len() > usize::from(u8::MAX) {
            return Err(CryptoError::Kms {
                reason: format!("key id must be 1-255 bytes, got {}", key_id.len()),
            });
        }

        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        if keys.contains_key(key_id) {
            return Ok(false);
        }
        keys.insert(key_id.to_string(), SecretKey::generate());

        if let Some(store) = &self.store {
            let encoded: BTreeMap<&str, String> = keys
                .iter()
                .map(|(id, key)| (id.as_str(), BASE64.encode(key.as_bytes())))
                .collect();
            store.save(&encoded)?;
        }

        info!(key_id, "created KMS master key");
        Ok(true)
    }

    fn key(&self, key_id: &str) -> Result<SecretKey> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key_id)
            .cloned()
            .ok_or_else(|| CryptoError::UnknownKmsKey {
                key_id: key_id.to_string(),
            })
    }
}

#[async_trait]
impl Kms for LocalKms {
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.key(key_id)?;
        let id = key_id.as_bytes();
        let id_len = u8::try_from(id.len()).map_err(|_| CryptoError::Kms {
            reason: "key id longer than 255 bytes".into(),
        })?;

        let sealed = cipher::encrypt_with_aad(&key, plaintext, id)?;

        let mut out = Vec::with_capacity(1 + id.len() + sealed.len());
        out.push(id_len);
        out.extend_from_slice(id);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let (&id_len, rest) = ciphertext.split_first().ok_or_else(|| CryptoError::Kms {
            reason: "empty ciphertext".into(),
        })?;
        let id_len = usize::from(id_len);
        if rest.len() < id_len {
            return Err(CryptoError::Kms {
                reason: "ciphertext truncated inside key id".into(),
            });
        }
        let (id, sealed) = rest.split_at(id_len);
        let key_id = std::str::from_utf8(id).map_err(|_| CryptoError::Kms {
            reason: "key id is not UTF-8".into(),
        })?;

        let key = self.key(key_id)?;
        cipher::decrypt_with_aad(&key, sealed, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wraps_and_unwraps() {
        let kms = LocalKms::in_memory();
        assert!(kms.ensure_key("backup-master").expect("key"));
        assert!(!kms.ensure_key("backup-master").expect("key exists"));

        let wrapped = kms.encrypt("backup-master", b"data key").await.expect("wrap");
        assert_ne!(&wrapped[..], b"data key");
        assert_eq!(kms.decrypt(&wrapped).await.expect("unwrap"), b"data key");
    }

    #[tokio::test]
    async fn unknown_key_is_rejected() {
        let kms = LocalKms::in_memory();
        let err = kms.encrypt("missing", b"x").await.expect_err("unknown");
        assert!(matches!(err, CryptoError::UnknownKmsKey { .. }));
    }

    #[tokio::test]
    async fn key_id_is_authenticated() {
        let kms = LocalKms::in_memory();
        kms.ensure_key("aa").expect("key");
        kms.ensure_key("ab").expect("key");

        let mut wrapped = kms.encrypt("aa", b"secret").await.expect("wrap");
        // Redirect to the other key id of the same length.
        wrapped[2] = b'b';
        assert!(kms.decrypt(&wrapped).await.is_err());
    }

    #[tokio::test]
    async fn keyring_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let wrapped = {
            let kms = LocalKms::open(dir.path()).expect("open");
            kms.ensure_key("backup-master").expect("key");
            kms.encrypt("backup-master", b"dek").await.expect("wrap")
        };

        let reopened = LocalKms::open(dir.path()).expect("reopen");
        assert_eq!(reopened.decrypt(&wrapped).await.expect("unwrap"), b"dek");
    }

    #[tokio::test]
    async fn malformed_ciphertexts_fail() {
        let kms = LocalKms::in_memory();
        assert!(kms.decrypt(&[]).await.is_err());
        assert!(kms.decrypt(&[10, b'a']).await.is_err());
    }
}
