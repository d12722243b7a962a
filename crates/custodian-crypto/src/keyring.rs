//! Versioned data-encryption keys.
//!
//! Consumers of rotated symmetric keys hold every version still present
//! in the secret. Each ciphertext starts with the version of the key that
//! produced it, so data written under an old key stays readable through
//! the grace window while new data is written under the active key.
//!
//! Secret layout: `dek.active` holds the active version number as ASCII,
//! `dek.v<N>` holds the raw 32-byte key for version `N`.

use std::collections::BTreeMap;

use crate::cipher::{self, SecretKey};
use crate::error::{CryptoError, Result};

/// Field holding the active version number.
pub const ACTIVE_FIELD: &str = "dek.active";

/// Prefix of the per-version key fields.
pub const KEY_FIELD_PREFIX: &str = "dek.v";

/// Leading magic of versioned ciphertexts.
pub const MAGIC: &[u8; 4] = b"CDK1";

/// Secret field name for data key `version`.
#[must_use]
pub fn key_field(version: u32) -> String {
    format!("{KEY_FIELD_PREFIX}{version}")
}

/// A set of data keys with one active version.
#[derive(Debug, Clone)]
pub struct VersionedKeyring {
    active: u32,
    keys: BTreeMap<u32, SecretKey>,
}

impl VersionedKeyring {
    /// Creates a keyring holding a single active key.
    #[must_use]
    pub fn new(version: u32, key: SecretKey) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(version, key);
        Self { active: version, keys }
    }

    /// Builds a keyring from secret fields (`dek.active`, `dek.v<N>`).
    /// Unrelated fields are ignored.
    pub fn from_fields<'a, I>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let mut active = None;
        let mut keys = BTreeMap::new();

        for (name, value) in fields {
            if name == ACTIVE_FIELD {
                let text = std::str::from_utf8(value).map_err(|_| CryptoError::InvalidKey {
                    reason: format!("{ACTIVE_FIELD} is not UTF-8"),
                })?;
                active = Some(text.trim().parse::<u32>().map_err(|e| CryptoError::InvalidKey {
                    reason: format!("{ACTIVE_FIELD} is not a version number: {e}"),
                })?);
            } else if let Some(version) = name.strip_prefix(KEY_FIELD_PREFIX) {
                let version = version.parse::<u32>().map_err(|e| CryptoError::InvalidKey {
                    reason: format!("bad key field '{name}': {e}"),
                })?;
                keys.insert(version, SecretKey::from_bytes(value)?);
            }
        }

        let active = active.ok_or_else(|| CryptoError::InvalidKey {
            reason: format!("missing {ACTIVE_FIELD}"),
        })?;
        if !keys.contains_key(&active) {
            return Err(CryptoError::UnknownKeyVersion { version: active });
        }
        Ok(Self { active, keys })
    }

    /// Adds (or replaces) a key version without activating it.
    pub fn insert(&mut self, version: u32, key: SecretKey) {
        self.keys.insert(version, key);
    }

    /// Makes `version` the active key.
    pub fn activate(&mut self, version: u32) -> Result<()> {
        if !self.keys.contains_key(&version) {
            return Err(CryptoError::UnknownKeyVersion { version });
        }
        self.active = version;
        Ok(())
    }

    /// Drops a key version. The active version cannot be removed.
    pub fn remove(&mut self, version: u32) -> Result<()> {
        if version == self.active {
            return Err(CryptoError::InvalidKey {
                reason: format!("cannot remove active data key v{version}"),
            });
        }
        self.keys.remove(&version);
        Ok(())
    }

    /// Active version.
    #[must_use]
    pub const fn active_version(&self) -> u32 {
        self.active
    }

    /// All versions held, ascending.
    #[must_use]
    pub fn versions(&self) -> Vec<u32> {
        self.keys.keys().copied().collect()
    }

    /// Encrypts under the active key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self
            .keys
            .get(&self.active)
            .ok_or(CryptoError::UnknownKeyVersion { version: self.active })?;

        let mut out = Vec::with_capacity(MAGIC.len() + 4 + plaintext.len() + 28);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.active.to_be_bytes());
        let sealed = cipher::encrypt_with_aad(key, plaintext, &out)?;
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypts with whichever key version the ciphertext names.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let version = Self::version_of(ciphertext)?;
        let key = self
            .keys
            .get(&version)
            .ok_or(CryptoError::UnknownKeyVersion { version })?;
        let (header, sealed) = ciphertext.split_at(MAGIC.len() + 4);
        cipher::decrypt_with_aad(key, sealed, header)
    }

    /// Reads the key-version tag of a ciphertext.
    pub fn version_of(ciphertext: &[u8]) -> Result<u32> {
        let tag = ciphertext
            .strip_prefix(MAGIC.as_slice())
            .and_then(|rest| rest.get(..4))
            .ok_or_else(|| CryptoError::Decryption {
                reason: "ciphertext has no key-version tag".into(),
            })?;
        Ok(u32::from_be_bytes([tag[0], tag[1], tag[2], tag[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(entries: &[(&str, Vec<u8>)]) -> Result<VersionedKeyring> {
        VersionedKeyring::from_fields(entries.iter().map(|(k, v)| (*k, v.as_slice())))
    }

    #[test]
    fn old_ciphertexts_stay_readable_after_rotation() {
        let v1 = SecretKey::generate();
        let mut ring = VersionedKeyring::new(1, v1);
        let old = ring.encrypt(b"written under v1").expect("encrypt");

        ring.insert(2, SecretKey::generate());
        ring.activate(2).expect("activate");
        let new = ring.encrypt(b"written under v2").expect("encrypt");

        assert_eq!(VersionedKeyring::version_of(&old).expect("tag"), 1);
        assert_eq!(VersionedKeyring::version_of(&new).expect("tag"), 2);
        assert_eq!(ring.decrypt(&old).expect("v1"), b"written under v1");
        assert_eq!(ring.decrypt(&new).expect("v2"), b"written under v2");
    }

    #[test]
    fn retired_versions_can_no_longer_decrypt() {
        let mut ring = VersionedKeyring::new(1, SecretKey::generate());
        let old = ring.encrypt(b"v1 data").expect("encrypt");
        ring.insert(2, SecretKey::generate());
        ring.activate(2).expect("activate");
        ring.remove(1).expect("remove");

        assert!(matches!(ring.decrypt(&old), Err(CryptoError::UnknownKeyVersion { version: 1 })));
        assert!(ring.remove(2).is_err());
    }

    #[test]
    fn version_tag_is_authenticated() {
        let mut ring = VersionedKeyring::new(1, SecretKey::generate());
        ring.insert(2, SecretKey::generate());
        let mut ct = ring.encrypt(b"data").expect("encrypt");
        ct[7] = 2;
        assert!(ring.decrypt(&ct).is_err());
    }

    #[test]
    fn builds_from_secret_fields() {
        let k1 = SecretKey::generate();
        let k2 = SecretKey::generate();
        let ring = fields(&[
            ("dek.active", b"2".to_vec()),
            ("dek.v1", k1.as_bytes().to_vec()),
            ("dek.v2", k2.as_bytes().to_vec()),
            ("unrelated", b"x".to_vec()),
        ])
        .expect("keyring");

        assert_eq!(ring.active_version(), 2);
        assert_eq!(ring.versions(), vec![1, 2]);
    }

    #[test]
    fn active_version_must_be_present() {
        let err = fields(&[("dek.active", b"3".to_vec()), ("dek.v1", vec![0u8; 32])]).expect_err("missing v3");
        assert!(matches!(err, CryptoError::UnknownKeyVersion { version: 3 }));
        assert!(fields(&[("dek.v1", vec![0u8; 32])]).is_err());
    }
}
