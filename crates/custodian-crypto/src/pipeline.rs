//! Envelope encryption of backup artifacts.
//!
//! A fresh data key per artifact, wrapped by the KMS; only the envelope is
//! kept on disk. The plaintext dump is overwritten with zeros, synced and
//! unlinked by a [`PlaintextGuard`], on success and on failure alike.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use custodian_core::with_deadline;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::cipher::SecretKey;
use crate::envelope::{self, EnvelopeHeader};
use crate::error::{CryptoError, Result};
use crate::kms::Kms;

/// Default deadline for a KMS call.
pub const DEFAULT_KMS_TIMEOUT: Duration = Duration::from_secs(10);

/// Suffix appended to encrypted artifacts.
pub const ENCRYPTED_SUFFIX: &str = "enc";

/// An artifact that has been envelope-encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedArtifact {
    /// Path of the envelope file.
    pub path: PathBuf,
    /// KMS key that wrapped the data key.
    pub kms_key_id: String,
    /// Size of the envelope file.
    pub size_bytes: u64,
    /// Size of the plaintext that was encrypted.
    pub plaintext_len: u64,
}

/// Securely erases a plaintext file when dropped.
#[derive(Debug)]
pub struct PlaintextGuard {
    path: PathBuf,
    armed: bool,
}

impl PlaintextGuard {
    /// Guards `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    /// Erases the file now, reporting errors.
    pub fn erase(mut self) -> io::Result<()> {
        self.armed = false;
        shred(&self.path)
    }
}

impl Drop for PlaintextGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = shred(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to erase plaintext");
            }
        }
    }
}

/// Overwrites with zeros, syncs, unlinks. A missing file is already erased.
fn shred(path: &Path) -> io::Result<()> {
    let mut file = match OpenOptions::new().write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let mut remaining = file.metadata()?.len();
    let zeros = [0u8; 64 * 1024];
    while remaining > 0 {
        let chunk = remaining.min(zeros.len() as u64) as usize;
        file.write_all(&zeros[..chunk])?;
        remaining -= chunk as u64;
    }
    file.sync_all()?;
    drop(file);

    std::fs::remove_file(path)?;
    debug!(path = %path.display(), "plaintext erased");
    Ok(())
}

/// Envelope encryption through a KMS.
#[derive(Clone)]
pub struct EncryptionPipeline {
    kms: Arc<dyn Kms>,
    timeout: Duration,
}

impl EncryptionPipeline {
    /// Creates a pipeline using `kms` for data-key wrapping.
    #[must_use]
    pub fn new(kms: Arc<dyn Kms>) -> Self {
        Self {
            kms,
            timeout: DEFAULT_KMS_TIMEOUT,
        }
    }

    /// Sets the KMS call deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Encrypts the file at `artifact_path` into `<artifact_path>.enc` and
    /// erases the plaintext.
    pub async fn encrypt_file(&self, artifact_path: &Path, kms_key_id: &str) -> Result<EncryptedArtifact> {
        let guard = PlaintextGuard::new(artifact_path);

        let plaintext = Zeroizing::new(
            tokio::fs::read(artifact_path)
                .await
                .map_err(|e| CryptoError::io(artifact_path, e))?,
        );
        let sealed = self.encrypt_bytes(&plaintext, kms_key_id).await?;

        let enc_path = encrypted_path(artifact_path);
        if let Err(e) = tokio::fs::write(&enc_path, &sealed).await {
            let _ = tokio::fs::remove_file(&enc_path).await;
            return Err(CryptoError::io(&enc_path, e));
        }

        guard.erase().map_err(|e| CryptoError::io(artifact_path, e))?;

        info!(
            artifact = %enc_path.display(),
            kms_key_id,
            plaintext_len = plaintext.len(),
            envelope_len = sealed.len(),
            "artifact encrypted"
        );

        Ok(EncryptedArtifact {
            path: enc_path,
            kms_key_id: kms_key_id.to_string(),
            size_bytes: sealed.len() as u64,
            plaintext_len: plaintext.len() as u64,
        })
    }

    /// Seals `plaintext` into envelope bytes.
    pub async fn encrypt_bytes(&self, plaintext: &[u8], kms_key_id: &str) -> Result<Vec<u8>> {
        let data_key = SecretKey::generate();
        let wrapped = with_deadline(self.timeout, self.kms.encrypt(kms_key_id, data_key.as_bytes()))
            .await
            .map_err(|t| CryptoError::Timeout {
                operation: "kms encrypt",
                after: t.after,
            })??;

        let header = EnvelopeHeader::new(kms_key_id, BASE64.encode(&wrapped), plaintext.len() as u64);
        envelope::seal(&header, &data_key, plaintext)
    }

    /// Opens envelope bytes, unwrapping the data key through the KMS.
    pub async fn decrypt(&self, envelope_bytes: &[u8]) -> Result<Vec<u8>> {
        let parsed = envelope::parse(envelope_bytes)?;
        let wrapped = BASE64
            .decode(parsed.header.wrapped_key.as_bytes())
            .map_err(|e| CryptoError::Envelope {
                reason: format!("wrapped key is not base64: {e}"),
            })?;

        let raw_key = Zeroizing::new(
            with_deadline(self.timeout, self.kms.decrypt(&wrapped))
                .await
                .map_err(|t| CryptoError::Timeout {
                    operation: "kms decrypt",
                    after: t.after,
                })??,
        );
        let data_key = SecretKey::from_bytes(&raw_key)?;
        parsed.open(&data_key)
    }
}

impl std::fmt::Debug for EncryptionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionPipeline")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// `<path>.enc`
#[must_use]
pub fn encrypted_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(ENCRYPTED_SUFFIX);
    PathBuf::from(name)
}
