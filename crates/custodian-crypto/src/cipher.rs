//! Authenticated encryption primitives.
//!
//! ChaCha20-Poly1305 with random 96-bit nonces. Output layout is
//! `nonce || ciphertext || tag`. Optional associated data binds headers
//! (envelope header, key-version tags) to the ciphertext.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};

/// Size of a data key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// A 256-bit symmetric key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    /// Generates a random key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey {
                reason: format!("key must be exactly {KEY_SIZE} bytes, got {}", bytes.len()),
            });
        }

        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Derives a per-object key with BLAKE3 in key-derivation mode.
    ///
    /// `purpose` namespaces the derivation (for example `"secret-store"`),
    /// `object` identifies the object the key protects.
    #[must_use]
    pub fn derive(&self, purpose: &str, object: &str) -> Self {
        let context = format!("custodian {purpose} v1 {object}");
        Self {
            bytes: blake3::derive_key(&context, &self.bytes),
        }
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.ct_eq(&other.bytes).into()
    }
}

impl Eq for SecretKey {}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

fn cipher_for(key: &SecretKey) -> Result<ChaCha20Poly1305> {
    ChaCha20Poly1305::new_from_slice(&key.bytes).map_err(|e| CryptoError::InvalidKey {
        reason: format!("failed to create cipher: {e}"),
    })
}

/// Encrypts `plaintext` with no associated data.
pub fn encrypt(key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    encrypt_with_aad(key, plaintext, &[])
}

/// Decrypts output of [`encrypt`].
pub fn decrypt(key: &SecretKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    decrypt_with_aad(key, ciphertext, &[])
}

/// Encrypts `plaintext`, authenticating `aad` alongside it.
pub fn encrypt_with_aad(key: &SecretKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypts output of [`encrypt_with_aad`]; `aad` must match exactly.
pub fn decrypt_with_aad(key: &SecretKey, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Decryption {
            reason: format!(
                "ciphertext too short: expected at least {} bytes, got {}",
                NONCE_SIZE + TAG_SIZE,
                ciphertext.len()
            ),
        });
    }

    let cipher = cipher_for(key)?;
    let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);

    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: sealed, aad })
        .map_err(|_| CryptoError::Decryption {
            reason: "authentication failed (wrong key or tampered data)".to_string(),
        })
}
