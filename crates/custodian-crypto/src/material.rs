//! Fresh credential material.
//!
//! Every generator draws from the OS CSPRNG. All secret bytes live in
//! zeroizing buffers and `Debug` output is redacted; only fingerprints
//! (truncated SHA-256) are safe to log or persist.
//!
//! Asymmetric keys are elliptic-curve rather than RSA. JWT signing keys are
//! Ed25519 and TLS keys are ECDSA P-256; both give roughly 128-bit security,
//! comparable to 3072-bit RSA and above the 2048-bit RSA floor for signing
//! and certificate keys.

use ed25519_dalek::SigningKey;
use ed25519_dalek::pkcs8::{EncodePrivateKey, KeypairBytes};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use rcgen::{CertificateParams, DnType, KeyPair};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::cipher::SecretKey;
use crate::error::{CryptoError, Result};

/// Length of generated database passwords.
pub const PASSWORD_LENGTH: usize = 32;

/// Hex characters kept in a fingerprint.
const FINGERPRINT_HEX_LEN: usize = 16;

/// Truncated SHA-256 fingerprint of `bytes`.
#[must_use]
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut digest = hex::encode(Sha256::digest(bytes));
    digest.truncate(FINGERPRINT_HEX_LEN);
    digest
}

/// Full SHA-256 hex digest, used for certificate fingerprints.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// An Ed25519 signing key pair for JWT issuance.
pub struct Ed25519Material {
    pkcs8_der: Zeroizing<Vec<u8>>,
    public_key: [u8; 32],
}

impl Ed25519Material {
    /// Generates a new key pair.
    pub fn generate() -> Result<Self> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = signing_key.verifying_key().to_bytes();

        let keypair = KeypairBytes {
            secret_key: signing_key.to_bytes(),
            public_key: None,
        };
        let document = keypair
            .to_pkcs8_der()
            .map_err(|e| CryptoError::Generation(format!("failed to encode signing key: {e}")))?;

        Ok(Self {
            pkcs8_der: Zeroizing::new(document.as_bytes().to_vec()),
            public_key,
        })
    }

    /// PKCS#8 DER of the private key.
    #[must_use]
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8_der
    }

    /// Raw 32-byte public key.
    #[must_use]
    pub const fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }
}

/// A 256-bit symmetric data-encryption key.
pub struct SymmetricMaterial {
    key: SecretKey,
}

impl SymmetricMaterial {
    /// Generates a new key.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            key: SecretKey::generate(),
        }
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.key.as_bytes()
    }
}

/// A database password.
pub struct PasswordMaterial {
    password: Zeroizing<String>,
}

impl PasswordMaterial {
    /// Generates a [`PASSWORD_LENGTH`]-character alphanumeric password
    /// (about 190 bits of entropy).
    #[must_use]
    pub fn generate() -> Self {
        let password: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(PASSWORD_LENGTH)
            .map(char::from)
            .collect();
        Self {
            password: Zeroizing::new(password),
        }
    }

    /// The password text.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.password
    }
}

/// A TLS key pair plus the certificate signing request for it.
pub struct TlsMaterial {
    key_pem: Zeroizing<String>,
    csr_pem: String,
    public_key_der: Vec<u8>,
}

impl TlsMaterial {
    /// Generates an ECDSA P-256 key pair and a CSR for `common_name`
    /// covering `dns_names`.
    pub fn generate(common_name: &str, dns_names: &[String]) -> Result<Self> {
        let key_pair = KeyPair::generate()
            .map_err(|e| CryptoError::Generation(format!("failed to generate key pair: {e}")))?;

        let mut params = CertificateParams::new(dns_names.to_vec())
            .map_err(|e| CryptoError::Generation(format!("invalid subject alt names: {e}")))?;
        params.distinguished_name.push(DnType::CommonName, common_name);

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| CryptoError::Generation(format!("failed to build CSR: {e}")))?;
        let csr_pem = csr
            .pem()
            .map_err(|e| CryptoError::Generation(format!("failed to encode CSR: {e}")))?;

        Ok(Self {
            key_pem: Zeroizing::new(key_pair.serialize_pem()),
            csr_pem,
            public_key_der: key_pair.public_key_der(),
        })
    }

    /// PEM of the private key.
    #[must_use]
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// PEM of the PKCS#10 signing request.
    #[must_use]
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }
}

/// Freshly generated material of any credential type.
pub enum Material {
    /// JWT signing key pair.
    Ed25519(Ed25519Material),
    /// Symmetric data key.
    Symmetric(SymmetricMaterial),
    /// Database password.
    Password(PasswordMaterial),
    /// TLS key pair and CSR.
    Tls(TlsMaterial),
}

impl Material {
    /// Fingerprint identifying this material without revealing it.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        match self {
            Self::Ed25519(m) => fingerprint(m.public_key()),
            Self::Symmetric(m) => fingerprint(m.as_bytes()),
            Self::Password(m) => fingerprint(m.expose().as_bytes()),
            Self::Tls(m) => fingerprint(&m.public_key_der),
        }
    }

    /// Short name of the material kind.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Ed25519(_) => "ed25519",
            Self::Symmetric(_) => "symmetric",
            Self::Password(_) => "password",
            Self::Tls(_) => "tls",
        }
    }
}

impl std::fmt::Debug for Material {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Material")
            .field("kind", &self.kind_name())
            .field("fingerprint", &self.fingerprint())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ed25519_material_has_pkcs8_and_public_key() {
        let m = Ed25519Material::generate().expect("generate");
        assert!(!m.pkcs8_der().is_empty());
        assert_ne!(m.public_key(), &[0u8; 32]);

        let other = Ed25519Material::generate().expect("generate");
        assert_ne!(m.public_key(), other.public_key());
    }

    #[test]
    fn symmetric_key_is_256_bits() {
        let m = SymmetricMaterial::generate();
        assert_eq!(m.as_bytes().len(), 32);
        assert_ne!(m.as_bytes(), SymmetricMaterial::generate().as_bytes());
    }

    #[test]
    fn tls_material_produces_csr() {
        let m = TlsMaterial::generate("api.internal", &["api.internal".to_string()]).expect("generate");
        assert!(m.csr_pem().starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
        assert!(m.key_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn debug_never_shows_secrets() {
        let password = PasswordMaterial::generate();
        let text = password.expose().to_string();
        let debug = format!("{:?}", Material::Password(password));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains(&text));
    }

    #[test]
    fn fingerprint_is_truncated_sha256() {
        let fp = fingerprint(b"abc");
        assert_eq!(fp, "ba7816bf8f01cfea");
    }

    proptest! {
        #[test]
        fn passwords_are_32_alphanumeric_chars(_seed in 0u8..32) {
            let password = PasswordMaterial::generate();
            prop_assert_eq!(password.expose().len(), PASSWORD_LENGTH);
            prop_assert!(password.expose().chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }
}
