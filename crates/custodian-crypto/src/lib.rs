//! # custodian-crypto
//!
//! Key material and encryption for Custodian.
//!
//! - [`material`]: Ed25519, symmetric, password and TLS material generators
//! - [`ca`]: certificate issuing for rotated TLS key pairs
//! - [`kms`]: the KMS contract and a local keyring implementation
//! - [`envelope`] and [`pipeline`]: envelope encryption of backup artifacts
//! - [`keyring`]: versioned data keys with per-ciphertext version tags
//! - [`jwt`]: EdDSA token signing with kid-based multi-key verification
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use custodian_crypto::{EncryptionPipeline, LocalKms};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let kms = LocalKms::in_memory();
//! kms.ensure_key("backup-master").expect("key");
//! let pipeline = EncryptionPipeline::new(Arc::new(kms));
//!
//! let sealed = pipeline.encrypt_bytes(b"dump", "backup-master").await.expect("encrypt");
//! assert_eq!(pipeline.decrypt(&sealed).await.expect("decrypt"), b"dump");
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ca;
pub mod cipher;
pub mod envelope;
pub mod error;
pub mod jwt;
pub mod keyring;
pub mod kms;
pub mod material;
pub mod pipeline;

pub use ca::{CertificateIssuer, IssuedCertificate, LocalCertificateAuthority};
pub use cipher::SecretKey;
pub use error::{CryptoError, Result};
pub use jwt::{JwtSigner, JwtVerifier, TokenClaims};
pub use keyring::VersionedKeyring;
pub use kms::{Kms, LocalKms};
pub use material::{Ed25519Material, Material, PasswordMaterial, SymmetricMaterial, TlsMaterial};
pub use pipeline::{EncryptedArtifact, EncryptionPipeline, PlaintextGuard};
