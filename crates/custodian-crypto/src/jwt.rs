//! EdDSA token signing and multi-key verification.
//!
//! The JWT secret holds one signing key and one public key per version
//! still inside its grace window:
//!
//! - `jwt.active-kid`: key id used for new tokens (`v<N>`)
//! - `jwt.signing-key`: PKCS#8 DER of the active private key
//! - `jwt.public.<kid>`: raw 32-byte Ed25519 public key
//!
//! Verifiers select the key by the token header's `kid`, so tokens signed
//! before a rotation keep validating until their public key is removed.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::error::{CryptoError, Result};

/// Field naming the active key id.
pub const ACTIVE_KID_FIELD: &str = "jwt.active-kid";

/// Field holding the active private key.
pub const SIGNING_KEY_FIELD: &str = "jwt.signing-key";

/// Prefix of the per-kid public key fields.
pub const PUBLIC_KEY_PREFIX: &str = "jwt.public.";

/// Key id for version `version`.
#[must_use]
pub fn kid_for(version: u32) -> String {
    format!("v{version}")
}

/// Public key field name for `kid`.
#[must_use]
pub fn public_key_field(kid: &str) -> String {
    format!("{PUBLIC_KEY_PREFIX}{kid}")
}

/// Minimal claim set issued by services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject.
    pub sub: String,
    /// Issuer.
    pub iss: String,
    /// Issued at (Unix seconds).
    pub iat: i64,
    /// Expiry (Unix seconds).
    pub exp: i64,
}

impl TokenClaims {
    /// Claims valid for `lifetime` from now.
    #[must_use]
    pub fn new(sub: impl Into<String>, iss: impl Into<String>, lifetime: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: sub.into(),
            iss: iss.into(),
            iat: now.timestamp(),
            exp: (now + lifetime).timestamp(),
        }
    }
}

/// Signs tokens with the active key.
pub struct JwtSigner {
    kid: String,
    key: EncodingKey,
}

impl JwtSigner {
    /// Creates a signer from a PKCS#8 DER Ed25519 key.
    #[must_use]
    pub fn new(kid: impl Into<String>, pkcs8_der: &[u8]) -> Self {
        Self {
            kid: kid.into(),
            key: EncodingKey::from_ed_der(pkcs8_der),
        }
    }

    /// Builds the signer from JWT secret fields.
    pub fn from_fields(fields: &BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let kid = field_str(fields, ACTIVE_KID_FIELD)?;
        let der = fields
            .get(SIGNING_KEY_FIELD)
            .ok_or_else(|| CryptoError::Jwt(format!("missing {SIGNING_KEY_FIELD}")))?;
        Ok(Self::new(kid, der))
    }

    /// Key id stamped into issued tokens.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Signs `claims`.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String> {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.kid.clone());
        encode(&header, claims, &self.key).map_err(|e| CryptoError::Jwt(format!("failed to sign token: {e}")))
    }
}

impl std::fmt::Debug for JwtSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSigner")
            .field("kid", &self.kid)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Verifies tokens against every published public key.
pub struct JwtVerifier {
    keys: BTreeMap<String, DecodingKey>,
    issuer: Option<String>,
}

impl JwtVerifier {
    /// Creates an empty verifier.
    #[must_use]
    pub fn new() -> Self {
        Self {
            keys: BTreeMap::new(),
            issuer: None,
        }
    }

    /// Requires tokens to carry this issuer.
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Adds a raw 32-byte Ed25519 public key under `kid`.
    pub fn add_key(&mut self, kid: impl Into<String>, public_key: &[u8]) -> Result<()> {
        if public_key.len() != 32 {
            return Err(CryptoError::Jwt(format!(
                "Ed25519 public key must be 32 bytes, got {}",
                public_key.len()
            )));
        }
        let key = DecodingKey::from_ed_components(&URL_SAFE_NO_PAD.encode(public_key))
            .map_err(|e| CryptoError::Jwt(format!("invalid public key: {e}")))?;
        self.keys.insert(kid.into(), key);
        Ok(())
    }

    /// Builds a verifier from every `jwt.public.<kid>` field.
    pub fn from_fields(fields: &BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let mut verifier = Self::new();
        for (name, value) in fields {
            if let Some(kid) = name.strip_prefix(PUBLIC_KEY_PREFIX) {
                verifier.add_key(kid, value)?;
            }
        }
        Ok(verifier)
    }

    /// Key ids this verifier accepts.
    #[must_use]
    pub fn kids(&self) -> Vec<&str> {
        self.keys.keys().map(String::as_str).collect()
    }

    /// Verifies `token` and returns its claims.
    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T> {
        let header = decode_header(token).map_err(|e| CryptoError::Jwt(format!("malformed token: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| CryptoError::Jwt("token has no kid".into()))?;
        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| CryptoError::Jwt(format!("unknown kid '{kid}'")))?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_aud = false;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        decode::<T>(token, key, &validation)
            .map(|data| data.claims)
            .map_err(|e| CryptoError::Jwt(format!("token rejected: {e}")))
    }
}

impl Default for JwtVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("kids", &self.kids())
            .field("issuer", &self.issuer)
            .finish()
    }
}

fn field_str(fields: &BTreeMap<String, Vec<u8>>, name: &str) -> Result<String> {
    let bytes = fields
        .get(name)
        .ok_or_else(|| CryptoError::Jwt(format!("missing {name}")))?;
    String::from_utf8(bytes.clone()).map_err(|_| CryptoError::Jwt(format!("{name} is not UTF-8")))
}
