//! Envelope file format.
//!
//! ```text
//! b"CSTDENV1" || header_len (u32 BE) || header (JSON) || nonce || ciphertext || tag
//! ```
//!
//! Everything before the body (magic, length, header) is authenticated as
//! associated data, so neither the wrapped key nor the declared plaintext
//! length can be swapped without failing decryption.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cipher::{self, SecretKey};
use crate::error::{CryptoError, Result};

/// Leading magic bytes of every envelope.
pub const MAGIC: &[u8; 8] = b"CSTDENV1";

/// Current header format version.
pub const FORMAT_VERSION: u32 = 1;

/// Cipher identifier recorded in headers.
pub const CIPHER: &str = "chacha20-poly1305";

/// Refuse headers larger than this.
const MAX_HEADER_LEN: usize = 64 * 1024;

/// Envelope header, stored in clear (but authenticated).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    /// Header format version.
    pub format_version: u32,
    /// KMS master key that wrapped the data key.
    pub kms_key_id: String,
    /// Wrapped data key, base64.
    pub wrapped_key: String,
    /// Body cipher.
    pub cipher: String,
    /// Length of the plaintext in bytes.
    pub plaintext_len: u64,
    /// When the envelope was sealed.
    pub created_at: DateTime<Utc>,
}

impl EnvelopeHeader {
    /// Creates a header for a new envelope.
    #[must_use]
    pub fn new(kms_key_id: &str, wrapped_key: String, plaintext_len: u64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            kms_key_id: kms_key_id.to_string(),
            wrapped_key,
            cipher: CIPHER.to_string(),
            plaintext_len,
            created_at: Utc::now(),
        }
    }
}

/// Seals `plaintext` under `data_key` into envelope bytes.
pub fn seal(header: &EnvelopeHeader, data_key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let header_json = serde_json::to_vec(header).map_err(|e| CryptoError::Envelope {
        reason: format!("failed to encode header: {e}"),
    })?;
    let header_len = u32::try_from(header_json.len()).map_err(|_| CryptoError::Envelope {
        reason: "header too large".into(),
    })?;

    let mut out = Vec::with_capacity(MAGIC.len() + 4 + header_json.len() + plaintext.len() + 28);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&header_len.to_be_bytes());
    out.extend_from_slice(&header_json);

    let body = cipher::encrypt_with_aad(data_key, plaintext, &out)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// A parsed, not yet decrypted envelope borrowing its input.
#[derive(Debug)]
pub struct ParsedEnvelope<'a> {
    /// Decoded header.
    pub header: EnvelopeHeader,
    prefix: &'a [u8],
    body: &'a [u8],
}

impl ParsedEnvelope<'_> {
    /// Decrypts the body with the unwrapped data key and checks the
    /// declared plaintext length.
    pub fn open(&self, data_key: &SecretKey) -> Result<Vec<u8>> {
        let plaintext = cipher::decrypt_with_aad(data_key, self.body, self.prefix)?;
        if plaintext.len() as u64 != self.header.plaintext_len {
            return Err(CryptoError::Envelope {
                reason: format!(
                    "plaintext is {} bytes, header declares {}",
                    plaintext.len(),
                    self.header.plaintext_len
                ),
            });
        }
        Ok(plaintext)
    }
}

/// Splits envelope bytes into header and body.
pub fn parse(bytes: &[u8]) -> Result<ParsedEnvelope<'_>> {
    let malformed = |reason: &str| CryptoError::Envelope {
        reason: reason.to_string(),
    };

    let rest = bytes.strip_prefix(MAGIC.as_slice()).ok_or_else(|| malformed("missing magic"))?;
    if rest.len() < 4 {
        return Err(malformed("truncated header length"));
    }
    let (len_bytes, rest) = rest.split_at(4);
    let header_len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    if header_len > MAX_HEADER_LEN || rest.len() < header_len {
        return Err(malformed("header length out of range"));
    }

    let (header_json, body) = rest.split_at(header_len);
    let header: EnvelopeHeader = serde_json::from_slice(header_json).map_err(|e| CryptoError::Envelope {
        reason: format!("invalid header: {e}"),
    })?;
    if header.format_version != FORMAT_VERSION {
        return Err(CryptoError::Envelope {
            reason: format!("unsupported format version {}", header.format_version),
        });
    }
    if header.cipher != CIPHER {
        return Err(CryptoError::Envelope {
            reason: format!("unsupported cipher '{}'", header.cipher),
        });
    }

    let prefix_len = MAGIC.len() + 4 + header_len;
    Ok(ParsedEnvelope {
        header,
        prefix: &bytes[..prefix_len],
        body,
    })
}
