//! Certificate issuing for TLS rotation.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use tracing::{debug, info};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{CryptoError, Result};
use crate::material::sha256_hex;

/// Upper bound on requested certificate lifetimes.
pub const MAX_VALIDITY_DAYS: u32 = 825;

/// A certificate signed by an issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// DER encoding.
    pub der: Vec<u8>,
    /// PEM encoding.
    pub pem: String,
    /// End of validity.
    pub not_after: DateTime<Utc>,
    /// SHA-256 hex of the DER; what a TLS endpoint probe compares against.
    pub fingerprint: String,
}

/// Signs certificate requests.
pub trait CertificateIssuer: Send + Sync {
    /// Issues a certificate for a PKCS#10 request in PEM form.
    fn issue(&self, csr_pem: &str, validity_days: u32) -> Result<IssuedCertificate>;

    /// PEM of the issuing CA certificate.
    fn ca_certificate_pem(&self) -> &str;
}

/// In-process certificate authority with a self-signed root.
pub struct LocalCertificateAuthority {
    name: String,
    key_pair: KeyPair,
    root_pem: String,
}

impl LocalCertificateAuthority {
    /// Creates a CA with a freshly generated key.
    pub fn new(name: &str) -> Result<Self> {
        info!(name, "creating local certificate authority");
        let key_pair = KeyPair::generate()
            .map_err(|e| CryptoError::Certificate(format!("failed to generate CA key: {e}")))?;
        Self::from_key_pair(name, key_pair)
    }

    /// Loads the CA key from `<dir>/ca.key`, creating and saving one on
    /// first use. The root certificate is written to `<dir>/ca.crt`.
    pub fn load_or_create(dir: &Path, name: &str) -> Result<Self> {
        let key_path = dir.join("ca.key");
        let ca = if key_path.exists() {
            let pem = fs::read_to_string(&key_path).map_err(|e| CryptoError::io(&key_path, e))?;
            let key_pair = KeyPair::from_pem(&pem)
                .map_err(|e| CryptoError::Certificate(format!("failed to parse CA key: {e}")))?;
            debug!(path = %key_path.display(), "loaded CA key");
            Self::from_key_pair(name, key_pair)?
        } else {
            let ca = Self::new(name)?;
            fs::create_dir_all(dir).map_err(|e| CryptoError::io(dir, e))?;
            write_private(&key_path, ca.key_pair.serialize_pem().as_bytes())?;
            ca
        };

        let crt_path = dir.join("ca.crt");
        fs::write(&crt_path, &ca.root_pem).map_err(|e| CryptoError::io(&crt_path, e))?;
        Ok(ca)
    }

    fn from_key_pair(name: &str, key_pair: KeyPair) -> Result<Self> {
        let root = issuer_certificate(name, &key_pair)?;
        Ok(Self {
            name: name.to_string(),
            root_pem: root.pem(),
            key_pair,
        })
    }

    /// Common name of the CA.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl CertificateIssuer for LocalCertificateAuthority {
    fn issue(&self, csr_pem: &str, validity_days: u32) -> Result<IssuedCertificate> {
        if validity_days == 0 || validity_days > MAX_VALIDITY_DAYS {
            return Err(CryptoError::Certificate(format!(
                "validity must be between 1 and {MAX_VALIDITY_DAYS} days, got {validity_days}"
            )));
        }

        let mut request = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| CryptoError::Certificate(format!("invalid CSR: {e}")))?;

        let now = Utc::now();
        request.params.not_before = to_rcgen_time(now - Duration::hours(1))?;
        request.params.not_after = to_rcgen_time(now + Duration::days(i64::from(validity_days)))?;
        request.params.is_ca = IsCa::NoCa;
        request.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        request.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let issuer = issuer_certificate(&self.name, &self.key_pair)?;
        let cert = request
            .signed_by(&issuer, &self.key_pair)
            .map_err(|e| CryptoError::Certificate(format!("failed to sign certificate: {e}")))?;

        let der = cert.der().to_vec();
        let not_after = not_after_of(&der)?;
        let fingerprint = sha256_hex(&der);

        info!(ca = %self.name, %fingerprint, %not_after, "certificate issued");

        Ok(IssuedCertificate {
            pem: cert.pem(),
            der,
            not_after,
            fingerprint,
        })
    }

    fn ca_certificate_pem(&self) -> &str {
        &self.root_pem
    }
}

impl std::fmt::Debug for LocalCertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCertificateAuthority")
            .field("name", &self.name)
            .field("key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Self-signed CA certificate for `key_pair`; rebuilt for every signature
/// because rcgen needs a `Certificate` for the issuer side.
fn issuer_certificate(name: &str, key_pair: &KeyPair) -> Result<rcgen::Certificate> {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let now = Utc::now();
    params.not_before = to_rcgen_time(now - Duration::hours(1))?;
    params.not_after = to_rcgen_time(now + Duration::days(3650))?;

    params
        .self_signed(key_pair)
        .map_err(|e| CryptoError::Certificate(format!("failed to create issuer cert: {e}")))
}

/// Reads `notAfter` out of a DER certificate.
pub fn not_after_of(der: &[u8]) -> Result<DateTime<Utc>> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| CryptoError::Certificate(format!("failed to parse certificate: {e}")))?;
    DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| CryptoError::Certificate("invalid not_after timestamp".into()))
}

fn to_rcgen_time(dt: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| CryptoError::Certificate(format!("invalid timestamp: {e}")))
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| CryptoError::io(path, e))?;
    file.write_all(bytes).map_err(|e| CryptoError::io(path, e))
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).map_err(|e| CryptoError::io(path, e))
}
