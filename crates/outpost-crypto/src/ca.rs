//! Slave certificate authority.
//!
//! Generates (or loads) the master's RSA root, signs slave CSRs into client
//! certificates and verifies the certificates slaves present on connect.

use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rand::RngCore;
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use time::{Duration, OffsetDateTime};
use tracing::info;
use x509_parser::certificate::X509Certificate;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

use crate::error::CaError;

/// File name of the CA certificate inside the data directory.
pub const CA_CERT_FILE: &str = "slave-ca-cert.pem";
/// File name of the CA private key inside the data directory.
pub const CA_KEY_FILE: &str = "slave-ca-key.pem";

const CA_COMMON_NAME: &str = "Outpost Slave CA";
const CA_ORGANIZATION: &str = "Outpost";
const CA_VALIDITY_DAYS: i64 = 3650;

/// Options for generating a new CA.
#[derive(Debug, Clone, Copy)]
pub struct CaOptions {
    /// RSA modulus size for a freshly generated root key.
    pub key_bits: usize,
}

impl Default for CaOptions {
    fn default() -> Self {
        Self { key_bits: 4096 }
    }
}

/// A certificate issued from a slave CSR.
#[derive(Debug, Clone)]
pub struct SignedCertificate {
    /// PEM-encoded leaf certificate.
    pub cert_pem: String,
    /// Lowercase hex serial, as rendered by [`serial_hex`].
    pub serial: String,
    /// Start of validity, Unix seconds.
    pub not_before: i64,
    /// End of validity, Unix seconds.
    pub not_after: i64,
}

/// The master's TLS server certificate and key.
#[derive(Debug, Clone)]
pub struct ServerCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Identity extracted from a client certificate that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedClient {
    pub common_name: String,
    pub serial: String,
    pub not_before: i64,
    pub not_after: i64,
}

/// The slave certificate authority. Read-only once loaded.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: Vec<u8>,
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load the CA from `dir`, or generate and persist a new one if either
    /// file is missing.
    pub fn load_or_generate(dir: &Path, opts: CaOptions) -> Result<Self, CaError> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            Self::load(&cert_path, &key_path)
        } else {
            Self::generate(&cert_path, &key_path, opts)
        }
    }

    fn generate(cert_path: &Path, key_path: &Path, opts: CaOptions) -> Result<Self, CaError> {
        let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), opts.key_bits)
            .map_err(|e| CaError::Crypto(format!("RSA key generation failed: {e}")))?;
        let key_pem = rsa_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CaError::Crypto(format!("failed to encode CA key: {e}")))?;
        let key_pair = KeyPair::from_pem(&key_pem)?;

        let now = OffsetDateTime::now_utc();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, CA_ORGANIZATION);
        params.key_usages.push(KeyUsagePurpose::KeyCertSign);
        params.key_usages.push(KeyUsagePurpose::CrlSign);
        params.serial_number = Some(random_serial());
        params.not_before = now;
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let cert = params.self_signed(&key_pair)?;
        let cert_pem = cert.pem();
        let cert_der = cert.der().to_vec();

        if let Some(dir) = cert_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(cert_path, &cert_pem)?;
        std::fs::write(key_path, key_pem.as_bytes())?;
        restrict_key_permissions(key_path)?;

        info!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            bits = opts.key_bits,
            "Generated new slave CA"
        );

        Ok(Self {
            issuer: Issuer::new(params, key_pair),
            cert_pem,
            cert_der,
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
        })
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;

        let key_pair = if key_pem.contains("BEGIN RSA PRIVATE KEY") {
            // PKCS#1 keys are re-encoded as PKCS#8 for the signer.
            let rsa_key = RsaPrivateKey::from_pkcs1_pem(&key_pem)
                .map_err(|e| CaError::Crypto(format!("failed to parse CA key: {e}")))?;
            let pkcs8 = rsa_key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| CaError::Crypto(format!("failed to encode CA key: {e}")))?;
            KeyPair::from_pem(&pkcs8)?
        } else {
            KeyPair::from_pem(&key_pem)?
        };

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)?;
        let cert_der = pem_to_der(&cert_pem)
            .map_err(|e| CaError::Crypto(format!("failed to decode CA certificate: {e}")))?;

        info!(cert = %cert_path.display(), "Loaded slave CA");

        Ok(Self {
            issuer,
            cert_pem,
            cert_der,
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
        })
    }

    /// PEM-encoded CA certificate, handed to slaves at pairing time.
    pub fn ca_cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// DER-encoded CA certificate, used as the TLS client trust anchor.
    pub fn ca_cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Paths of the CA certificate and key files.
    pub fn paths(&self) -> (&Path, &Path) {
        (&self.cert_path, &self.key_path)
    }

    /// Sign a PEM-encoded CSR into a client certificate for `host_id`.
    ///
    /// The CSR's self-signature must verify. Whatever subject the CSR asks
    /// for, the issued certificate's CN is `host_id`.
    pub fn sign_csr(
        &self,
        csr_pem: &str,
        host_id: &str,
        valid_days: u32,
    ) -> Result<SignedCertificate, CaError> {
        let csr_der = pem_to_der(csr_pem).map_err(CaError::InvalidCsr)?;
        let (_, csr) = X509CertificationRequest::from_der(&csr_der)
            .map_err(|e| CaError::InvalidCsr(format!("failed to parse CSR: {e}")))?;
        csr.verify_signature()
            .map_err(|e| CaError::InvalidCsr(format!("invalid CSR signature: {e}")))?;

        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| CaError::InvalidCsr(e.to_string()))?;

        let now = OffsetDateTime::now_utc();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host_id);
        csr.params.distinguished_name = dn;
        csr.params.subject_alt_names.clear();
        csr.params.is_ca = IsCa::NoCa;
        csr.params.serial_number = Some(random_serial());
        csr.params.not_before = now;
        csr.params.not_after = now + Duration::days(i64::from(valid_days));
        csr.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        csr.params.use_authority_key_identifier_extension = true;

        let cert = csr.signed_by(&self.issuer)?;
        let serial = serial_hex(cert.der())?;

        info!(host_id, serial = %serial, valid_days, "Signed slave certificate");

        Ok(SignedCertificate {
            cert_pem: cert.pem(),
            serial,
            not_before: now.unix_timestamp(),
            not_after: (now + Duration::days(i64::from(valid_days))).unix_timestamp(),
        })
    }

    /// Verify a PEM-encoded client certificate against this CA.
    pub fn verify_client_cert(&self, cert_pem: &str) -> Result<VerifiedClient, CaError> {
        let der = pem_to_der(cert_pem).map_err(CaError::VerificationFailed)?;
        self.verify_client_cert_der(&der)
    }

    /// Verify a DER-encoded client certificate against this CA.
    pub fn verify_client_cert_der(&self, der: &[u8]) -> Result<VerifiedClient, CaError> {
        self.verify_client_cert_der_at(der, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify a DER-encoded client certificate as of `now` (Unix seconds).
    pub fn verify_client_cert_der_at(
        &self,
        der: &[u8],
        now: i64,
    ) -> Result<VerifiedClient, CaError> {
        let (_, ca) = X509Certificate::from_der(&self.cert_der)
            .map_err(|e| CaError::Crypto(format!("failed to parse CA certificate: {e}")))?;
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| CaError::VerificationFailed(format!("malformed certificate: {e}")))?;

        if cert.issuer().as_raw() != ca.subject().as_raw() {
            return Err(CaError::VerificationFailed(
                "certificate not issued by this CA".into(),
            ));
        }
        cert.verify_signature(Some(ca.public_key()))
            .map_err(|e| CaError::VerificationFailed(format!("bad signature: {e}")))?;

        let client_auth = cert
            .extended_key_usage()
            .map_err(|e| CaError::VerificationFailed(e.to_string()))?
            .is_some_and(|eku| eku.value.client_auth);
        if !client_auth {
            return Err(CaError::VerificationFailed(
                "certificate lacks ClientAuth usage".into(),
            ));
        }

        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        if now < not_before {
            return Err(CaError::NotYetValid);
        }
        if now > not_after {
            return Err(CaError::Expired);
        }

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .ok_or_else(|| CaError::VerificationFailed("certificate has no CN".into()))?
            .to_string();

        Ok(VerifiedClient {
            common_name,
            serial: cert.tbs_certificate.serial.to_str_radix(16),
            not_before,
            not_after,
        })
    }

    /// Issue the master's TLS server certificate for `server_names`
    /// (DNS names or IP addresses), signed by this CA.
    pub fn issue_server_cert(&self, server_names: &[String]) -> Result<ServerCertificate, CaError> {
        let mut params = CertificateParams::new(server_names.to_vec())?;
        params
            .distinguished_name
            .push(DnType::CommonName, "Outpost Master");
        params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ServerAuth);
        params.serial_number = Some(random_serial());

        let server_key = KeyPair::generate()?;
        let server_cert = params.signed_by(&server_key, &self.issuer)?;

        Ok(ServerCertificate {
            cert_pem: server_cert.pem(),
            key_pem: server_key.serialize_pem(),
        })
    }
}

/// Canonical serial rendering of a DER certificate: lowercase hex, no
/// leading zeros, no separators.
pub fn serial_hex(der: &[u8]) -> Result<String, CaError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| CaError::VerificationFailed(format!("malformed certificate: {e}")))?;
    Ok(cert.tbs_certificate.serial.to_str_radix(16))
}

/// Restrict a private key file to owner read/write on Unix.
pub fn restrict_key_permissions(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// 128 random bits with the top bit cleared so the DER integer stays positive.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>, String> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| format!("failed to decode PEM: {e}"))?;
    Ok(parsed.contents)
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::needless_pass_by_value
)]
mod tests {
    use super::*;
    use crate::csr::generate_csr;

    const TEST_OPTS: CaOptions = CaOptions { key_bits: 2048 };

    fn test_ca() -> (tempfile::TempDir, CertificateAuthority) {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(dir.path(), TEST_OPTS).unwrap();
        (dir, ca)
    }

    #[test]
    fn generate_writes_ca_files() {
        let (dir, ca) = test_ca();
        assert!(dir.path().join(CA_CERT_FILE).exists());
        assert!(dir.path().join(CA_KEY_FILE).exists());
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join(CA_KEY_FILE))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn reload_keeps_same_ca() {
        let (dir, ca) = test_ca();
        let reloaded = CertificateAuthority::load_or_generate(dir.path(), TEST_OPTS).unwrap();
        assert_eq!(ca.ca_cert_pem(), reloaded.ca_cert_pem());

        // Certificates signed before the reload still verify afterwards.
        let csr = generate_csr("slave-a").unwrap();
        let signed = ca.sign_csr(&csr.csr_pem, "slave-a", 365).unwrap();
        let verified = reloaded.verify_client_cert(&signed.cert_pem).unwrap();
        assert_eq!(verified.common_name, "slave-a");

        // And the reloaded CA can still sign.
        let signed2 = reloaded.sign_csr(&csr.csr_pem, "slave-a", 365).unwrap();
        ca.verify_client_cert(&signed2.cert_pem).unwrap();
    }

    #[test]
    fn reload_accepts_pkcs1_key() {
        use rsa::pkcs1::EncodeRsaPrivateKey;
        use rsa::pkcs8::DecodePrivateKey;

        let (dir, ca) = test_ca();
        let key_path = dir.path().join(CA_KEY_FILE);
        let pkcs8 = std::fs::read_to_string(&key_path).unwrap();
        let rsa_key = RsaPrivateKey::from_pkcs8_pem(&pkcs8).unwrap();
        let pkcs1 = rsa_key.to_pkcs1_pem(LineEnding::LF).unwrap();
        std::fs::write(&key_path, pkcs1.as_bytes()).unwrap();

        let reloaded = CertificateAuthority::load_or_generate(dir.path(), TEST_OPTS).unwrap();
        let csr = generate_csr("slave-b").unwrap();
        let signed = reloaded.sign_csr(&csr.csr_pem, "slave-b", 30).unwrap();
        assert_eq!(ca.verify_client_cert(&signed.cert_pem).unwrap().common_name, "slave-b");

        let server = reloaded
            .issue_server_cert(&["localhost".to_string()])
            .unwrap();
        assert!(server.cert_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn corrupt_key_fails_to_load() {
        let (dir, _ca) = test_ca();
        std::fs::write(dir.path().join(CA_KEY_FILE), "not a key").unwrap();
        let err = CertificateAuthority::load_or_generate(dir.path(), TEST_OPTS).unwrap_err();
        assert!(matches!(err, CaError::Crypto(_)));
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let (_dir, ca) = test_ca();
        let csr = generate_csr("slave-a").unwrap();
        let signed = ca.sign_csr(&csr.csr_pem, "slave-a", 365).unwrap();

        assert!(!signed.serial.is_empty());
        assert!(
            signed
                .serial
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        );
        assert_eq!(signed.not_after - signed.not_before, 365 * 86_400);

        let verified = ca.verify_client_cert(&signed.cert_pem).unwrap();
        assert_eq!(verified.common_name, "slave-a");
        assert_eq!(verified.serial, signed.serial);
    }

    #[test]
    fn cn_is_forced_to_host_id() {
        let (_dir, ca) = test_ca();
        let csr = generate_csr("something-else").unwrap();
        let signed = ca.sign_csr(&csr.csr_pem, "slave-b", 30).unwrap();
        let verified = ca.verify_client_cert(&signed.cert_pem).unwrap();
        assert_eq!(verified.common_name, "slave-b");
    }

    #[test]
    fn serials_are_unique() {
        let (_dir, ca) = test_ca();
        let csr = generate_csr("slave-a").unwrap();
        let a = ca.sign_csr(&csr.csr_pem, "slave-a", 30).unwrap();
        let b = ca.sign_csr(&csr.csr_pem, "slave-a", 30).unwrap();
        assert_ne!(a.serial, b.serial);
    }

    #[test]
    fn expired_and_not_yet_valid_are_rejected() {
        let (_dir, ca) = test_ca();
        let csr = generate_csr("slave-a").unwrap();
        let signed = ca.sign_csr(&csr.csr_pem, "slave-a", 1).unwrap();
        let der = pem_to_der(&signed.cert_pem).unwrap();

        let err = ca
            .verify_client_cert_der_at(&der, signed.not_after + 1)
            .unwrap_err();
        assert!(matches!(err, CaError::Expired));

        let err = ca
            .verify_client_cert_der_at(&der, signed.not_before - 1)
            .unwrap_err();
        assert!(matches!(err, CaError::NotYetValid));
    }

    #[test]
    fn garbage_csr_is_invalid() {
        let (_dir, ca) = test_ca();
        let err = ca.sign_csr("garbage", "slave-a", 30).unwrap_err();
        assert!(matches!(err, CaError::InvalidCsr(_)));
    }

    #[test]
    fn foreign_ca_certificate_fails_verification() {
        let (_dir, ca) = test_ca();
        let (_dir2, other) = test_ca();
        let csr = generate_csr("slave-a").unwrap();
        let signed = other.sign_csr(&csr.csr_pem, "slave-a", 30).unwrap();

        let err = ca.verify_client_cert(&signed.cert_pem).unwrap_err();
        assert!(matches!(err, CaError::VerificationFailed(_)));
    }

    #[test]
    fn server_cert_is_not_a_client_cert() {
        let (_dir, ca) = test_ca();
        let server = ca
            .issue_server_cert(&["localhost".to_string(), "127.0.0.1".to_string()])
            .unwrap();
        assert!(server.key_pem.contains("BEGIN PRIVATE KEY"));

        let err = ca.verify_client_cert(&server.cert_pem).unwrap_err();
        assert!(matches!(err, CaError::VerificationFailed(_)));
    }

    #[test]
    fn serial_hex_matches_issued_serial() {
        let (_dir, ca) = test_ca();
        let csr = generate_csr("slave-a").unwrap();
        let signed = ca.sign_csr(&csr.csr_pem, "slave-a", 30).unwrap();
        let der = pem_to_der(&signed.cert_pem).unwrap();
        assert_eq!(serial_hex(&der).unwrap(), signed.serial);
    }
}
