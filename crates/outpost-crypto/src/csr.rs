//! Slave-side CSR generation.

use rcgen::{CertificateParams, DnType, KeyPair};

use crate::error::CaError;

/// A fresh key pair and the PEM CSR derived from it.
pub struct GeneratedCsr {
    /// PEM-encoded PKCS#10 request.
    pub csr_pem: String,
    /// PEM-encoded PKCS#8 private key. Stays on the slave.
    pub key_pem: String,
}

/// Generate a key pair and a CSR with `host_id` as the Common Name.
pub fn generate_csr(host_id: &str) -> Result<GeneratedCsr, CaError> {
    let key_pair = KeyPair::generate()?;

    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, host_id);

    let csr = params.serialize_request(&key_pair)?;

    Ok(GeneratedCsr {
        csr_pem: csr.pem()?,
        key_pem: key_pair.serialize_pem(),
    })
}
