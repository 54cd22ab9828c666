//! rustls configuration for the slave listener.
//!
//! The server certificate is issued by the slave CA at startup. Client
//! certificates are optional at the TLS layer so that unpaired slaves can
//! reach the pairing routes; a certificate that is presented must chain to
//! the slave CA.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::info;

use outpost_crypto::CertificateAuthority;

const HTTP11_ALPN: &[u8] = b"http/1.1";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsConfigError::Pem(e.to_string()))
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| TlsConfigError::Pem(e.to_string()))?
        .ok_or_else(|| TlsConfigError::Pem("no private key found".into()))
}

fn ca_roots(ca_cert_der: &[u8]) -> Result<RootCertStore, TlsConfigError> {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca_cert_der.to_vec()))
        .map_err(|e| TlsConfigError::Rustls(e.to_string()))?;
    Ok(roots)
}

/// Build the listener's server config: a CA-issued certificate for
/// `server_names`, TLS 1.2+, and optional client certificates verified
/// against the CA.
pub fn server_tls_config(
    ca: &CertificateAuthority,
    server_names: &[String],
) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let server = ca
        .issue_server_cert(server_names)
        .map_err(|e| TlsConfigError::CertGeneration(e.to_string()))?;

    let mut chain = parse_certs(&server.cert_pem)?;
    chain.push(CertificateDer::from(ca.ca_cert_der().to_vec()));
    let key = parse_key(&server.key_pem)?;

    let provider = provider();
    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(ca_roots(ca.ca_cert_der())?), Arc::clone(&provider))
            .allow_unauthenticated()
            .build()
            .map_err(|e| TlsConfigError::Rustls(e.to_string()))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsConfigError::Rustls(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|e| TlsConfigError::Rustls(e.to_string()))?;
    // WebSocket upgrades need HTTP/1.1.
    config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];

    info!(names = ?server_names, "Slave listener TLS configured");
    Ok(Arc::new(config))
}

/// Client config for a slave: trusts only the slave CA and presents the
/// given certificate when one is supplied.
pub fn client_tls_config(
    ca_cert_pem: &str,
    identity: Option<(&str, &str)>,
) -> Result<Arc<ClientConfig>, TlsConfigError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(ca_cert_pem)? {
        roots
            .add(cert)
            .map_err(|e| TlsConfigError::Rustls(e.to_string()))?;
    }

    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsConfigError::Rustls(e.to_string()))?
        .with_root_certificates(roots);

    let mut config = match identity {
        Some((cert_pem, key_pem)) => builder
            .with_client_auth_cert(parse_certs(cert_pem)?, parse_key(key_pem)?)
            .map_err(|e| TlsConfigError::Rustls(e.to_string()))?,
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];
    Ok(Arc::new(config))
}

/// TLS configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("Certificate generation error: {0}")]
    CertGeneration(String),

    #[error("PEM error: {0}")]
    Pem(String),

    #[error("rustls error: {0}")]
    Rustls(String),
}
