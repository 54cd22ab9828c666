//! `Outpost` Certificate Authority
//!
//! The master runs a private CA that issues client certificates to paired
//! slaves. Slaves authenticate every connection with that certificate; the
//! certificate's Common Name is the slave's identity.
//!
//! - **CA**: RSA root, 10-year validity, stored as PEM in the master's data dir
//! - **Leaf**: client certificates with `ClientAuth` EKU and a random 128-bit serial
//! - **Server**: the master's own TLS certificate, signed by the same root

pub mod ca;
pub mod csr;
pub mod error;

pub use ca::{
    CA_CERT_FILE, CA_KEY_FILE, CaOptions, CertificateAuthority, ServerCertificate,
    SignedCertificate, VerifiedClient, serial_hex,
};
pub use csr::{GeneratedCsr, generate_csr};
pub use error::CaError;
