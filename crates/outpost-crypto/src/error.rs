//! Certificate authority error types.

/// Errors from CA operations.
#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid CSR: {0}")]
    InvalidCsr(String),

    #[error("Certificate expired")]
    Expired,

    #[error("Certificate not yet valid")]
    NotYetValid,

    #[error("Certificate verification failed: {0}")]
    VerificationFailed(String),
}

impl From<rcgen::Error> for CaError {
    fn from(e: rcgen::Error) -> Self {
        Self::Crypto(e.to_string())
    }
}
