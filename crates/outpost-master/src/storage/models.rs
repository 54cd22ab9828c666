//! Data models for master storage.

use serde::{Deserialize, Serialize};

use outpost_proto::PairingStatus;

/// A paired slave and its single active certificate.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SlaveServer {
    pub id: String,
    pub host_id: String,
    pub cert_serial: String,
    pub platform: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub last_seen: Option<i64>,
    pub enabled: bool,
    pub reported_version: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Parameters for creating (or re-pairing) a slave.
#[derive(Debug, Clone, Copy)]
pub struct NewSlaveServer<'a> {
    pub host_id: &'a str,
    pub cert_serial: &'a str,
    pub platform: &'a str,
    pub issued_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RevokedCredential {
    pub id: String,
    pub host_id: String,
    pub cert_serial: String,
    pub revoked_at: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PairingRequest {
    pub id: String,
    pub host_id: String,
    pub pairing_code: String,
    pub csr: String,
    pub platform: String,
    pub requested_at: i64,
    pub expires_at: i64,
    pub status: String,
    pub certificate: Option<String>,
}

impl PairingRequest {
    /// Parsed status. Unrecognised text reads as expired so it can never
    /// yield a certificate.
    pub fn status(&self) -> PairingStatus {
        self.status.parse().unwrap_or(PairingStatus::Expired)
    }

    pub const fn is_expired_at(&self, now: i64) -> bool {
        now > self.expires_at
    }
}
