//! The persistence contract used by pairing, authentication and management.

use async_trait::async_trait;

use outpost_core::DatabaseError;
use outpost_proto::PairingStatus;

use super::models::{NewSlaveServer, PairingRequest, RevokedCredential, SlaveServer};

/// Storage for slaves, pairing requests and revocations.
///
/// Status updates on pairing requests only apply to rows that are still
/// pending; terminal rows are immutable.
#[async_trait]
pub trait SlaveStore: Send + Sync {
    /// Insert a slave, or overwrite serial and validity of an existing one
    /// (re-pairing). The row is (re-)enabled either way.
    async fn create_slave_server(
        &self,
        slave: &NewSlaveServer<'_>,
    ) -> Result<SlaveServer, DatabaseError>;

    async fn get_slave_server_by_host_id(
        &self,
        host_id: &str,
    ) -> Result<Option<SlaveServer>, DatabaseError>;

    async fn list_slave_servers(&self) -> Result<Vec<SlaveServer>, DatabaseError>;

    async fn update_slave_last_seen(&self, host_id: &str) -> Result<bool, DatabaseError>;

    async fn update_slave_version(&self, host_id: &str, version: &str)
    -> Result<bool, DatabaseError>;

    async fn set_slave_enabled(&self, host_id: &str, enabled: bool) -> Result<bool, DatabaseError>;

    /// Append to the revocation log. Returns `false` if the serial was
    /// already revoked.
    async fn revoke_slave_credential(
        &self,
        host_id: &str,
        cert_serial: &str,
        reason: &str,
    ) -> Result<bool, DatabaseError>;

    async fn is_credential_revoked(&self, cert_serial: &str) -> Result<bool, DatabaseError>;

    async fn list_revoked_credentials(&self) -> Result<Vec<RevokedCredential>, DatabaseError>;

    async fn create_pairing_request(&self, request: &PairingRequest) -> Result<(), DatabaseError>;

    async fn get_pairing_request(
        &self,
        pairing_code: &str,
    ) -> Result<Option<PairingRequest>, DatabaseError>;

    async fn list_pending_pairing_requests(&self) -> Result<Vec<PairingRequest>, DatabaseError>;

    async fn update_pairing_request_approved(
        &self,
        pairing_code: &str,
        certificate: &str,
    ) -> Result<bool, DatabaseError>;

    async fn update_pairing_request_status(
        &self,
        pairing_code: &str,
        status: PairingStatus,
    ) -> Result<bool, DatabaseError>;

    /// Mark pending requests whose expiry is before `now` as expired.
    async fn cleanup_expired_pairing_requests(&self, now: i64) -> Result<u64, DatabaseError>;
}
