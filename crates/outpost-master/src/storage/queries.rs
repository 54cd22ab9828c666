//! sqlx implementation of [`SlaveStore`] for the master database.

use async_trait::async_trait;
use uuid::Uuid;

use outpost_core::db::unix_timestamp;
use outpost_proto::PairingStatus;

use super::db::MasterDatabase;
use super::models::{NewSlaveServer, PairingRequest, RevokedCredential, SlaveServer};
use super::store::SlaveStore;
use outpost_core::DatabaseError;

#[async_trait]
impl SlaveStore for MasterDatabase {
    // =========================================================================
    // Slave queries
    // =========================================================================

    async fn create_slave_server(
        &self,
        slave: &NewSlaveServer<'_>,
    ) -> Result<SlaveServer, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO slave_servers \
             (id, host_id, cert_serial, platform, issued_at, expires_at, enabled, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?) \
             ON CONFLICT(host_id) DO UPDATE SET \
             cert_serial = excluded.cert_serial, \
             platform = excluded.platform, \
             issued_at = excluded.issued_at, \
             expires_at = excluded.expires_at, \
             enabled = 1, \
             updated_at = excluded.updated_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(slave.host_id)
        .bind(slave.cert_serial)
        .bind(slave.platform)
        .bind(slave.issued_at)
        .bind(slave.expires_at)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_slave_server_by_host_id(slave.host_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Slave {}", slave.host_id)))
    }

    async fn get_slave_server_by_host_id(
        &self,
        host_id: &str,
    ) -> Result<Option<SlaveServer>, DatabaseError> {
        let slave = sqlx::query_as::<_, SlaveServer>("SELECT * FROM slave_servers WHERE host_id = ?")
            .bind(host_id)
            .fetch_optional(self.pool())
            .await?;

        Ok(slave)
    }

    async fn list_slave_servers(&self) -> Result<Vec<SlaveServer>, DatabaseError> {
        let slaves =
            sqlx::query_as::<_, SlaveServer>("SELECT * FROM slave_servers ORDER BY host_id")
                .fetch_all(self.pool())
                .await?;

        Ok(slaves)
    }

    async fn update_slave_last_seen(&self, host_id: &str) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();
        let result =
            sqlx::query("UPDATE slave_servers SET last_seen = ?, updated_at = ? WHERE host_id = ?")
                .bind(now)
                .bind(now)
                .bind(host_id)
                .execute(self.pool())
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_slave_version(
        &self,
        host_id: &str,
        version: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE slave_servers SET reported_version = ?, updated_at = ? WHERE host_id = ?",
        )
        .bind(version)
        .bind(unix_timestamp())
        .bind(host_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_slave_enabled(&self, host_id: &str, enabled: bool) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("UPDATE slave_servers SET enabled = ?, updated_at = ? WHERE host_id = ?")
                .bind(enabled)
                .bind(unix_timestamp())
                .bind(host_id)
                .execute(self.pool())
                .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Revocation queries
    // =========================================================================

    async fn revoke_slave_credential(
        &self,
        host_id: &str,
        cert_serial: &str,
        reason: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO revoked_slave_credentials \
             (id, host_id, cert_serial, revoked_at, reason) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(host_id)
        .bind(cert_serial)
        .bind(unix_timestamp())
        .bind(reason)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn is_credential_revoked(&self, cert_serial: &str) -> Result<bool, DatabaseError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM revoked_slave_credentials WHERE cert_serial = ?")
                .bind(cert_serial)
                .fetch_optional(self.pool())
                .await?;

        Ok(row.is_some())
    }

    async fn list_revoked_credentials(&self) -> Result<Vec<RevokedCredential>, DatabaseError> {
        let revoked = sqlx::query_as::<_, RevokedCredential>(
            "SELECT * FROM revoked_slave_credentials ORDER BY revoked_at DESC, host_id",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(revoked)
    }

    // =========================================================================
    // Pairing queries
    // =========================================================================

    async fn create_pairing_request(&self, request: &PairingRequest) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO pairing_requests \
             (id, host_id, pairing_code, csr, platform, requested_at, expires_at, status, certificate) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id)
        .bind(&request.host_id)
        .bind(&request.pairing_code)
        .bind(&request.csr)
        .bind(&request.platform)
        .bind(request.requested_at)
        .bind(request.expires_at)
        .bind(&request.status)
        .bind(&request.certificate)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn get_pairing_request(
        &self,
        pairing_code: &str,
    ) -> Result<Option<PairingRequest>, DatabaseError> {
        let request = sqlx::query_as::<_, PairingRequest>(
            "SELECT * FROM pairing_requests WHERE pairing_code = ?",
        )
        .bind(pairing_code)
        .fetch_optional(self.pool())
        .await?;

        Ok(request)
    }

    async fn list_pending_pairing_requests(&self) -> Result<Vec<PairingRequest>, DatabaseError> {
        let requests = sqlx::query_as::<_, PairingRequest>(
            "SELECT * FROM pairing_requests WHERE status = 'pending' ORDER BY requested_at",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(requests)
    }

    async fn update_pairing_request_approved(
        &self,
        pairing_code: &str,
        certificate: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pairing_requests SET status = 'approved', certificate = ? \
             WHERE pairing_code = ? AND status = 'pending'",
        )
        .bind(certificate)
        .bind(pairing_code)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_pairing_request_status(
        &self,
        pairing_code: &str,
        status: PairingStatus,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pairing_requests SET status = ? WHERE pairing_code = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(pairing_code)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cleanup_expired_pairing_requests(&self, now: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pairing_requests SET status = 'expired' WHERE status = 'pending' AND expires_at < ?",
        )
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }
}
