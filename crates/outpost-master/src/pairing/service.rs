//! Human-approved enrollment of new slaves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use outpost_core::DatabaseError;
use outpost_core::db::unix_timestamp;
use outpost_crypto::CertificateAuthority;
use outpost_proto::PairingStatus;

use crate::storage::{NewSlaveServer, PairingRequest, SlaveStore};

/// Lifetime of a pairing code.
pub const PAIRING_TTL: Duration = Duration::from_secs(600);
/// Validity of certificates issued on approval.
pub const CERT_VALIDITY_DAYS: u32 = 365;
/// How often the background sweep expires stale requests.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const EVENT_CAPACITY: usize = 64;
const CODE_ATTEMPTS: usize = 5;
const REPAIR_REASON: &str = "re-paired";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingEventKind {
    New,
    Approved,
    Denied,
    Expired,
}

/// Broadcast whenever a pairing request changes state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingEvent {
    pub host_id: String,
    pub pairing_code: String,
    pub kind: PairingEventKind,
}

/// Material handed back to an approved slave.
#[derive(Debug, Clone)]
pub struct ApprovedPairing {
    pub certificate: String,
    pub ca_cert: String,
    pub serial: String,
    pub expires_at: i64,
}

/// What a polling slave is told about its code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingStatusView {
    pub status: PairingStatus,
    /// Present only when approved.
    pub certificate: Option<String>,
}

impl PairingStatusView {
    const fn bare(status: PairingStatus) -> Self {
        Self {
            status,
            certificate: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PairingOptions {
    pub ttl: Duration,
    pub cert_validity_days: u32,
}

impl Default for PairingOptions {
    fn default() -> Self {
        Self {
            ttl: PAIRING_TTL,
            cert_validity_days: CERT_VALIDITY_DAYS,
        }
    }
}

/// Pairing requests cached in memory over the persisted store.
///
/// Every mutating operation holds the cache lock for its whole duration, so
/// approve, deny and expiry of one code are serialised.
pub struct PairingService {
    ca: Arc<CertificateAuthority>,
    store: Arc<dyn SlaveStore>,
    pending: Mutex<HashMap<String, PairingRequest>>,
    events: broadcast::Sender<PairingEvent>,
    opts: PairingOptions,
}

impl PairingService {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        store: Arc<dyn SlaveStore>,
        opts: PairingOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ca,
            store,
            pending: Mutex::new(HashMap::new()),
            events,
            opts,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.events.subscribe()
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    /// Reload persisted pending requests into the cache. Requests that
    /// expired while the master was down are marked expired instead.
    pub async fn restore(&self) -> Result<usize, PairingError> {
        self.restore_at(unix_timestamp()).await
    }

    pub async fn restore_at(&self, now: i64) -> Result<usize, PairingError> {
        let rows = self.store.list_pending_pairing_requests().await?;
        let mut pending = self.pending.lock().await;
        let mut restored = 0;
        for row in rows {
            if row.is_expired_at(now) {
                self.store
                    .update_pairing_request_status(&row.pairing_code, PairingStatus::Expired)
                    .await?;
                continue;
            }
            pending.insert(row.pairing_code.clone(), row);
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "Restored pending pairing requests");
        }
        Ok(restored)
    }

    /// Open a pairing request for `host_id`.
    pub async fn create(
        &self,
        host_id: &str,
        csr: &str,
        platform: &str,
    ) -> Result<PairingRequest, PairingError> {
        self.create_at(host_id, csr, platform, unix_timestamp())
            .await
    }

    pub async fn create_at(
        &self,
        host_id: &str,
        csr: &str,
        platform: &str,
        now: i64,
    ) -> Result<PairingRequest, PairingError> {
        let mut pending = self.pending.lock().await;

        let existing = pending
            .values()
            .find(|req| req.host_id == host_id)
            .cloned();
        if let Some(existing) = existing {
            if !existing.is_expired_at(now) {
                return Err(PairingError::Conflict(host_id.to_string()));
            }
            self.expire(&mut pending, &existing).await?;
        }

        #[allow(clippy::cast_possible_wrap)]
        let ttl = self.opts.ttl.as_secs() as i64;

        for _ in 0..CODE_ATTEMPTS {
            let code = generate_pairing_code();
            if pending.contains_key(&code) {
                continue;
            }

            let request = PairingRequest {
                id: Uuid::new_v4().to_string(),
                host_id: host_id.to_string(),
                pairing_code: code.clone(),
                csr: csr.to_string(),
                platform: platform.to_string(),
                requested_at: now,
                expires_at: now + ttl,
                status: PairingStatus::Pending.as_str().to_string(),
                certificate: None,
            };

            match self.store.create_pairing_request(&request).await {
                Ok(()) => {}
                Err(DatabaseError::Conflict(_)) => {
                    debug!(code, "Pairing code collided with a stored request");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            pending.insert(code.clone(), request.clone());
            info!(host_id, pairing_code = %code, platform, "Pairing request created");
            self.emit(host_id, &code, PairingEventKind::New);
            return Ok(request);
        }

        Err(PairingError::Storage(DatabaseError::Conflict(
            "could not allocate a unique pairing code".into(),
        )))
    }

    /// Approve `code` for `host_id`, sign its CSR and record the slave.
    pub async fn approve(&self, host_id: &str, code: &str) -> Result<ApprovedPairing, PairingError> {
        self.approve_at(host_id, code, unix_timestamp()).await
    }

    pub async fn approve_at(
        &self,
        host_id: &str,
        code: &str,
        now: i64,
    ) -> Result<ApprovedPairing, PairingError> {
        let mut pending = self.pending.lock().await;
        let request = self.open_request(&mut pending, host_id, code, now).await?;

        let signed = self
            .ca
            .sign_csr(&request.csr, host_id, self.opts.cert_validity_days)
            .map_err(|e| PairingError::Signing(e.to_string()))?;

        if let Some(previous) = self.store.get_slave_server_by_host_id(host_id).await? {
            if previous.cert_serial != signed.serial {
                self.store
                    .revoke_slave_credential(host_id, &previous.cert_serial, REPAIR_REASON)
                    .await?;
                info!(host_id, old_serial = %previous.cert_serial, "Revoked previous certificate on re-pairing");
            }
        }

        self.store
            .create_slave_server(&NewSlaveServer {
                host_id,
                cert_serial: &signed.serial,
                platform: &request.platform,
                issued_at: signed.not_before,
                expires_at: signed.not_after,
            })
            .await?;

        if !self
            .store
            .update_pairing_request_approved(code, &signed.cert_pem)
            .await?
        {
            warn!(host_id, pairing_code = code, "Pairing row was no longer pending at approval");
        }

        pending.remove(code);
        info!(host_id, pairing_code = code, serial = %signed.serial, "Pairing approved");
        self.emit(host_id, code, PairingEventKind::Approved);

        Ok(ApprovedPairing {
            certificate: signed.cert_pem,
            ca_cert: self.ca.ca_cert_pem().to_string(),
            serial: signed.serial,
            expires_at: signed.not_after,
        })
    }

    /// Deny `code` for `host_id`.
    pub async fn deny(&self, host_id: &str, code: &str) -> Result<(), PairingError> {
        self.deny_at(host_id, code, unix_timestamp()).await
    }

    pub async fn deny_at(&self, host_id: &str, code: &str, now: i64) -> Result<(), PairingError> {
        let mut pending = self.pending.lock().await;
        self.open_request(&mut pending, host_id, code, now).await?;

        self.store
            .update_pairing_request_status(code, PairingStatus::Denied)
            .await?;
        pending.remove(code);
        info!(host_id, pairing_code = code, "Pairing denied");
        self.emit(host_id, code, PairingEventKind::Denied);
        Ok(())
    }

    /// Status of `code` as reported to a polling slave.
    pub async fn get_status(&self, code: &str) -> Result<PairingStatusView, PairingError> {
        self.get_status_at(code, unix_timestamp()).await
    }

    pub async fn get_status_at(
        &self,
        code: &str,
        now: i64,
    ) -> Result<PairingStatusView, PairingError> {
        let mut pending = self.pending.lock().await;

        if let Some(cached) = pending.get(code).cloned() {
            if cached.is_expired_at(now) {
                self.expire(&mut pending, &cached).await?;
                return Ok(PairingStatusView::bare(PairingStatus::Expired));
            }
            return match self.store.get_pairing_request(code).await? {
                Some(row) if row.status().is_terminal() => {
                    // Decided elsewhere, e.g. by the CLI against the same database.
                    pending.remove(code);
                    Ok(view_of(row))
                }
                _ => Ok(PairingStatusView::bare(PairingStatus::Pending)),
            };
        }

        let Some(row) = self.store.get_pairing_request(code).await? else {
            return Ok(PairingStatusView::bare(PairingStatus::NotFound));
        };
        if row.status() == PairingStatus::Pending {
            if row.is_expired_at(now) {
                self.expire(&mut pending, &row).await?;
                return Ok(PairingStatusView::bare(PairingStatus::Expired));
            }
            pending.insert(row.pairing_code.clone(), row);
            return Ok(PairingStatusView::bare(PairingStatus::Pending));
        }
        Ok(view_of(row))
    }

    /// Pending requests, oldest first.
    pub async fn pending_requests(&self) -> Vec<PairingRequest> {
        let mut requests: Vec<_> = self.pending.lock().await.values().cloned().collect();
        requests.sort_by_key(|req| req.requested_at);
        requests
    }

    /// Expire stale requests in memory and storage. Returns how many cached
    /// requests were expired.
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(unix_timestamp()).await
    }

    pub async fn sweep_expired_at(&self, now: i64) -> usize {
        let mut pending = self.pending.lock().await;
        let stale: Vec<_> = pending
            .values()
            .filter(|req| req.is_expired_at(now))
            .cloned()
            .collect();

        let mut expired = 0;
        for request in &stale {
            match self.expire(&mut pending, request).await {
                Ok(()) => expired += 1,
                Err(e) => warn!(pairing_code = %request.pairing_code, error = %e, "Failed to expire pairing request"),
            }
        }

        if let Err(e) = self.store.cleanup_expired_pairing_requests(now).await {
            warn!(error = %e, "Pairing cleanup query failed");
        }
        expired
    }

    /// Run [`Self::sweep_expired`] every `period` until `shutdown` flips.
    pub async fn run_sweeper(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // Skip first immediate tick
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let expired = self.sweep_expired().await;
                    if expired > 0 {
                        info!(expired, "Expired stale pairing requests");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Pairing sweeper stopped");
    }

    /// Validate that `code` is a live pending request for `host_id`.
    ///
    /// An expired request is marked expired before `Expired` is returned; a
    /// host mismatch has no side effects.
    async fn open_request(
        &self,
        pending: &mut HashMap<String, PairingRequest>,
        host_id: &str,
        code: &str,
        now: i64,
    ) -> Result<PairingRequest, PairingError> {
        let request = match pending.get(code) {
            Some(cached) => cached.clone(),
            None => match self.store.get_pairing_request(code).await? {
                Some(row) if row.status() == PairingStatus::Pending => row,
                _ => return Err(PairingError::NotFound(code.to_string())),
            },
        };

        if request.host_id != host_id {
            return Err(PairingError::HostMismatch {
                expected: request.host_id,
                actual: host_id.to_string(),
            });
        }

        if request.is_expired_at(now) {
            self.expire(pending, &request).await?;
            return Err(PairingError::Expired(code.to_string()));
        }

        // A cached request may have been consumed by another process.
        if let Some(row) = self.store.get_pairing_request(code).await? {
            if row.status().is_terminal() {
                pending.remove(code);
                return Err(PairingError::NotFound(code.to_string()));
            }
        }

        Ok(request)
    }

    async fn expire(
        &self,
        pending: &mut HashMap<String, PairingRequest>,
        request: &PairingRequest,
    ) -> Result<(), PairingError> {
        self.store
            .update_pairing_request_status(&request.pairing_code, PairingStatus::Expired)
            .await?;
        pending.remove(&request.pairing_code);
        info!(host_id = %request.host_id, pairing_code = %request.pairing_code, "Pairing request expired");
        self.emit(&request.host_id, &request.pairing_code, PairingEventKind::Expired);
        Ok(())
    }

    fn emit(&self, host_id: &str, code: &str, kind: PairingEventKind) {
        let _ = self.events.send(PairingEvent {
            host_id: host_id.to_string(),
            pairing_code: code.to_string(),
            kind,
        });
    }
}

fn view_of(row: PairingRequest) -> PairingStatusView {
    let status = row.status();
    PairingStatusView {
        status,
        certificate: (status == PairingStatus::Approved)
            .then_some(row.certificate)
            .flatten(),
    }
}

/// Six random digits in `100000..=999999`, rendered `DDD-DDD`.
pub fn generate_pairing_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(100_000..1_000_000);
    format!("{:03}-{:03}", n / 1000, n % 1000)
}

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("Pairing code not found: {0}")]
    NotFound(String),

    #[error("Pairing code belongs to {expected}, not {actual}")]
    HostMismatch { expected: String, actual: String },

    #[error("Pairing code expired: {0}")]
    Expired(String),

    #[error("A pairing request is already pending for {0}")]
    Conflict(String),

    #[error("Certificate signing failed: {0}")]
    Signing(String),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}
