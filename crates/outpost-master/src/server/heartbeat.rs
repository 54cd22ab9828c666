//! Periodic liveness and revocation sweep over live connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::SlaveRegistry;
use crate::router::ToolRelay;
use crate::storage::SlaveStore;

/// Hosts closed by one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub stale: Vec<String>,
    pub revoked: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.revoked.is_empty()
    }
}

pub struct HeartbeatMonitor {
    registry: Arc<SlaveRegistry>,
    relay: ToolRelay,
    store: Arc<dyn SlaveStore>,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<SlaveRegistry>,
        relay: ToolRelay,
        store: Arc<dyn SlaveStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            relay,
            store,
            timeout,
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    /// Evict slaves silent for longer than the timeout as of `now`, then
    /// close connections whose certificate has been revoked since they
    /// authenticated.
    pub async fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for (hostname, connection_id) in self.registry.stale_since(now, self.timeout).await {
            if self.close_connection(&hostname, connection_id).await {
                warn!(hostname, timeout_secs = self.timeout.as_secs(), "Slave heartbeat timed out");
                report.stale.push(hostname);
            }
        }

        for snapshot in self.registry.snapshots().await {
            match self.store.is_credential_revoked(&snapshot.cert_serial).await {
                Ok(false) => {}
                Ok(true) => {
                    if self
                        .close_connection(&snapshot.hostname, snapshot.connection_id)
                        .await
                    {
                        warn!(hostname = %snapshot.hostname, serial = %snapshot.cert_serial, "Closing connection with revoked certificate");
                        report.revoked.push(snapshot.hostname);
                    }
                }
                Err(e) => {
                    warn!(hostname = %snapshot.hostname, error = %e, "Revocation check failed");
                }
            }
        }

        report
    }

    /// Evict one inspected connection and fail its calls. A reconnect that
    /// replaced it in the meantime is left alone.
    async fn close_connection(&self, hostname: &str, connection_id: Uuid) -> bool {
        if !self.registry.release(hostname, connection_id).await {
            return false;
        }
        self.relay.fail_pending_on(connection_id);
        true
    }

    /// Sweep every `period` until `shutdown` flips.
    pub async fn run(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // Skip first immediate tick
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sweep().await;
                    if !report.is_empty() {
                        info!(stale = report.stale.len(), revoked = report.revoked.len(), "Heartbeat sweep closed connections");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Heartbeat monitor stopped");
    }
}
