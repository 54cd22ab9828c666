//! Shared fixtures for unit tests across the master crate.
#![allow(clippy::unwrap_used)]

use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, watch};

use outpost_crypto::{CaOptions, CertificateAuthority};
use outpost_proto::{Envelope, Tool};

use crate::registry::{ConnectionHandle, SlaveRegistry};
use crate::storage::{MasterDatabase, NewSlaveServer, SlaveStore};

static CA: OnceLock<(tempfile::TempDir, Arc<CertificateAuthority>)> = OnceLock::new();

/// One CA per test binary; RSA generation is too slow to repeat per test.
pub fn test_ca() -> Arc<CertificateAuthority> {
    let (_, ca) = CA.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(dir.path(), CaOptions { key_bits: 2048 })
            .unwrap();
        (dir, Arc::new(ca))
    });
    Arc::clone(ca)
}

pub async fn test_db() -> MasterDatabase {
    MasterDatabase::open_in_memory().await.unwrap()
}

/// Persist an enabled slave row for `host_id` with `serial` as its active serial.
pub async fn seed_slave(db: &MasterDatabase, host_id: &str, serial: &str) {
    db.create_slave_server(&NewSlaveServer {
        host_id,
        cert_serial: serial,
        platform: "linux",
        issued_at: 0,
        expires_at: i64::MAX,
    })
    .await
    .unwrap();
}

/// Register `hostname` in `registry` over an mpsc-backed handle, returning
/// the slave's end of the writer channel and the close signal.
pub async fn connect_slave(
    registry: &SlaveRegistry,
    hostname: &str,
    tools: Vec<Tool>,
) -> (mpsc::Receiver<Envelope>, watch::Receiver<bool>) {
    let (tx, rx) = mpsc::channel(32);
    let (handle, closed) = ConnectionHandle::new(hostname, "01", tx);
    registry.connect(hostname, tools, "1.0.0", handle).await;
    (rx, closed)
}
