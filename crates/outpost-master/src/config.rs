//! Runtime configuration of the master.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::pairing::{CERT_VALIDITY_DAYS, PAIRING_TTL, SWEEP_INTERVAL};
use crate::router::DEFAULT_CALL_TIMEOUT;
use crate::server::{HANDSHAKE_TIMEOUT, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8765";
const DB_FILE: &str = "master.db";

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub listen_addr: SocketAddr,
    /// Holds the CA files and, unless overridden, the database.
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// DNS names and IP literals for the master's own TLS certificate.
    pub server_names: Vec<String>,
    pub relay_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub handshake_timeout: Duration,
    pub pairing_ttl: Duration,
    pub pairing_sweep_interval: Duration,
    pub cert_validity_days: u32,
    pub ca_key_bits: usize,
}

impl MasterConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            db_path: data_dir.join(DB_FILE),
            data_dir,
            ..Self::default()
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8765)),
            db_path: data_dir.join(DB_FILE),
            data_dir,
            server_names: vec!["localhost".into(), "127.0.0.1".into()],
            relay_timeout: DEFAULT_CALL_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            pairing_ttl: PAIRING_TTL,
            pairing_sweep_interval: SWEEP_INTERVAL,
            cert_validity_days: CERT_VALIDITY_DAYS,
            ca_key_bits: outpost_crypto::CaOptions::default().key_bits,
        }
    }
}

/// `~/.outpost`, or `.outpost` in the working directory when there is no home.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir().map_or_else(|| PathBuf::from(".outpost"), |home| home.join(".outpost"))
}
