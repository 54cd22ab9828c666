//! HTTP and WebSocket surface of the master.
//!
//! - `GET /slave/connect`: WebSocket for paired slaves, authenticated by
//!   the client certificate presented during the TLS handshake
//! - `POST /pair`: open a pairing request
//! - `GET /pair/{code}`: poll a pairing request

pub mod connect;
pub mod heartbeat;
pub mod pair;
mod session;

#[cfg(test)]
mod session_tests;
#[cfg(test)]
mod test_helpers;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};

use outpost_crypto::CertificateAuthority;

use crate::pairing::PairingService;
use crate::registry::SlaveRegistry;
use crate::router::ToolRelay;
use crate::storage::SlaveStore;
use crate::upstream::{ContextSource, ToolRouter};

pub use connect::{AuthRejection, SlaveIdentity, authorize_peer};
pub use heartbeat::{HeartbeatMonitor, SweepReport};

/// How often the heartbeat monitor runs.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// A slave silent for longer than this is evicted.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(120);
/// Time a new connection has to send `register`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub ca: Arc<CertificateAuthority>,
    pub store: Arc<dyn SlaveStore>,
    pub registry: Arc<SlaveRegistry>,
    pub relay: ToolRelay,
    pub pairing: Arc<PairingService>,
    pub upstream: Arc<dyn ToolRouter>,
    pub contexts: Arc<dyn ContextSource>,
    pub handshake_timeout: Duration,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/slave/connect", get(connect::slave_connect))
        .route("/pair", post(pair::create_pairing))
        .route("/pair/{code}", get(pair::pairing_status))
        .with_state(state)
}
