//! Certificate authentication for `GET /slave/connect`.
//!
//! Every check runs before the upgrade, so a rejected slave gets a plain
//! HTTP status instead of a WebSocket that closes immediately.

use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{error, info, warn};

use outpost_core::DatabaseError;

use super::AppState;
use super::session::run_socket;
use crate::tls::PeerCertificate;

/// An authenticated slave: certificate CN and serial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveIdentity {
    pub hostname: String,
    pub serial: String,
}

/// Why a connect attempt was refused.
#[derive(Debug, thiserror::Error)]
pub enum AuthRejection {
    #[error("client certificate required")]
    MissingCertificate,

    #[error("invalid client certificate: {0}")]
    InvalidCertificate(String),

    #[error("unknown slave: {0}")]
    UnknownSlave(String),

    #[error("certificate revoked: {0}")]
    Revoked(String),

    #[error("slave disabled: {0}")]
    Disabled(String),

    /// A valid certificate that re-pairing has since replaced.
    #[error("certificate superseded: {0}")]
    SupersededCertificate(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthRejection {
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MissingCertificate | Self::InvalidCertificate(_) => StatusCode::UNAUTHORIZED,
            Self::UnknownSlave(_) => StatusCode::NOT_FOUND,
            Self::Revoked(_) | Self::Disabled(_) | Self::SupersededCertificate(_) => {
                StatusCode::FORBIDDEN
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DatabaseError> for AuthRejection {
    fn from(e: DatabaseError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        (status, message).into_response()
    }
}

/// Authenticate the peer leaf `der` as a paired slave.
///
/// The CN is the identity. The slave must be known and enabled, neither its
/// active serial nor the presented one may be revoked, and the presented
/// serial must be the active one.
pub async fn authorize_peer(
    state: &AppState,
    der: Option<&[u8]>,
) -> Result<SlaveIdentity, AuthRejection> {
    let der = der.ok_or(AuthRejection::MissingCertificate)?;
    let verified = state
        .ca
        .verify_client_cert_der(der)
        .map_err(|e| AuthRejection::InvalidCertificate(e.to_string()))?;
    let hostname = verified.common_name;

    let slave = state
        .store
        .get_slave_server_by_host_id(&hostname)
        .await?
        .ok_or_else(|| AuthRejection::UnknownSlave(hostname.clone()))?;

    for serial in [&slave.cert_serial, &verified.serial] {
        if state.store.is_credential_revoked(serial).await? {
            return Err(AuthRejection::Revoked(serial.clone()));
        }
    }
    if !slave.enabled {
        return Err(AuthRejection::Disabled(hostname));
    }
    if verified.serial != slave.cert_serial {
        return Err(AuthRejection::SupersededCertificate(verified.serial));
    }

    Ok(SlaveIdentity {
        hostname,
        serial: verified.serial,
    })
}

/// `GET /slave/connect`
pub async fn slave_connect(
    State(state): State<AppState>,
    PeerCertificate(peer): PeerCertificate,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match authorize_peer(&state, peer.as_deref()).await {
        Ok(identity) => identity,
        Err(rejection) => {
            match &rejection {
                AuthRejection::Internal(e) => error!(error = %e, "Slave authentication failed"),
                other => warn!(reason = %other, "Slave connection rejected"),
            }
            return rejection.into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    if let Err(e) = state.store.update_slave_last_seen(&identity.hostname).await {
        warn!(hostname = %identity.hostname, error = %e, "Failed to update last_seen");
    }
    info!(hostname = %identity.hostname, serial = %identity.serial, "Slave authenticated");

    ws.on_upgrade(move |socket| run_socket(socket, state, identity))
}
