//! Shared setup for the server test modules.
//!
//! Builds an [`AppState`] over an in-memory database and the shared test CA,
//! and issues client certificates the way pairing does.
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use rustls::pki_types::CertificateDer;

use outpost_crypto::generate_csr;

use super::AppState;
use crate::pairing::{PairingOptions, PairingService};
use crate::registry::SlaveRegistry;
use crate::router::ToolRelay;
use crate::storage::{MasterDatabase, NewSlaveServer, SlaveStore};
use crate::test_helpers::{test_ca, test_db};
use crate::upstream::{ContextSource, NoUpstream, ToolRouter};

/// State with no upstream tools.
pub async fn test_state() -> (AppState, MasterDatabase) {
    test_state_with(Arc::new(NoUpstream), Arc::new(NoUpstream)).await
}

pub async fn test_state_with(
    upstream: Arc<dyn ToolRouter>,
    contexts: Arc<dyn ContextSource>,
) -> (AppState, MasterDatabase) {
    let db = test_db().await;
    let ca = test_ca();
    let store: Arc<dyn SlaveStore> = Arc::new(db.clone());
    let registry = Arc::new(SlaveRegistry::new());
    let relay = ToolRelay::new(Arc::clone(&registry), Duration::from_secs(5));
    let pairing = Arc::new(PairingService::new(
        Arc::clone(&ca),
        Arc::clone(&store),
        PairingOptions::default(),
    ));
    let state = AppState {
        ca,
        store,
        registry,
        relay,
        pairing,
        upstream,
        contexts,
        handshake_timeout: Duration::from_secs(5),
    };
    (state, db)
}

/// Sign a fresh certificate for `host_id` and return it with its serial.
pub fn issue_client_cert(state: &AppState, host_id: &str) -> (CertificateDer<'static>, String) {
    let csr = generate_csr(host_id).unwrap();
    let signed = state.ca.sign_csr(&csr.csr_pem, host_id, 30).unwrap();
    let der = rustls_pemfile::certs(&mut signed.cert_pem.as_bytes())
        .next()
        .unwrap()
        .unwrap();
    (der, signed.serial)
}

/// Persist `host_id` as paired with a freshly issued certificate.
pub async fn pair_slave(
    state: &AppState,
    db: &MasterDatabase,
    host_id: &str,
) -> (CertificateDer<'static>, String) {
    let (der, serial) = issue_client_cert(state, host_id);
    db.create_slave_server(&NewSlaveServer {
        host_id,
        cert_serial: &serial,
        platform: "linux",
        issued_at: 0,
        expires_at: i64::MAX,
    })
    .await
    .unwrap();
    (der, serial)
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}
