//! Pairing routes. Reachable without a client certificate.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, info, warn};

use outpost_proto::{PairRequest, PairResponse, PairStatusResponse, PairingStatus};

use super::AppState;
use crate::pairing::PairingError;

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"success": false, "error": message.into()}))).into_response()
}

/// `POST /pair`
pub async fn create_pairing(
    State(state): State<AppState>,
    body: Result<Json<PairRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else {
        return error_response(StatusCode::BAD_REQUEST, "invalid request body");
    };
    if req.hostname.trim().is_empty() || req.csr.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "hostname and csr are required");
    }

    match state
        .pairing
        .create(&req.hostname, &req.csr, &req.platform)
        .await
    {
        Ok(request) => {
            info!(hostname = %req.hostname, pairing_code = %request.pairing_code, "Pairing initiated");
            Json(PairResponse {
                success: true,
                pairing_code: request.pairing_code,
            })
            .into_response()
        }
        Err(PairingError::Conflict(host)) => {
            warn!(hostname = %host, "Pairing request already pending");
            error_response(
                StatusCode::CONFLICT,
                format!("a pairing request is already pending for {host}"),
            )
        }
        Err(e) => {
            error!(hostname = %req.hostname, error = %e, "Failed to create pairing request");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to create pairing request")
        }
    }
}

/// `GET /pair/{code}`
pub async fn pairing_status(State(state): State<AppState>, Path(code): Path<String>) -> Response {
    match state.pairing.get_status(&code).await {
        Ok(view) => {
            let approved = view.status == PairingStatus::Approved;
            Json(PairStatusResponse {
                status: view.status,
                ca_cert: (approved && view.certificate.is_some())
                    .then(|| state.ca.ca_cert_pem().to_string()),
                certificate: view.certificate,
            })
            .into_response()
        }
        Err(e) => {
            error!(pairing_code = %code, error = %e, "Failed to read pairing status");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to get pairing status")
        }
    }
}
