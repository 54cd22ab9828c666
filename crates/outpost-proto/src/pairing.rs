//! Pairing HTTP bodies (`POST /pair`, `GET /pair/{code}`).

use serde::{Deserialize, Serialize};

/// Lifecycle of a pairing request as reported to the polling slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    NotFound,
}

impl PairingStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
            Self::NotFound => "not_found",
        }
    }

    /// Terminal states never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Denied | Self::Expired)
    }
}

impl std::fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PairingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "denied" => Ok(Self::Denied),
            "expired" => Ok(Self::Expired),
            "not_found" => Ok(Self::NotFound),
            other => Err(format!("unknown pairing status: {other}")),
        }
    }
}

/// `POST /pair` request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRequest {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub csr: String,
    #[serde(default)]
    pub platform: String,
}

/// `POST /pair` success body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairResponse {
    pub success: bool,
    pub pairing_code: String,
}

/// `GET /pair/{code}` body. Certificates are present only when approved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairStatusResponse {
    pub status: PairingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_serializes_snake_case() {
        let body = PairStatusResponse {
            status: PairingStatus::NotFound,
            certificate: None,
            ca_cert: None,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"status": "not_found"})
        );
    }

    #[test]
    fn status_parses_from_storage_text() {
        assert_eq!("denied".parse::<PairingStatus>().unwrap(), PairingStatus::Denied);
        assert!("bogus".parse::<PairingStatus>().is_err());
    }

    #[test]
    fn only_decided_states_are_terminal() {
        assert!(!PairingStatus::Pending.is_terminal());
        assert!(!PairingStatus::NotFound.is_terminal());
        assert!(PairingStatus::Approved.is_terminal());
        assert!(PairingStatus::Expired.is_terminal());
    }

    #[test]
    fn pair_request_missing_fields_default_empty() {
        let req: PairRequest = serde_json::from_value(json!({"hostname": "a"})).unwrap();
        assert!(req.csr.is_empty());
        assert!(req.platform.is_empty());
    }
}
