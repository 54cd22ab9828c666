//! Enrollment of new slaves through short-lived, human-approved codes.

mod service;


pub use service::{
    ApprovedPairing, CERT_VALIDITY_DAYS, PAIRING_TTL, PairingError, PairingEvent,
    PairingEventKind, PairingOptions, PairingService, PairingStatusView, SWEEP_INTERVAL,
    generate_pairing_code,
};
