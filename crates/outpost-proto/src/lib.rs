//! `Outpost` wire protocol
//!
//! Master and slaves exchange JSON text frames over one WebSocket per slave.
//! Every frame is an [`Envelope`] `{type, id, timestamp, data}`; the payload
//! structs in [`payloads`] describe `data` for each message type.
//!
//! Pairing uses plain HTTPS JSON bodies, described in [`pairing`].

pub mod envelope;
pub mod pairing;
pub mod payloads;

pub use envelope::{Envelope, MessageType};
pub use pairing::{PairRequest, PairResponse, PairStatusResponse, PairingStatus};
pub use payloads::{
    ErrorPayload, MasterToolCallPayload, MasterToolsPayload, RegisterAck, RegisterPayload, Tool,
    ToolCallPayload, ToolCallResponse,
};
