//! The message envelope carried by every WebSocket frame.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Known envelope types.
///
/// The wire field is kept as a string on [`Envelope`] so that frames with an
/// unrecognised type still decode and can be logged by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Slave → master, first message on a connection.
    Register,
    /// Slave → master liveness signal.
    Heartbeat,
    /// Slave → master, replaces the advertised tool set.
    ToolUpdate,
    /// Master → slave tool invocation.
    ToolCall,
    /// Reply correlated by `id`, either direction.
    Response,
    /// Error reply correlated by `id`, either direction.
    Error,
    /// Master → slave, fire-and-forget.
    Restart,
    /// Master → slave, fire-and-forget.
    Upgrade,
    /// Master → slave catalog of upstream tools.
    MasterTools,
    /// Slave → master invocation of an upstream tool.
    MasterToolCall,
}

impl MessageType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Heartbeat => "heartbeat",
            Self::ToolUpdate => "tool_update",
            Self::ToolCall => "tool_call",
            Self::Response => "response",
            Self::Error => "error",
            Self::Restart => "restart",
            Self::Upgrade => "upgrade",
            Self::MasterTools => "master_tools",
            Self::MasterToolCall => "master_tool_call",
        }
    }

    /// Parse a wire type name. `None` for anything unrecognised.
    pub fn from_wire(s: &str) -> Option<Self> {
        Some(match s {
            "register" => Self::Register,
            "heartbeat" => Self::Heartbeat,
            "tool_update" => Self::ToolUpdate,
            "tool_call" => Self::ToolCall,
            "response" => Self::Response,
            "error" => Self::Error,
            "restart" => Self::Restart,
            "upgrade" => Self::Upgrade,
            "master_tools" => Self::MasterTools,
            "master_tool_call" => Self::MasterToolCall,
            _ => return None,
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Correlation id. Empty for uncorrelated messages.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: MessageType, id: impl Into<String>, data: Value) -> Self {
        Self {
            msg_type: kind.as_str().to_string(),
            id: id.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// Build an envelope whose `data` is the JSON form of `payload`.
    pub fn with_payload<T: Serialize>(
        kind: MessageType,
        id: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, id, serde_json::to_value(payload)?))
    }

    /// The message type, or `None` if the sender used a type we don't know.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_wire(&self.msg_type)
    }

    /// Decode `data` into a payload struct.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
