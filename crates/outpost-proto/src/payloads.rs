//! Payloads carried in [`Envelope::data`](crate::Envelope).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A tool descriptor as advertised by a slave or the master's upstreams.
///
/// Fields other than `name`, `description` and `inputSchema` are preserved
/// untouched so descriptors pass through the master losslessly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(
        rename = "inputSchema",
        default,
        skip_serializing_if = "Value::is_null"
    )]
    pub input_schema: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: Value::Null,
            extra: Map::new(),
        }
    }
}

/// `register`: slave → master.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterPayload {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub tools: Vec<Tool>,
}

/// `response` to a `register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub status: String,
}

/// `tool_call`: master → slave.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// The `response` body for a `tool_call` or `master_tool_call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallResponse {
    pub const fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// `master_tools`: master → slave.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterToolsPayload {
    /// Upstream server name → its tools.
    pub servers: BTreeMap<String, Vec<Tool>>,
    /// Context name → names of the servers enabled in it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context_mappings: BTreeMap<String, Vec<String>>,
}

/// `master_tool_call`: slave → master.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterToolCallPayload {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// `error` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}
