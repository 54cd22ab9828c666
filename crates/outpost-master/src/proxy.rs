//! Presents a connected slave as an ordinary tool source.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use outpost_proto::Tool;

use crate::registry::SlaveRegistry;
use crate::router::{RelayError, ToolRelay};

/// The contract an aggregating tool proxy consumes.
#[async_trait]
pub trait ToolSource: Send + Sync {
    fn name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<Tool>, ProxyError>;

    async fn call_tool(&self, tool: &str, arguments: Map<String, Value>)
    -> Result<Value, ProxyError>;

    async fn list_prompts(&self) -> Result<Vec<Value>, ProxyError>;

    async fn get_prompt(&self, name: &str, arguments: Map<String, Value>)
    -> Result<Value, ProxyError>;

    async fn list_resources(&self) -> Result<Vec<Value>, ProxyError>;

    async fn read_resource(&self, uri: &str) -> Result<Value, ProxyError>;

    async fn is_connected(&self) -> bool;

    async fn cached_tool_count(&self) -> usize;
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("{0} not supported on remote slaves")]
    Unsupported(&'static str),
}

/// Tool source backed by one slave's registry entry and the relay.
///
/// Holds no connection state of its own, so it stays valid across
/// reconnects of the same host.
#[derive(Clone)]
pub struct SlaveProxyClient {
    hostname: String,
    registry: Arc<SlaveRegistry>,
    relay: ToolRelay,
}

impl SlaveProxyClient {
    pub fn new(hostname: impl Into<String>, registry: Arc<SlaveRegistry>, relay: ToolRelay) -> Self {
        Self {
            hostname: hostname.into(),
            registry,
            relay,
        }
    }
}

#[async_trait]
impl ToolSource for SlaveProxyClient {
    fn name(&self) -> &str {
        &self.hostname
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, ProxyError> {
        Ok(self.registry.tools(&self.hostname).await.unwrap_or_default())
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, ProxyError> {
        Ok(self.relay.call_tool(&self.hostname, tool, arguments).await?)
    }

    async fn list_prompts(&self) -> Result<Vec<Value>, ProxyError> {
        Ok(Vec::new())
    }

    async fn get_prompt(
        &self,
        _name: &str,
        _arguments: Map<String, Value>,
    ) -> Result<Value, ProxyError> {
        Err(ProxyError::Unsupported("prompts"))
    }

    async fn list_resources(&self) -> Result<Vec<Value>, ProxyError> {
        Ok(Vec::new())
    }

    async fn read_resource(&self, _uri: &str) -> Result<Value, ProxyError> {
        Err(ProxyError::Unsupported("resources"))
    }

    async fn is_connected(&self) -> bool {
        self.registry.is_connected(&self.hostname).await
    }

    async fn cached_tool_count(&self) -> usize {
        self.registry.tool_count(&self.hostname).await
    }
}
