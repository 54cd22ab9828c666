//! The master's own tool servers, as exposed to slaves.
//!
//! Slaves receive the master's catalogue in `master_tools` and can call back
//! into it with `master_tool_call`. The catalogue and its execution belong to
//! whatever hosts this crate; it plugs in through [`ToolRouter`] and
//! [`ContextSource`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use outpost_proto::{MasterToolsPayload, Tool};

/// A tool together with the upstream server that provides it.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginTool {
    pub server: String,
    pub tool: Tool,
}

/// One server's membership in a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextServer {
    pub server_name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct UpstreamError(pub String);

#[async_trait]
pub trait ToolRouter: Send + Sync {
    async fn list_all_tools(&self) -> Result<Vec<OriginTool>, UpstreamError>;

    /// Call a tool by its composite `"{server}_{tool}"` name.
    async fn call_tool(&self, name: &str, arguments: Map<String, Value>)
    -> Result<Value, UpstreamError>;
}

#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn list_contexts(&self) -> Result<Vec<String>, UpstreamError>;

    async fn servers_for_context(&self, context: &str) -> Result<Vec<ContextServer>, UpstreamError>;
}

/// A master with no tools of its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUpstream;

#[async_trait]
impl ToolRouter for NoUpstream {
    async fn list_all_tools(&self) -> Result<Vec<OriginTool>, UpstreamError> {
        Ok(Vec::new())
    }

    async fn call_tool(
        &self,
        name: &str,
        _arguments: Map<String, Value>,
    ) -> Result<Value, UpstreamError> {
        Err(UpstreamError(format!("no upstream tool named {name}")))
    }
}

#[async_trait]
impl ContextSource for NoUpstream {
    async fn list_contexts(&self) -> Result<Vec<String>, UpstreamError> {
        Ok(Vec::new())
    }

    async fn servers_for_context(&self, _context: &str) -> Result<Vec<ContextServer>, UpstreamError> {
        Ok(Vec::new())
    }
}

/// Build the `master_tools` payload for `hostname`.
///
/// Tools of the server named after the slave itself are left out so a slave
/// never sees its own tools echoed back. Context mappings list only enabled
/// servers; a context whose lookup fails is skipped.
pub async fn build_master_tools(
    router: &dyn ToolRouter,
    contexts: &dyn ContextSource,
    hostname: &str,
) -> Result<MasterToolsPayload, UpstreamError> {
    let mut servers: BTreeMap<String, Vec<Tool>> = BTreeMap::new();
    for origin in router.list_all_tools().await? {
        if origin.server == hostname {
            continue;
        }
        servers.entry(origin.server).or_default().push(origin.tool);
    }

    let mut context_mappings = BTreeMap::new();
    for context in contexts.list_contexts().await? {
        match contexts.servers_for_context(&context).await {
            Ok(members) => {
                let enabled: Vec<_> = members
                    .into_iter()
                    .filter(|m| m.enabled)
                    .map(|m| m.server_name)
                    .collect();
                context_mappings.insert(context, enabled);
            }
            Err(e) => warn!(context, error = %e, "Skipping context in master_tools"),
        }
    }

    Ok(MasterToolsPayload {
        servers,
        context_mappings,
    })
}
