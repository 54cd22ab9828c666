//! Relays tool calls to connected slaves and correlates their replies.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use outpost_proto::{Envelope, ErrorPayload, MessageType, ToolCallPayload, ToolCallResponse};

use super::pending::{PendingCalls, PendingGuard};
use crate::registry::SlaveRegistry;

/// Default time to wait for a slave's reply.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends requests through slave connections and waits for correlated replies.
#[derive(Clone)]
pub struct ToolRelay {
    registry: Arc<SlaveRegistry>,
    pending: Arc<PendingCalls>,
    call_timeout: Duration,
}

impl ToolRelay {
    pub fn new(registry: Arc<SlaveRegistry>, call_timeout: Duration) -> Self {
        Self {
            registry,
            pending: Arc::new(PendingCalls::new()),
            call_timeout,
        }
    }

    /// Fresh call id tagged with the target hostname.
    pub fn new_call_id(hostname: &str) -> String {
        format!("{hostname}-{}", Uuid::new_v4())
    }

    /// Call `tool` on `hostname` and return the unwrapped result.
    pub async fn call_tool(
        &self,
        hostname: &str,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, RelayError> {
        let call_id = Self::new_call_id(hostname);
        self.call_tool_with_id(hostname, &call_id, tool, arguments)
            .await
    }

    /// Like [`Self::call_tool`] with a caller-chosen call id.
    pub async fn call_tool_with_id(
        &self,
        hostname: &str,
        call_id: &str,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, RelayError> {
        let handle = self
            .registry
            .handle(hostname)
            .await
            .ok_or_else(|| RelayError::NotConnected(hostname.to_string()))?;

        let payload = ToolCallPayload {
            tool: tool.to_string(),
            arguments,
        };
        let envelope = Envelope::with_payload(MessageType::ToolCall, call_id, &payload)
            .map_err(|e| RelayError::SendFailed(format!("{hostname}: {e}")))?;

        // Register before sending so a fast reply cannot miss the table.
        let response_rx = self
            .pending
            .register(call_id, hostname, handle.connection_id);
        let _guard = PendingGuard::new(Arc::clone(&self.pending), call_id);

        // The deadline also covers queueing on a full outbound channel.
        let exchange = async {
            if handle.send(envelope).await.is_err() {
                return Err(RelayError::SendFailed(hostname.to_string()));
            }
            self.pending.mark_awaiting(call_id);
            debug!(hostname, call_id, tool, "Tool call sent");

            match response_rx.await {
                Ok(reply) => unwrap_reply(&reply),
                Err(_) => Err(RelayError::Disconnected(hostname.to_string())),
            }
        };

        match timeout(self.call_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                self.pending.time_out(call_id);
                warn!(hostname, call_id, tool, "Tool call timed out");
                Err(RelayError::Timeout(call_id.to_string()))
            }
        }
    }

    /// Send a fire-and-forget command such as `restart` or `upgrade`.
    pub async fn send_command(
        &self,
        hostname: &str,
        kind: MessageType,
        data: Value,
    ) -> Result<(), RelayError> {
        let handle = self
            .registry
            .handle(hostname)
            .await
            .ok_or_else(|| RelayError::NotConnected(hostname.to_string()))?;

        handle
            .send(Envelope::new(kind, Uuid::new_v4().to_string(), data))
            .await
            .map_err(|_| RelayError::SendFailed(hostname.to_string()))?;
        info!(hostname, command = %kind, "Command sent to slave");
        Ok(())
    }

    /// Hand a `response` or `error` envelope to its waiting caller.
    /// Returns `false` when no call with that id is pending.
    pub async fn resolve(&self, envelope: Envelope) -> bool {
        let call_id = envelope.id.clone();
        let delivered = self.pending.complete(&call_id, envelope);
        if !delivered {
            debug!(call_id, "Reply for unknown or finished call dropped");
        }
        delivered
    }

    /// Fail every call waiting on `hostname`.
    pub fn fail_pending_for(&self, hostname: &str) -> usize {
        self.pending.orphan_host(hostname)
    }

    /// Fail every call sent on one connection.
    pub fn fail_pending_on(&self, connection_id: Uuid) -> usize {
        self.pending.orphan_connection(connection_id)
    }

    pub fn pending(&self) -> &Arc<PendingCalls> {
        &self.pending
    }

    pub fn registry(&self) -> &Arc<SlaveRegistry> {
        &self.registry
    }

    pub const fn call_timeout(&self) -> Duration {
        self.call_timeout
    }
}

fn unwrap_reply(reply: &Envelope) -> Result<Value, RelayError> {
    if reply.kind() == Some(MessageType::Error) {
        let payload: ErrorPayload = reply
            .payload()
            .map_err(|e| RelayError::InvalidResponse(e.to_string()))?;
        return Err(RelayError::Remote(payload.error));
    }

    let response: ToolCallResponse = reply
        .payload()
        .map_err(|e| RelayError::InvalidResponse(e.to_string()))?;
    match response.error {
        Some(error) if !error.is_empty() => Err(RelayError::Remote(error)),
        _ if !response.success => Err(RelayError::Remote("tool call failed".into())),
        _ => Ok(response.result.unwrap_or(Value::Null)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Slave not connected: {0}")]
    NotConnected(String),

    #[error("Failed to send to slave: {0}")]
    SendFailed(String),

    #[error("Tool call timed out: {0}")]
    Timeout(String),

    #[error("Slave disconnected before replying: {0}")]
    Disconnected(String),

    #[error("Slave reported error: {0}")]
    Remote(String),

    #[error("Invalid response from slave: {0}")]
    InvalidResponse(String),
}
