//! Administrative operations over paired and connected slaves.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use outpost_core::DatabaseError;
use outpost_proto::MessageType;

use crate::proxy::SlaveProxyClient;
use crate::registry::{SlaveRegistry, SlaveStatus};
use crate::router::{RelayError, ToolRelay};
use crate::storage::{RevokedCredential, SlaveStore};

/// A paired slave merged with its live connection state.
#[derive(Debug, Clone, Serialize)]
pub struct SlaveInfo {
    pub host_id: String,
    pub platform: String,
    pub cert_serial: String,
    pub enabled: bool,
    pub issued_at: i64,
    pub expires_at: i64,
    pub last_seen: Option<i64>,
    pub version: String,
    pub status: SlaveStatus,
    pub tool_count: usize,
    pub last_heartbeat: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Slave not found: {0}")]
    NotFound(String),

    #[error("Slave not connected: {0}")]
    NotConnected(String),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error(transparent)]
    Relay(RelayError),
}

impl From<RelayError> for ManagerError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::NotConnected(host) => Self::NotConnected(host),
            other => Self::Relay(other),
        }
    }
}

pub struct SlaveManager {
    store: Arc<dyn SlaveStore>,
    registry: Arc<SlaveRegistry>,
    relay: ToolRelay,
}

impl SlaveManager {
    pub fn new(store: Arc<dyn SlaveStore>, registry: Arc<SlaveRegistry>, relay: ToolRelay) -> Self {
        Self {
            store,
            registry,
            relay,
        }
    }

    /// Permanently revoke the active certificate of `host_id`, disable the
    /// slave and close its live connection. Returns `false` if the serial
    /// was already revoked.
    pub async fn revoke_credential(&self, host_id: &str, reason: &str) -> Result<bool, ManagerError> {
        let slave = self
            .store
            .get_slave_server_by_host_id(host_id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(host_id.to_string()))?;

        let newly_revoked = self
            .store
            .revoke_slave_credential(host_id, &slave.cert_serial, reason)
            .await?;
        self.store.set_slave_enabled(host_id, false).await?;

        if self.registry.disconnect(host_id).await.is_some() {
            self.relay.fail_pending_for(host_id);
        }

        info!(host_id, serial = %slave.cert_serial, reason, newly_revoked, "Slave credential revoked");
        Ok(newly_revoked)
    }

    pub async fn list_revoked(&self) -> Result<Vec<RevokedCredential>, ManagerError> {
        Ok(self.store.list_revoked_credentials().await?)
    }

    pub async fn restart_slave(&self, host_id: &str) -> Result<(), ManagerError> {
        Ok(self
            .relay
            .send_command(host_id, MessageType::Restart, Value::Null)
            .await?)
    }

    pub async fn upgrade_slave(&self, host_id: &str) -> Result<(), ManagerError> {
        Ok(self
            .relay
            .send_command(host_id, MessageType::Upgrade, Value::Null)
            .await?)
    }

    /// Every paired slave, with live state where connected.
    pub async fn list_slaves(&self) -> Result<Vec<SlaveInfo>, ManagerError> {
        let configs = self.store.list_slave_servers().await?;
        let mut slaves = Vec::with_capacity(configs.len());
        for config in configs {
            let live = self.registry.snapshot(&config.host_id).await;
            slaves.push(SlaveInfo {
                status: if live.is_some() {
                    SlaveStatus::Connected
                } else {
                    SlaveStatus::Disconnected
                },
                tool_count: live.as_ref().map_or(0, |s| s.tools.len()),
                last_heartbeat: live.as_ref().map(|s| s.last_heartbeat),
                version: live
                    .map(|s| s.version)
                    .filter(|v| !v.is_empty())
                    .unwrap_or(config.reported_version),
                host_id: config.host_id,
                platform: config.platform,
                cert_serial: config.cert_serial,
                enabled: config.enabled,
                issued_at: config.issued_at,
                expires_at: config.expires_at,
                last_seen: config.last_seen,
            });
        }
        Ok(slaves)
    }

    /// Tool source for a connected slave.
    pub async fn proxy_client(&self, host_id: &str) -> Result<SlaveProxyClient, ManagerError> {
        if !self.registry.is_connected(host_id).await {
            return Err(ManagerError::NotConnected(host_id.to_string()));
        }
        Ok(SlaveProxyClient::new(
            host_id,
            Arc::clone(&self.registry),
            self.relay.clone(),
        ))
    }

    /// Call a tool by its composite `"{hostname}_{tool}"` name.
    pub async fn call_tool(
        &self,
        composite: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, ManagerError> {
        let hosts = self.registry.connected_hosts().await;
        let (host, tool) = split_composite(&hosts, composite)
            .ok_or_else(|| ManagerError::NotConnected(composite.to_string()))?;
        Ok(self.relay.call_tool(host, tool, arguments).await?)
    }
}

/// Split `composite` at the longest connected hostname followed by `_`.
fn split_composite<'a>(hosts: &'a [String], composite: &'a str) -> Option<(&'a str, &'a str)> {
    hosts
        .iter()
        .filter_map(|host| {
            composite
                .strip_prefix(host.as_str())
                .and_then(|rest| rest.strip_prefix('_'))
                .filter(|tool| !tool.is_empty())
                .map(|tool| (host.as_str(), tool))
        })
        .max_by_key(|(host, _)| host.len())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use outpost_proto::{Envelope, ToolCallPayload, ToolCallResponse, Tool};

    use crate::storage::MasterDatabase;
    use crate::test_helpers::{connect_slave, seed_slave, test_db};

    use super::*;

    async fn setup() -> (SlaveManager, MasterDatabase, Arc<SlaveRegistry>) {
        let db = test_db().await;
        let registry = Arc::new(SlaveRegistry::new());
        let relay = ToolRelay::new(Arc::clone(&registry), Duration::from_secs(5));
        let manager = SlaveManager::new(Arc::new(db.clone()), Arc::clone(&registry), relay);
        (manager, db, registry)
    }

    #[test]
    fn composite_prefers_longest_host() {
        let hosts = vec!["work".to_string(), "work_laptop".to_string()];
        assert_eq!(
            split_composite(&hosts, "work_laptop_search"),
            Some(("work_laptop", "search"))
        );
        assert_eq!(split_composite(&hosts, "work_search"), Some(("work", "search")));
        assert_eq!(split_composite(&hosts, "home_search"), None);
        assert_eq!(split_composite(&hosts, "work_"), None);
    }

    #[tokio::test]
    async fn revoke_disables_and_disconnects() {
        let (manager, db, registry) = setup().await;
        seed_slave(&db, "workstation", "abc").await;
        let (_rx, mut closed) = connect_slave(&registry, "workstation", vec![]).await;

        assert!(manager.revoke_credential("workstation", "compromised").await.unwrap());

        closed.changed().await.unwrap();
        assert!(!registry.is_connected("workstation").await);
        assert!(db.is_credential_revoked("abc").await.unwrap());
        let slave = db.get_slave_server_by_host_id("workstation").await.unwrap().unwrap();
        assert!(!slave.enabled);

        let revoked = manager.list_revoked().await.unwrap();
        assert_eq!(revoked.len(), 1);
        assert_eq!(revoked[0].reason, "compromised");

        // Re-revoking is a no-op.
        assert!(!manager.revoke_credential("workstation", "again").await.unwrap());
        assert_eq!(manager.list_revoked().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn revoke_unknown_host_is_not_found() {
        let (manager, _db, _registry) = setup().await;
        let err = manager.revoke_credential("ghost", "x").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));
    }

    #[tokio::test]
    async fn commands_require_connection() {
        let (manager, _db, registry) = setup().await;
        assert!(matches!(
            manager.restart_slave("a").await,
            Err(ManagerError::NotConnected(_))
        ));

        let (mut rx, _closed) = connect_slave(&registry, "a", vec![]).await;
        manager.restart_slave("a").await.unwrap();
        manager.upgrade_slave("a").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind(), Some(MessageType::Restart));
        assert_eq!(rx.recv().await.unwrap().kind(), Some(MessageType::Upgrade));
    }

    #[tokio::test]
    async fn list_merges_live_state() {
        let (manager, db, registry) = setup().await;
        seed_slave(&db, "a", "01").await;
        seed_slave(&db, "b", "02").await;
        let (_rx, _closed) = connect_slave(&registry, "a", vec![Tool::new("t", "")]).await;

        let slaves = manager.list_slaves().await.unwrap();
        assert_eq!(slaves.len(), 2);
        assert_eq!(slaves[0].host_id, "a");
        assert_eq!(slaves[0].status, SlaveStatus::Connected);
        assert_eq!(slaves[0].tool_count, 1);
        assert_eq!(slaves[0].version, "1.0.0");
        assert!(slaves[0].last_heartbeat.is_some());
        assert_eq!(slaves[1].status, SlaveStatus::Disconnected);
        assert_eq!(slaves[1].tool_count, 0);
    }

    #[tokio::test]
    async fn composite_call_routes_to_slave() {
        let (manager, _db, registry) = setup().await;
        let (mut rx, _closed) = connect_slave(&registry, "workstation", vec![]).await;

        let relay = manager.relay.clone();
        tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            let payload: ToolCallPayload = request.payload().unwrap();
            let reply = Envelope::with_payload(
                MessageType::Response,
                request.id,
                &ToolCallResponse::ok(json!({"tool": payload.tool})),
            )
            .unwrap();
            relay.resolve(reply).await;
        });

        let result = manager
            .call_tool("workstation_search_files", Map::new())
            .await
            .unwrap();
        assert_eq!(result, json!({"tool": "search_files"}));

        let err = manager.call_tool("laptop_x", Map::new()).await.unwrap_err();
        assert!(matches!(err, ManagerError::NotConnected(_)));
    }

    #[tokio::test]
    async fn proxy_client_requires_connection() {
        let (manager, _db, registry) = setup().await;
        assert!(manager.proxy_client("a").await.is_err());
        let (_rx, _closed) = connect_slave(&registry, "a", vec![]).await;
        assert!(manager.proxy_client("a").await.is_ok());
    }
}
