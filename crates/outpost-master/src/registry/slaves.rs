//! In-memory registry of connected slaves.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{RwLock, broadcast};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use outpost_core::db::unix_timestamp;
use outpost_proto::Tool;

use super::connection::ConnectionHandle;

const EVENT_CAPACITY: usize = 64;

/// Connection status of a slave as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaveStatus {
    Connected,
    Disconnected,
}

/// Registry change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Connected { hostname: String, tool_count: usize },
    Disconnected { hostname: String },
    ToolsUpdated { hostname: String, tool_count: usize },
}

struct SlaveEntry {
    handle: ConnectionHandle,
    tools: Vec<Tool>,
    version: String,
    connected_at: i64,
    last_heartbeat: Instant,
    last_heartbeat_unix: i64,
}

/// Point-in-time view of one registered slave.
#[derive(Debug, Clone)]
pub struct SlaveSnapshot {
    pub hostname: String,
    pub connection_id: Uuid,
    pub cert_serial: String,
    pub version: String,
    pub tools: Vec<Tool>,
    pub connected_at: i64,
    pub last_heartbeat: i64,
}

/// Thread-safe registry of live slave connections keyed by hostname.
///
/// Lock sections never await I/O; closing a handle is a non-blocking signal.
pub struct SlaveRegistry {
    slaves: RwLock<HashMap<String, SlaveEntry>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl SlaveRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            slaves: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register `hostname` as connected, replacing any previous entry. A
    /// replaced live connection is told to close.
    pub async fn connect(
        &self,
        hostname: &str,
        tools: Vec<Tool>,
        version: &str,
        handle: ConnectionHandle,
    ) {
        let tool_count = tools.len();
        let now = unix_timestamp();
        let entry = SlaveEntry {
            handle,
            tools,
            version: version.to_string(),
            connected_at: now,
            last_heartbeat: Instant::now(),
            last_heartbeat_unix: now,
        };

        let replaced = {
            let mut slaves = self.slaves.write().await;
            let new_id = entry.handle.connection_id;
            slaves
                .insert(hostname.to_string(), entry)
                .filter(|old| old.handle.connection_id != new_id)
        };
        if let Some(old) = replaced {
            info!(hostname, old_connection = %old.handle.connection_id, "Replacing existing slave connection");
            old.handle.close();
        }

        info!(hostname, tools = tool_count, "Slave registered");
        let _ = self.events.send(RegistryEvent::Connected {
            hostname: hostname.to_string(),
            tool_count,
        });
    }

    /// Refresh liveness. Returns `false` if the host is not registered.
    pub async fn heartbeat(&self, hostname: &str) -> bool {
        self.heartbeat_at(hostname, Instant::now()).await
    }

    pub(crate) async fn heartbeat_at(&self, hostname: &str, now: Instant) -> bool {
        let mut slaves = self.slaves.write().await;
        match slaves.get_mut(hostname) {
            Some(entry) => {
                entry.last_heartbeat = now;
                entry.last_heartbeat_unix = unix_timestamp();
                true
            }
            None => false,
        }
    }

    /// Replace the advertised tool set. Returns `false` if the host is not
    /// registered.
    pub async fn update_tools(&self, hostname: &str, tools: Vec<Tool>) -> bool {
        let tool_count = tools.len();
        {
            let mut slaves = self.slaves.write().await;
            let Some(entry) = slaves.get_mut(hostname) else {
                return false;
            };
            entry.tools = tools;
        }

        info!(hostname, tools = tool_count, "Slave tools updated");
        let _ = self.events.send(RegistryEvent::ToolsUpdated {
            hostname: hostname.to_string(),
            tool_count,
        });
        true
    }

    /// Evict `hostname` and close its connection.
    pub async fn disconnect(&self, hostname: &str) -> Option<ConnectionHandle> {
        let removed = self.slaves.write().await.remove(hostname);
        removed.map(|entry| {
            entry.handle.close();
            self.emit_disconnected(hostname);
            entry.handle
        })
    }

    /// Evict and close `hostname` only if its entry still belongs to
    /// `connection_id`.
    ///
    /// Read loops and sweeps use this so they cannot evict a newer connection
    /// that replaced the one they looked at.
    pub async fn release(&self, hostname: &str, connection_id: Uuid) -> bool {
        let removed = {
            let mut slaves = self.slaves.write().await;
            match slaves.get(hostname) {
                Some(entry) if entry.handle.connection_id == connection_id => {
                    slaves.remove(hostname)
                }
                _ => None,
            }
        };

        match removed {
            Some(entry) => {
                entry.handle.close();
                self.emit_disconnected(hostname);
                true
            }
            None => {
                debug!(hostname, %connection_id, "Stale connection release ignored");
                false
            }
        }
    }

    fn emit_disconnected(&self, hostname: &str) {
        info!(hostname, "Slave disconnected");
        let _ = self.events.send(RegistryEvent::Disconnected {
            hostname: hostname.to_string(),
        });
    }

    pub async fn is_connected(&self, hostname: &str) -> bool {
        self.slaves.read().await.contains_key(hostname)
    }

    pub async fn status(&self, hostname: &str) -> SlaveStatus {
        if self.is_connected(hostname).await {
            SlaveStatus::Connected
        } else {
            SlaveStatus::Disconnected
        }
    }

    /// Number of tools advertised by `hostname`; zero when not connected.
    pub async fn tool_count(&self, hostname: &str) -> usize {
        self.slaves
            .read()
            .await
            .get(hostname)
            .map_or(0, |entry| entry.tools.len())
    }

    pub async fn tools(&self, hostname: &str) -> Option<Vec<Tool>> {
        self.slaves
            .read()
            .await
            .get(hostname)
            .map(|entry| entry.tools.clone())
    }

    pub async fn handle(&self, hostname: &str) -> Option<ConnectionHandle> {
        self.slaves
            .read()
            .await
            .get(hostname)
            .map(|entry| entry.handle.clone())
    }

    pub async fn snapshot(&self, hostname: &str) -> Option<SlaveSnapshot> {
        self.slaves
            .read()
            .await
            .get(hostname)
            .map(|entry| to_snapshot(hostname, entry))
    }

    /// Snapshots of every registered slave, sorted by hostname.
    pub async fn snapshots(&self) -> Vec<SlaveSnapshot> {
        let mut all: Vec<_> = self
            .slaves
            .read()
            .await
            .iter()
            .map(|(hostname, entry)| to_snapshot(hostname, entry))
            .collect();
        all.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        all
    }

    pub async fn connected_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<_> = self.slaves.read().await.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Hosts whose last heartbeat is more than `timeout` before `now`.
    /// Connections whose last heartbeat is older than `timeout` as of `now`.
    pub async fn stale_since(&self, now: Instant, timeout: Duration) -> Vec<(String, Uuid)> {
        self.slaves
            .read()
            .await
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_heartbeat) > timeout)
            .map(|(hostname, entry)| (hostname.clone(), entry.handle.connection_id))
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.slaves.read().await.len()
    }
}

impl Default for SlaveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn to_snapshot(hostname: &str, entry: &SlaveEntry) -> SlaveSnapshot {
    SlaveSnapshot {
        hostname: hostname.to_string(),
        connection_id: entry.handle.connection_id,
        cert_serial: entry.handle.cert_serial.clone(),
        version: entry.version.clone(),
        tools: entry.tools.clone(),
        connected_at: entry.connected_at,
        last_heartbeat: entry.last_heartbeat_unix,
    }
}
