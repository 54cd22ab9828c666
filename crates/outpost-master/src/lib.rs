//! Outpost Master Library
//!
//! The master side of the Outpost tool relay:
//! - Private CA issuing client certificates to paired slaves
//! - Pairing service with short-lived, operator-approved codes
//! - mTLS WebSocket server for slave connections
//! - Registry of connected slaves and relay of tool calls to them
//! - `SQLite` storage for slaves, pairing requests and revocations

pub mod app;
pub mod config;
pub mod manager;
pub mod pairing;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod server;
pub mod storage;
pub mod tls;
pub mod upstream;

#[cfg(test)]
mod test_helpers;
