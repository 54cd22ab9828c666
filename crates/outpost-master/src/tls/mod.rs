//! TLS for the slave listener: rustls configuration and the accept loop.

mod config;
mod listener;

pub use config::{TlsConfigError, client_tls_config, server_tls_config};
pub use listener::{PeerCertificate, serve_tls};
