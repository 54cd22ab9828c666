//! Registry of live slave connections.

mod connection;
mod slaves;

pub use connection::ConnectionHandle;
pub use slaves::{RegistryEvent, SlaveRegistry, SlaveSnapshot, SlaveStatus};
