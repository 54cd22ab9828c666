//! `SQLite` storage for the `Outpost` master.
//!
//! Persists paired slaves, pairing requests and the credential revocation
//! log. Consumers depend on the [`SlaveStore`] trait; [`MasterDatabase`] is
//! the sqlx implementation.

mod db;
mod models;
mod queries;
mod store;


pub use db::MasterDatabase;
pub use models::*;
pub use outpost_core::DatabaseError;
pub use store::SlaveStore;
