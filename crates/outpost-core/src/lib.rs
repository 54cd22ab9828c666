//! `Outpost` Core Library
//!
//! Shared functionality for `Outpost` components:
//! - Tracing/logging initialisation
//! - `SQLite` pool helpers, `DatabaseError` and the `define_database!` macro

pub mod db;
pub mod tracing_init;

pub use db::{DatabaseError, unix_timestamp};
