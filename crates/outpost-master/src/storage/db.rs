//! `SQLite` database for the `Outpost` master.

outpost_core::define_database!(MasterDatabase, "Master database migrations complete");
