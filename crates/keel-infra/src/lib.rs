//! Infrastructure layer for keel.
//!
//! Contains the implementation of the store trait defined in `keel-core`
//! (SQLite with WAL, split reader/writer pools, embedded migrations) and the
//! `keel.toml` configuration loader.

pub mod config;
pub mod sqlite;
