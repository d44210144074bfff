//! Database module: local storage for synced resources and run history.
//!
//! This module is split into two submodules:
//! - `model`: result types returned by repositories.
//! - `repo`: SQL-only functions (pool setup, DDL, upserts, statistics).
//!
//! External modules should import from `productive_sync::db`; the repository
//! API and its result types are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{PersistReport, RecordFailure, SyncRunRow};
