//! Result types returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::RunStatus;
use crate::references::DanglingReference;

/// One record that could not be stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub id: String,
    pub error: String,
}

/// Outcome of storing one kind's resources inside a single transaction.
#[derive(Debug, Clone, Default)]
pub struct PersistReport {
    pub stored: u64,
    pub failures: Vec<RecordFailure>,
    pub dangling: Vec<DanglingReference>,
}

impl PersistReport {
    pub fn failed(&self) -> u64 {
        self.failures.len() as u64
    }
}

/// Row of the `sync_runs` history table.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunRow {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
}
