use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle of a sync run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::PartiallyFailed => "partially_failed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(RunStatus::Idle),
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "partially_failed" => Some(RunStatus::PartiallyFailed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    /// HTTP-style code reported with a finished run.
    pub fn code(&self) -> u16 {
        match self {
            RunStatus::Succeeded | RunStatus::Idle => 200,
            RunStatus::Running => 202,
            RunStatus::PartiallyFailed => 207,
            RunStatus::Failed => 500,
        }
    }

    /// Whether a finished run in this state counts as a success.
    pub fn counts_as_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::PartiallyFailed)
    }
}

/// Outcome for one resource kind within a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KindStatus {
    Succeeded,
    /// Some pages or some records did not make it.
    Partial,
    Failed,
    /// Not attempted because the run was aborted.
    Skipped,
}

impl KindStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KindStatus::Succeeded => "succeeded",
            KindStatus::Partial => "partial",
            KindStatus::Failed => "failed",
            KindStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KindReport {
    pub kind: String,
    pub status: KindStatus,
    pub fetched: u64,
    pub stored: u64,
    pub failed: u64,
    pub dangling_references: u64,
    pub pages: u32,
    pub include_used: Option<String>,
    pub error: Option<String>,
}

impl KindReport {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            status: KindStatus::Skipped,
            fetched: 0,
            stored: 0,
            failed: 0,
            dangling_references: 0,
            pages: 0,
            include_used: None,
            error: None,
        }
    }
}

/// Result of one triggered run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub message: String,
    pub status: RunStatus,
    pub code: u16,
    /// Seconds.
    pub execution_time: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: Vec<KindReport>,
}

impl SyncSummary {
    pub fn kind(&self, name: &str) -> Option<&KindReport> {
        self.stats.iter().find(|k| k.kind == name)
    }
}

/// Populated/total counts for one foreign-key column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelationshipStat {
    pub table: String,
    pub column: String,
    pub populated: i64,
    pub total: i64,
}

/// Snapshot served to status pollers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub is_syncing: bool,
    pub running_since: Option<DateTime<Utc>>,
    pub last_sync: Option<DateTime<Utc>>,
    pub phase: RunStatus,
    /// Per-kind reports of the most recent finished run.
    pub per_kind_counts: Vec<KindReport>,
    #[serde(default)]
    pub row_counts: BTreeMap<String, i64>,
    #[serde(default)]
    pub relationship_stats: Vec<RelationshipStat>,
}
