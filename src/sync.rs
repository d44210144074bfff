//! Sync orchestrator.
//!
//! Kinds run one after another in catalog order: fetch (with included
//! resolution per page), then persist inside one transaction per kind.
//! Only one run may be active at a time, guarded by a TTL lock.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{self, KindSpec};
use crate::config::SyncOptions;
use crate::db::{self, Pool};
use crate::fetch::{fetch_all, FetchObserver, TracingObserver};
use crate::jsonapi::JsonApiSource;
use crate::lock::{LockToken, TtlLock};
use crate::model::{KindReport, KindStatus, RunStatus, StatusSnapshot, SyncSummary};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("a sync has been running since {since}")]
    AlreadyRunning { since: DateTime<Utc> },
}

#[derive(Debug)]
struct Progress {
    phase: RunStatus,
    last_success_at: Option<DateTime<Utc>>,
    last_reports: Vec<KindReport>,
}

/// Process-wide run state shared by every trigger and status caller.
#[derive(Debug)]
pub struct SyncState {
    lock: TtlLock,
    progress: Mutex<Progress>,
}

impl SyncState {
    pub fn new(lock_ttl: Duration) -> Self {
        Self {
            lock: TtlLock::new(lock_ttl),
            progress: Mutex::new(Progress {
                phase: RunStatus::Idle,
                last_success_at: None,
                last_reports: Vec::new(),
            }),
        }
    }

    pub fn lock(&self) -> &TtlLock {
        &self.lock
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.with_progress(|p| p.last_success_at)
    }

    pub fn phase(&self) -> RunStatus {
        self.with_progress(|p| p.phase)
    }

    fn with_progress<T>(&self, f: impl FnOnce(&mut Progress) -> T) -> T {
        let mut guard = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

/// Releases the run lock when dropped, including on panic or cancellation.
/// A run that never reached `complete` is recorded as failed.
struct RunGuard<'a> {
    state: &'a SyncState,
    token: LockToken,
    pool: Pool,
    run_id: Uuid,
    completed: bool,
}

impl RunGuard<'_> {
    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            warn!(run_id = %self.run_id, "sync run ended before completing");
            self.state.with_progress(|p| p.phase = RunStatus::Failed);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let pool = self.pool.clone();
                let run_id = self.run_id;
                handle.spawn(async move {
                    if let Err(err) = db::record_run_abandoned(&pool, run_id).await {
                        warn!(?err, %run_id, "failed to record abandoned run");
                    }
                });
            }
        }
        if !self.state.lock.release(&self.token) {
            warn!("sync lock was reclaimed before this run finished");
        }
    }
}

pub struct Syncer {
    source: Arc<dyn JsonApiSource>,
    pool: Pool,
    state: Arc<SyncState>,
    kinds: Vec<&'static KindSpec>,
    options: SyncOptions,
    observer: Arc<dyn FetchObserver>,
}

impl Syncer {
    pub fn new(source: Arc<dyn JsonApiSource>, pool: Pool, options: SyncOptions) -> Self {
        let state = Arc::new(SyncState::new(Duration::from_secs(options.lock_ttl_secs)));
        Self {
            source,
            pool,
            state,
            kinds: catalog::select(&options.kinds),
            options,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn FetchObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_state(mut self, state: Arc<SyncState>) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &Arc<SyncState> {
        &self.state
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn kinds(&self) -> &[&'static KindSpec] {
        &self.kinds
    }

    /// Restore `last_success_at` from run history and close out runs a
    /// previous process never finished.
    pub async fn hydrate(&self) -> anyhow::Result<()> {
        let interrupted = db::fail_interrupted_runs(&self.pool).await?;
        if interrupted > 0 {
            warn!(interrupted, "marked unfinished runs as failed");
        }
        let last = db::last_successful_sync(&self.pool).await?;
        self.state.with_progress(|p| p.last_success_at = last);
        info!(last_success_at = ?last, "sync state restored");
        Ok(())
    }

    /// Run every selected kind to completion, or refuse if a run holds the lock.
    pub async fn trigger(&self) -> Result<SyncSummary, TriggerError> {
        let Some(token) = self.state.lock.try_acquire() else {
            let since = self
                .state
                .lock
                .held_since_at(Utc::now())
                .unwrap_or_else(Utc::now);
            info!(%since, "sync already running; trigger refused");
            return Err(TriggerError::AlreadyRunning { since });
        };
        let run_id = Uuid::new_v4();
        let mut guard = RunGuard {
            state: &self.state,
            token,
            pool: self.pool.clone(),
            run_id,
            completed: false,
        };

        let started_at = Utc::now();
        let clock = Instant::now();
        self.state.with_progress(|p| p.phase = RunStatus::Running);
        if let Err(err) = db::record_run_started(&self.pool, run_id, started_at).await {
            warn!(?err, %run_id, "failed to record run start");
        }
        info!(%run_id, kinds = self.kinds.len(), "sync started");

        let mut stats = Vec::with_capacity(self.kinds.len());
        let mut aborted: Option<String> = None;
        for (position, spec) in self.kinds.iter().enumerate() {
            if aborted.is_some() {
                stats.push(KindReport::new(spec.name));
                continue;
            }
            let report = self.sync_kind(spec).await;
            if position == 0 && report.status == KindStatus::Failed {
                error!(kind = spec.name, "first kind failed; aborting run");
                aborted = Some(format!(
                    "{}: {}",
                    spec.name,
                    report.error.as_deref().unwrap_or("fetch failed")
                ));
            }
            stats.push(report);
        }

        let degraded = stats
            .iter()
            .filter(|r| matches!(r.status, KindStatus::Partial | KindStatus::Failed))
            .count();
        let (status, message) = match (&aborted, degraded) {
            (Some(reason), _) => (RunStatus::Failed, format!("sync failed: {}", reason)),
            (None, 0) => (RunStatus::Succeeded, "sync completed".to_string()),
            (None, n) => (
                RunStatus::PartiallyFailed,
                format!("sync completed with errors in {} kind(s)", n),
            ),
        };

        let finished_at = Utc::now();
        let summary = SyncSummary {
            run_id,
            message,
            status,
            code: status.code(),
            execution_time: clock.elapsed().as_secs_f64(),
            started_at,
            finished_at,
            stats,
        };
        if let Err(err) = db::record_run_finished(&self.pool, &summary).await {
            warn!(?err, %run_id, "failed to record run result");
        }
        self.state.with_progress(|p| {
            p.phase = status;
            if status.counts_as_success() {
                p.last_success_at = Some(finished_at);
            }
            p.last_reports = summary.stats.clone();
        });
        guard.complete();
        info!(
            %run_id,
            status = status.as_str(),
            secs = summary.execution_time,
            "sync finished"
        );
        Ok(summary)
    }

    async fn sync_kind(&self, spec: &KindSpec) -> KindReport {
        let mut report = KindReport::new(spec.name);
        let fetch_spec = spec.fetch_spec(&self.options);
        let outcome = match fetch_all(self.source.as_ref(), &fetch_spec, self.observer.as_ref()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(kind = spec.name, %err, "fetch failed");
                report.status = KindStatus::Failed;
                report.error = Some(err.to_string());
                return report;
            }
        };
        report.fetched = outcome.resources.len() as u64 + outcome.skipped.len() as u64;
        report.pages = outcome.pages;
        report.include_used = outcome.include_used.clone();

        match db::persist_kind(&self.pool, spec, &outcome.resources).await {
            Ok(persisted) => {
                report.stored = persisted.stored;
                report.failed = persisted.failed() + outcome.skipped.len() as u64;
                report.dangling_references = persisted.dangling.len() as u64;
                report.error = outcome.partial_error.clone();
                report.status = if outcome.is_partial() || report.failed > 0 {
                    KindStatus::Partial
                } else {
                    KindStatus::Succeeded
                };
            }
            Err(err) => {
                error!(kind = spec.name, ?err, "storage failed; kind rolled back");
                report.status = KindStatus::Failed;
                report.error = Some(format!("storage: {}", err));
            }
        }
        info!(
            kind = spec.name,
            status = report.status.as_str(),
            stored = report.stored,
            failed = report.failed,
            "kind finished"
        );
        report
    }

    /// In-memory part of the status snapshot; never touches storage.
    pub fn snapshot(&self) -> StatusSnapshot {
        let now = Utc::now();
        let running_since = self.state.lock.held_since_at(now);
        let (phase, last_sync, per_kind_counts) = self
            .state
            .with_progress(|p| (p.phase, p.last_success_at, p.last_reports.clone()));
        StatusSnapshot {
            is_syncing: running_since.is_some(),
            running_since,
            last_sync,
            phase,
            per_kind_counts,
            row_counts: Default::default(),
            relationship_stats: Vec::new(),
        }
    }

    /// Full status including per-table row counts and foreign-key population.
    pub async fn status(&self) -> anyhow::Result<StatusSnapshot> {
        let mut snapshot = self.snapshot();
        snapshot.row_counts = db::row_counts(&self.pool, &self.kinds).await?;
        snapshot.relationship_stats = db::relationship_stats(&self.pool, &self.kinds).await?;
        Ok(snapshot)
    }
}
