use axum::extract::State;
use axum::http::StatusCode;
use productive_sync::db;
use productive_sync::jsonapi::{JsonApiSource, PageRequest, SourceError};
use productive_sync::model::{KindStatus, RunStatus};
use productive_sync::server::{self, AppState};
use productive_sync::sync::{Syncer, TriggerError};
use productive_sync::config::SyncOptions;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

async fn setup_pool() -> db::Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

/// Serves scripted responses per resource path; unknown paths return an empty page.
#[derive(Clone, Default)]
struct RoutedSource {
    routes: Arc<Mutex<HashMap<String, VecDeque<Result<Value, SourceError>>>>>,
    requests: Arc<Mutex<Vec<PageRequest>>>,
}

impl RoutedSource {
    async fn push(&self, path: &str, response: Result<Value, SourceError>) {
        self.routes
            .lock()
            .await
            .entry(path.to_string())
            .or_default()
            .push_back(response);
    }

    async fn requested_paths(&self) -> Vec<String> {
        self.requests
            .lock()
            .await
            .iter()
            .map(|r| r.path.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl JsonApiSource for RoutedSource {
    async fn get_page(&self, request: &PageRequest) -> Result<Value, SourceError> {
        self.requests.lock().await.push(request.clone());
        self.routes
            .lock()
            .await
            .get_mut(&request.path)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(json!({ "data": [] })))
    }
}

/// Never answers; signals once the first page has been requested.
#[derive(Clone, Default)]
struct StalledSource {
    requested: Arc<Notify>,
}

#[async_trait::async_trait]
impl JsonApiSource for StalledSource {
    async fn get_page(&self, _request: &PageRequest) -> Result<Value, SourceError> {
        self.requested.notify_one();
        std::future::pending().await
    }
}

fn options(kinds: &[&str]) -> SyncOptions {
    SyncOptions {
        kinds: kinds.iter().map(|k| k.to_string()).collect(),
        ..SyncOptions::default()
    }
}

fn company(id: &str, name: &str) -> Value {
    json!({ "type": "companies", "id": id, "attributes": { "name": name } })
}

fn deal(id: &str, name: Option<&str>, company_id: &str) -> Value {
    json!({
        "type": "deals",
        "id": id,
        "attributes": { "name": name, "probability": 50 },
        "relationships": {
            "company": { "data": { "type": "companies", "id": company_id } }
        }
    })
}

fn server_error() -> SourceError {
    SourceError::Status {
        status: 500,
        body: "internal error".into(),
    }
}

async fn syncer(source: &RoutedSource, kinds: &[&str]) -> Syncer {
    Syncer::new(Arc::new(source.clone()), setup_pool().await, options(kinds))
}

#[tokio::test]
async fn run_stores_parents_first_and_nulls_dangling_references() {
    let source = RoutedSource::default();
    source
        .push("companies", Ok(json!({ "data": [company("5", "Acme")] })))
        .await;
    source
        .push(
            "deals",
            Ok(json!({ "data": [deal("1", Some("Website"), "5"), deal("2", Some("Audit"), "999")] })),
        )
        .await;
    let syncer = syncer(&source, &["deals", "companies"]).await;

    let summary = syncer.trigger().await.unwrap();

    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(summary.code, 200);
    assert_eq!(source.requested_paths().await, vec!["companies", "deals"]);
    let deals = summary.kind("deals").unwrap();
    assert_eq!(deals.stored, 2);
    assert_eq!(deals.dangling_references, 1);
    assert_eq!(deals.status, KindStatus::Succeeded);

    let rows: Vec<(i64, Option<i64>)> =
        sqlx::query_as("SELECT id, company_id FROM deals ORDER BY id")
            .fetch_all(syncer.pool())
            .await
            .unwrap();
    assert_eq!(rows, vec![(1, Some(5)), (2, None)]);
    assert!(syncer.state().last_success_at().is_some());
    assert!(!syncer.state().lock().is_held());
}

#[tokio::test]
async fn repeated_runs_upsert_by_id() {
    let source = RoutedSource::default();
    source
        .push("companies", Ok(json!({ "data": [company("5", "Acme")] })))
        .await;
    source
        .push("companies", Ok(json!({ "data": [company("5", "Acme Ltd")] })))
        .await;
    let syncer = syncer(&source, &["companies"]).await;

    syncer.trigger().await.unwrap();
    syncer.trigger().await.unwrap();

    let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, name FROM companies")
        .fetch_all(syncer.pool())
        .await
        .unwrap();
    assert_eq!(rows, vec![(5, "Acme Ltd".to_string())]);
}

#[tokio::test]
async fn trigger_is_refused_while_a_run_holds_the_lock() {
    let source = RoutedSource::default();
    let syncer = syncer(&source, &["companies"]).await;
    let token = syncer.state().lock().try_acquire().unwrap();

    let err = syncer.trigger().await.unwrap_err();

    assert!(matches!(err, TriggerError::AlreadyRunning { since } if since == token.acquired_at));
    assert!(source.requested_paths().await.is_empty());
    assert!(syncer.snapshot().is_syncing);

    syncer.state().lock().release(&token);
    assert!(syncer.trigger().await.is_ok());
}

#[tokio::test]
async fn first_kind_failure_aborts_the_run() {
    let source = RoutedSource::default();
    source.push("companies", Err(server_error())).await;
    let syncer = syncer(&source, &["companies", "deals"]).await;

    let summary = syncer.trigger().await.unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.code, 500);
    assert_eq!(summary.kind("companies").unwrap().status, KindStatus::Failed);
    assert_eq!(summary.kind("deals").unwrap().status, KindStatus::Skipped);
    assert_eq!(source.requested_paths().await, vec!["companies"]);
    assert!(syncer.state().last_success_at().is_none());
    assert!(!syncer.state().lock().is_held());
}

#[tokio::test]
async fn later_kind_failure_degrades_but_continues() {
    let source = RoutedSource::default();
    source
        .push("companies", Ok(json!({ "data": [company("5", "Acme")] })))
        .await;
    source.push("people", Err(server_error())).await;
    source
        .push("deals", Ok(json!({ "data": [deal("1", Some("Website"), "5")] })))
        .await;
    let syncer = syncer(&source, &["companies", "people", "deals"]).await;

    let summary = syncer.trigger().await.unwrap();

    assert_eq!(summary.status, RunStatus::PartiallyFailed);
    assert_eq!(summary.code, 207);
    assert_eq!(summary.kind("people").unwrap().status, KindStatus::Failed);
    assert_eq!(summary.kind("deals").unwrap().stored, 1);
    assert!(syncer.state().last_success_at().is_some());
}

#[tokio::test]
async fn bad_records_are_counted_and_skipped() {
    let source = RoutedSource::default();
    source
        .push("companies", Ok(json!({ "data": [company("5", "Acme")] })))
        .await;
    source
        .push(
            "deals",
            Ok(json!({ "data": [deal("1", None, "5"), deal("2", Some("Audit"), "5")] })),
        )
        .await;
    let syncer = syncer(&source, &["companies", "deals"]).await;

    let summary = syncer.trigger().await.unwrap();

    let deals = summary.kind("deals").unwrap();
    assert_eq!(deals.stored, 1);
    assert_eq!(deals.failed, 1);
    assert_eq!(deals.status, KindStatus::Partial);
    assert_eq!(summary.status, RunStatus::PartiallyFailed);
    assert_eq!(db::count_rows(syncer.pool(), "deals").await.unwrap(), 1);
}

#[tokio::test]
async fn partial_fetch_marks_kind_partial() {
    let source = RoutedSource::default();
    let full_page: Vec<Value> = (1..=100).map(|i| company(&i.to_string(), "Co")).collect();
    source
        .push("companies", Ok(json!({ "data": full_page })))
        .await;
    source.push("companies", Err(server_error())).await;
    let syncer = syncer(&source, &["companies"]).await;

    let summary = syncer.trigger().await.unwrap();

    let companies = summary.kind("companies").unwrap();
    assert_eq!(companies.status, KindStatus::Partial);
    assert_eq!(companies.stored, 100);
    assert!(companies.error.as_deref().unwrap().contains("page 2"));
    assert_eq!(summary.status, RunStatus::PartiallyFailed);
}

#[tokio::test]
async fn status_reports_rows_and_relationship_population() {
    let source = RoutedSource::default();
    source
        .push("companies", Ok(json!({ "data": [company("5", "Acme")] })))
        .await;
    source
        .push(
            "deals",
            Ok(json!({ "data": [deal("1", Some("Website"), "5"), deal("2", Some("Audit"), "999")] })),
        )
        .await;
    let syncer = syncer(&source, &["companies", "deals"]).await;
    syncer.trigger().await.unwrap();

    let status = syncer.status().await.unwrap();

    assert!(!status.is_syncing);
    assert_eq!(status.phase, RunStatus::Succeeded);
    assert!(status.last_sync.is_some());
    assert_eq!(status.row_counts.get("companies"), Some(&1));
    assert_eq!(status.row_counts.get("deals"), Some(&2));
    let company_fk = status
        .relationship_stats
        .iter()
        .find(|s| s.table == "deals" && s.column == "company_id")
        .unwrap();
    assert_eq!((company_fk.populated, company_fk.total), (1, 2));
    assert_eq!(status.per_kind_counts.len(), 2);
}

#[tokio::test]
async fn hydrate_restores_last_success_from_history() {
    let source = RoutedSource::default();
    let pool = setup_pool().await;
    let first = Syncer::new(Arc::new(source.clone()), pool.clone(), options(&["companies"]));
    let summary = first.trigger().await.unwrap();

    let restarted = Syncer::new(Arc::new(source.clone()), pool, options(&["companies"]));
    assert!(restarted.state().last_success_at().is_none());
    restarted.hydrate().await.unwrap();

    let restored = restarted.state().last_success_at().unwrap();
    assert_eq!(restored.timestamp(), summary.finished_at.timestamp());
}

#[tokio::test]
async fn http_trigger_maps_outcomes_to_status_codes() {
    let source = RoutedSource::default();
    let syncer = Arc::new(syncer(&source, &["companies"]).await);
    let state = AppState {
        syncer: syncer.clone(),
    };

    let (code, body) = server::trigger_sync(State(state.clone())).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body.0["status"], "succeeded");

    let token = syncer.state().lock().try_acquire().unwrap();
    let (code, body) = server::trigger_sync(State(state.clone())).await;
    assert_eq!(code, StatusCode::CONFLICT);
    assert_eq!(body.0["status"], "already_running");
    assert_eq!(body.0["code"], 409);
    syncer.state().lock().release(&token);

    let (code, body) = server::sync_status(State(state)).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body.0["is_syncing"], false);
}

#[tokio::test]
async fn undecodable_entries_count_as_failed() {
    let source = RoutedSource::default();
    source
        .push(
            "companies",
            Ok(json!({ "data": [company("5", "Acme"), { "type": "companies", "id": null }] })),
        )
        .await;
    let syncer = syncer(&source, &["companies"]).await;

    let summary = syncer.trigger().await.unwrap();

    let companies = summary.kind("companies").unwrap();
    assert_eq!(companies.fetched, 2);
    assert_eq!(companies.stored, 1);
    assert_eq!(companies.failed, 1);
    assert_eq!(companies.status, KindStatus::Partial);
    assert_eq!(summary.status, RunStatus::PartiallyFailed);
}

#[tokio::test]
async fn dropped_run_releases_the_lock_and_is_recorded_failed() {
    let source = StalledSource::default();
    let requested = source.requested.clone();
    let syncer = Syncer::new(Arc::new(source), setup_pool().await, options(&["companies"]));

    {
        let run = syncer.trigger();
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => panic!("run finished without a response"),
            _ = requested.notified() => {}
        }
        assert!(syncer.snapshot().is_syncing);
    }

    let snapshot = syncer.snapshot();
    assert_eq!(snapshot.phase, RunStatus::Failed);
    assert!(!snapshot.is_syncing);
    let token = syncer.state().lock().try_acquire().unwrap();
    syncer.state().lock().release(&token);

    let mut recorded = None;
    for _ in 0..50 {
        let runs = db::recent_runs(syncer.pool(), 1).await.unwrap();
        if runs.first().map(|r| r.status) == Some(RunStatus::Failed) {
            recorded = runs.into_iter().next();
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let run = recorded.unwrap();
    assert!(run.finished_at.is_some());
}
