use super::model::{PersistReport, RecordFailure, SyncRunRow};
use crate::catalog::{self, IdType, KindSpec};
use crate::fetch::truncate;
use crate::jsonapi::model::RawResource;
use crate::mapping::{map_resource, MappingError, PersistableRecord, SqlValue};
use crate::model::{RelationshipStat, RunStatus, SyncSummary};
use crate::references::{resolve_record, DanglingReference};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::error::ErrorKind;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    let mut options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database URL {}", database_url))?
        .create_if_missing(true)
        .foreign_keys(true);
    let mut pool_options = SqlitePoolOptions::new();
    if in_memory {
        // Every connection to `:memory:` is a separate database; keep exactly one alive.
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    } else {
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        pool_options = pool_options.max_connections(5);
    }
    let pool = pool_options.connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    ensure_kind_tables(pool, catalog::all()).await?;
    Ok(())
}

/// DDL for one kind's table. Foreign-key columns take the target's id type.
pub fn create_table_sql(spec: &KindSpec) -> String {
    let mut columns = vec![match spec.id_type {
        IdType::Integer => "\"id\" INTEGER PRIMARY KEY".to_string(),
        IdType::Text => "\"id\" TEXT PRIMARY KEY NOT NULL".to_string(),
    }];
    for field in spec.fields {
        columns.push(format!("\"{}\" {}", field.column, field.ty.sql_type()));
    }
    for fk in spec.foreign_keys {
        let id_type = catalog::find_by_table(fk.target_table)
            .map(|target| target.id_type)
            .unwrap_or(IdType::Text);
        columns.push(format!(
            "\"{}\" {} REFERENCES \"{}\"(\"id\")",
            fk.column,
            id_type.sql_type(),
            fk.target_table
        ));
    }
    columns.push("\"synced_at\" TEXT NOT NULL".to_string());
    format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (\n    {}\n)",
        spec.table,
        columns.join(",\n    ")
    )
}

#[instrument(skip_all)]
pub async fn ensure_kind_tables(pool: &Pool, specs: &[KindSpec]) -> Result<()> {
    for spec in specs {
        sqlx::query(&create_table_sql(spec))
            .execute(pool)
            .await
            .with_context(|| format!("failed to create table {}", spec.table))?;
    }
    Ok(())
}

/// Errors that lose the storage connection itself. Everything else is a
/// problem with one record.
pub fn is_infrastructure_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => match db.kind() {
            ErrorKind::UniqueViolation
            | ErrorKind::ForeignKeyViolation
            | ErrorKind::NotNullViolation
            | ErrorKind::CheckViolation => false,
            // SQLITE_TOOBIG, SQLITE_MISMATCH, SQLITE_RANGE
            _ => !matches!(db.code().as_deref(), Some("18") | Some("20") | Some("25")),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Configuration(_) => true,
        _ => false,
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub fn upsert_sql(record: &PersistableRecord) -> String {
    let mut columns = vec!["id"];
    columns.extend(record.columns.iter().map(|(name, _)| *name));
    columns.push("synced_at");
    let quoted: Vec<String> = columns.iter().map(|c| format!("\"{}\"", c)).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let updates: Vec<String> = columns
        .iter()
        .skip(1)
        .map(|c| format!("\"{0}\" = excluded.\"{0}\"", c))
        .collect();
    format!(
        "INSERT INTO \"{}\" ({}) VALUES ({}) ON CONFLICT(\"id\") DO UPDATE SET {}",
        record.table,
        quoted.join(", "),
        placeholders,
        updates.join(", ")
    )
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Integer(i) => query.bind(*i),
        SqlValue::Real(f) => query.bind(*f),
        SqlValue::Text(s) => query.bind(s.clone()),
        SqlValue::Bool(b) => query.bind(*b),
    }
}

/// Insert the row, or overwrite every column of the existing row with the same id.
pub async fn upsert_record(
    conn: &mut SqliteConnection,
    record: &PersistableRecord,
) -> Result<(), sqlx::Error> {
    let sql = upsert_sql(record);
    let mut query = bind_value(sqlx::query(&sql), &record.id);
    for (_, value) in &record.columns {
        query = bind_value(query, value);
    }
    query
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn persist_resource(
    conn: &mut SqliteConnection,
    spec: &KindSpec,
    resource: &RawResource,
) -> Result<Vec<DanglingReference>, RecordError> {
    let mapped = map_resource(spec, resource)?;
    let (row, dangling) = resolve_record(mapped, &mut *conn).await?;
    upsert_record(&mut *conn, &row).await?;
    Ok(dangling)
}

/// Store one kind's resources in a single transaction.
///
/// Bad records are logged, counted, and skipped. An infrastructure error
/// rolls back the whole kind and is returned.
#[instrument(skip_all, fields(kind = spec.name))]
pub async fn persist_kind(
    pool: &Pool,
    spec: &KindSpec,
    resources: &[RawResource],
) -> Result<PersistReport, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut report = PersistReport::default();
    for resource in resources {
        match persist_resource(&mut *tx, spec, resource).await {
            Ok(dangling) => {
                report.stored += 1;
                report.dangling.extend(dangling);
            }
            Err(RecordError::Database(err)) if is_infrastructure_error(&err) => {
                warn!(kind = spec.name, id = %resource.id, %err, "storage failure; rolling back kind");
                return Err(err);
            }
            Err(err) => {
                warn!(
                    kind = spec.name,
                    id = %resource.id,
                    %err,
                    attributes = %truncate(&serde_json::Value::Object(resource.attributes.clone()).to_string(), 300),
                    "record skipped"
                );
                report.failures.push(RecordFailure {
                    id: resource.id.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
    tx.commit().await?;
    info!(
        kind = spec.name,
        stored = report.stored,
        failed = report.failed(),
        dangling = report.dangling.len(),
        "kind stored"
    );
    Ok(report)
}

pub async fn count_rows(pool: &Pool, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM \"{}\"", table);
    let count: i64 = sqlx::query_scalar(&sql).fetch_one(pool).await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn row_counts(pool: &Pool, specs: &[&KindSpec]) -> Result<BTreeMap<String, i64>> {
    let mut counts = BTreeMap::new();
    for spec in specs {
        counts.insert(spec.name.to_string(), count_rows(pool, spec.table).await?);
    }
    Ok(counts)
}

/// How many rows of each table have each foreign key populated.
#[instrument(skip_all)]
pub async fn relationship_stats(pool: &Pool, specs: &[&KindSpec]) -> Result<Vec<RelationshipStat>> {
    let mut stats = Vec::new();
    for spec in specs {
        for fk in spec.foreign_keys {
            let sql = format!(
                "SELECT COUNT(\"{}\") AS populated, COUNT(*) AS total FROM \"{}\"",
                fk.column, spec.table
            );
            let row = sqlx::query(&sql).fetch_one(pool).await?;
            stats.push(RelationshipStat {
                table: spec.table.to_string(),
                column: fk.column.to_string(),
                populated: row.get("populated"),
                total: row.get("total"),
            });
        }
    }
    Ok(stats)
}

#[instrument(skip_all)]
pub async fn record_run_started(pool: &Pool, run_id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
    sqlx::query("INSERT INTO sync_runs (id, started_at, status) VALUES (?, ?, ?)")
        .bind(run_id.to_string())
        .bind(started_at.to_rfc3339())
        .bind(RunStatus::Running.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn record_run_finished(pool: &Pool, summary: &SyncSummary) -> Result<()> {
    let body = serde_json::to_string(summary)?;
    sqlx::query("UPDATE sync_runs SET finished_at = ?, status = ?, summary = ? WHERE id = ?")
        .bind(summary.finished_at.to_rfc3339())
        .bind(summary.status.as_str())
        .bind(body)
        .bind(summary.run_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Close out one run that stopped without a result, e.g. a cancelled trigger.
#[instrument(skip_all)]
pub async fn record_run_abandoned(pool: &Pool, run_id: Uuid) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE sync_runs SET finished_at = ?, status = ? WHERE id = ? AND status = ?",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(RunStatus::Failed.as_str())
    .bind(run_id.to_string())
    .bind(RunStatus::Running.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Runs left `running` by a crashed process are marked failed.
#[instrument(skip_all)]
pub async fn fail_interrupted_runs(pool: &Pool) -> Result<u64> {
    let res = sqlx::query("UPDATE sync_runs SET status = ? WHERE status = ?")
        .bind(RunStatus::Failed.as_str())
        .bind(RunStatus::Running.as_str())
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

/// Finish time of the newest run that counts as a success.
#[instrument(skip_all)]
pub async fn last_successful_sync(pool: &Pool) -> Result<Option<DateTime<Utc>>> {
    let finished: Option<String> = sqlx::query_scalar(
        "SELECT finished_at FROM sync_runs WHERE status IN (?, ?) AND finished_at IS NOT NULL ORDER BY finished_at DESC LIMIT 1",
    )
    .bind(RunStatus::Succeeded.as_str())
    .bind(RunStatus::PartiallyFailed.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(finished
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc)))
}

pub async fn recent_runs(pool: &Pool, limit: i64) -> Result<Vec<SyncRunRow>> {
    let rows = sqlx::query(
        "SELECT id, started_at, finished_at, status FROM sync_runs ORDER BY started_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let parse = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    };
    let runs = rows
        .into_iter()
        .filter_map(|row| {
            let id: String = row.get("id");
            let started: String = row.get("started_at");
            let finished: Option<String> = row.get("finished_at");
            let status: String = row.get("status");
            Some(SyncRunRow {
                id,
                started_at: parse(&started)?,
                finished_at: finished.as_deref().and_then(parse),
                status: RunStatus::parse_status(&status)?,
            })
        })
        .collect();
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_sqlite_url_keeps_memory_and_normalizes_paths() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        let td = tempfile::tempdir().unwrap();
        let db = td.path().join("nested/dir/app.db");
        let url = format!("sqlite:{}?mode=rwc", db.display());
        let out = prepare_sqlite_url(&url);
        assert_eq!(out, format!("sqlite://{}?mode=rwc", db.display()));
        assert!(td.path().join("nested/dir").exists());
    }

    #[test]
    fn create_table_sql_uses_target_id_types() {
        let sql = create_table_sql(catalog::find("time_entry_versions").unwrap());
        assert!(sql.contains("\"id\" TEXT PRIMARY KEY NOT NULL"));
        assert!(sql.contains("\"creator_id\" INTEGER REFERENCES \"people\"(\"id\")"));
        assert!(sql.contains("\"object_changes\" TEXT"));
        assert!(sql.ends_with("\"synced_at\" TEXT NOT NULL\n)"));
    }

    #[test]
    fn upsert_sql_updates_every_column_but_id() {
        let record = PersistableRecord::new(
            "companies",
            SqlValue::Integer(1),
            vec![("name", SqlValue::Text("Acme".into())), ("subsidiary_id", SqlValue::Null)],
        );
        assert_eq!(
            upsert_sql(&record),
            "INSERT INTO \"companies\" (\"id\", \"name\", \"subsidiary_id\", \"synced_at\") VALUES (?, ?, ?, ?) \
             ON CONFLICT(\"id\") DO UPDATE SET \"name\" = excluded.\"name\", \
             \"subsidiary_id\" = excluded.\"subsidiary_id\", \"synced_at\" = excluded.\"synced_at\""
        );
    }

    #[test]
    fn pool_errors_are_infrastructure() {
        assert!(is_infrastructure_error(&sqlx::Error::PoolClosed));
        assert!(is_infrastructure_error(&sqlx::Error::PoolTimedOut));
        assert!(!is_infrastructure_error(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn foreign_key_violation_is_a_record_error() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let record = PersistableRecord::new(
            "people",
            SqlValue::Integer(1),
            vec![("company_id", SqlValue::Text("404".into()))],
        );
        let mut conn = pool.acquire().await.unwrap();
        let err = upsert_record(&mut conn, &record).await.unwrap_err();
        assert!(!is_infrastructure_error(&err), "{err:?}");
    }

    #[tokio::test]
    async fn run_history_tracks_last_success() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        assert!(last_successful_sync(&pool).await.unwrap().is_none());

        let started = Utc::now();
        let run_id = Uuid::new_v4();
        record_run_started(&pool, run_id, started).await.unwrap();
        let summary = SyncSummary {
            run_id,
            message: "done".into(),
            status: RunStatus::PartiallyFailed,
            code: 207,
            execution_time: 1.5,
            started_at: started,
            finished_at: started,
            stats: Vec::new(),
        };
        record_run_finished(&pool, &summary).await.unwrap();

        let last = last_successful_sync(&pool).await.unwrap().unwrap();
        assert_eq!(last.timestamp(), started.timestamp());

        let interrupted = Uuid::new_v4();
        record_run_started(&pool, interrupted, Utc::now()).await.unwrap();
        assert_eq!(fail_interrupted_runs(&pool).await.unwrap(), 1);
        assert!(!record_run_abandoned(&pool, interrupted).await.unwrap());
        let runs = recent_runs(&pool, 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().any(|r| r.status == RunStatus::Failed));
    }
}
