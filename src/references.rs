//! Foreign-key existence checks against what is already stored locally.
//!
//! A reference to a row that is not in the target table is nulled and
//! reported; it never fails the owning record.

use async_trait::async_trait;
use sqlx::SqliteConnection;
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::mapping::{MappedRecord, PersistableRecord, SqlValue};

/// Answers "is there a row with this id in this table?".
#[async_trait]
pub trait ReferenceLookup: Send {
    async fn exists(&mut self, table: &str, id: &str) -> Result<bool, sqlx::Error>;
}

#[async_trait]
impl ReferenceLookup for SqliteConnection {
    async fn exists(&mut self, table: &str, id: &str) -> Result<bool, sqlx::Error> {
        // Table names only ever come from the static catalog.
        let sql = format!("SELECT 1 FROM \"{}\" WHERE id = ? LIMIT 1", table);
        let found: Option<i64> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(&mut *self)
            .await?;
        Ok(found.is_some())
    }
}

/// In-memory lookup keyed by table name.
#[derive(Debug, Default, Clone)]
pub struct KnownIds {
    tables: HashMap<String, HashSet<String>>,
}

impl KnownIds {
    pub fn insert(&mut self, table: &str, id: &str) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string());
    }
}

#[async_trait]
impl ReferenceLookup for KnownIds {
    async fn exists(&mut self, table: &str, id: &str) -> Result<bool, sqlx::Error> {
        Ok(self
            .tables
            .get(table)
            .map(|ids| ids.contains(id))
            .unwrap_or(false))
    }
}

/// A reference that was nulled because its target is not stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingReference {
    pub owner_kind: String,
    pub owner_id: String,
    pub relationship: String,
    pub missing_id: String,
}

/// Resolve one relationship's raw id against local storage.
///
/// Returns the id when the target row exists, `None` when there is no
/// reference or the target is missing. Errors only on lookup failure.
pub async fn resolve_foreign_key<L>(
    owner_kind: &str,
    owner_id: &str,
    relationship: &str,
    target_table: &str,
    raw_id: Option<&str>,
    lookup: &mut L,
) -> Result<(Option<String>, Option<DanglingReference>), sqlx::Error>
where
    L: ReferenceLookup + ?Sized,
{
    let Some(id) = raw_id else {
        return Ok((None, None));
    };
    if lookup.exists(target_table, id).await? {
        return Ok((Some(id.to_string()), None));
    }
    warn!(
        kind = owner_kind,
        id = owner_id,
        relationship,
        missing_id = id,
        target = target_table,
        "dangling reference nulled"
    );
    Ok((
        None,
        Some(DanglingReference {
            owner_kind: owner_kind.to_string(),
            owner_id: owner_id.to_string(),
            relationship: relationship.to_string(),
            missing_id: id.to_string(),
        }),
    ))
}

/// Check every foreign key of `record` and produce the persistable row.
/// Each reference is handled on its own; a missing target only nulls that column.
pub async fn resolve_record<L>(
    record: MappedRecord,
    lookup: &mut L,
) -> Result<(PersistableRecord, Vec<DanglingReference>), sqlx::Error>
where
    L: ReferenceLookup + ?Sized,
{
    let mut columns = record.columns;
    let mut dangling = Vec::new();
    for reference in &record.references {
        let (resolved, missing) = resolve_foreign_key(
            record.kind,
            &record.source_id,
            &reference.relationship,
            reference.target_table,
            reference.raw_id.as_deref(),
            lookup,
        )
        .await?;
        columns.push((
            reference.column,
            resolved.map(SqlValue::Text).unwrap_or(SqlValue::Null),
        ));
        dangling.extend(missing);
    }
    Ok((
        PersistableRecord::new(record.table, record.id, columns),
        dangling,
    ))
}
