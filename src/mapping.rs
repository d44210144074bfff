//! Table-driven conversion of a [`RawResource`] into a row.
//!
//! Every kind is described by a field table and a foreign-key table (see
//! `catalog`). Mapping is two-stage: [`map_resource`] produces a
//! [`MappedRecord`] whose foreign keys are still raw ids, and only
//! `references::resolve_record` can turn that into a [`PersistableRecord`],
//! so an unchecked reference never reaches an upsert.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::catalog::{IdType, KindSpec};
use crate::jsonapi::model::RawResource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    /// Stored as JSON text.
    Json,
    /// RFC 3339, normalized to UTC.
    Timestamp,
    /// `YYYY-MM-DD`.
    Date,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text | ColumnType::Json | ColumnType::Timestamp | ColumnType::Date => {
                "TEXT"
            }
        }
    }

    fn name(self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Real => "real",
            ColumnType::Boolean => "boolean",
            ColumnType::Json => "json",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Date => "date",
        }
    }
}

/// Where a column's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    /// Dotted attribute path on the resource itself.
    Attribute(&'static str),
    /// Attribute of a resolved included resource reached through to-one
    /// relationships. The attribute `"id"` yields the included resource's id.
    Included {
        path: &'static [&'static str],
        attribute: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMap {
    pub column: &'static str,
    pub source: FieldSource,
    pub ty: ColumnType,
    pub required: bool,
}

impl FieldMap {
    /// Column fed by the attribute of the same name.
    pub const fn attr(column: &'static str, ty: ColumnType) -> Self {
        Self {
            column,
            source: FieldSource::Attribute(column),
            ty,
            required: false,
        }
    }

    pub const fn included(
        column: &'static str,
        path: &'static [&'static str],
        attribute: &'static str,
        ty: ColumnType,
    ) -> Self {
        Self {
            column,
            source: FieldSource::Included { path, attribute },
            ty,
            required: false,
        }
    }

    /// Read the value from a different attribute path.
    pub const fn at(mut self, attribute: &'static str) -> Self {
        self.source = FieldSource::Attribute(attribute);
        self
    }

    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// A nullable column holding the id of a row in another kind's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: &'static str,
    /// Relationship names; all but the last are walked through resolved
    /// included resources, the last one supplies the `{type, id}`.
    pub path: &'static [&'static str],
    pub target_table: &'static str,
}

impl ForeignKey {
    pub const fn new(
        column: &'static str,
        path: &'static [&'static str],
        target_table: &'static str,
    ) -> Self {
        Self {
            column,
            path,
            target_table,
        }
    }

    pub fn relationship_name(&self) -> String {
        self.path.join(".")
    }

    /// Raw id the relationship points at, if any.
    pub fn raw_id<'a>(&self, resource: &'a RawResource) -> Option<&'a str> {
        let (last, hops) = self.path.split_last()?;
        let holder = if hops.is_empty() {
            resource
        } else {
            resource.included_at(hops)?
        };
        holder.relationship_id(last)
    }
}

/// A scalar ready to be bound into SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum MappingError {
    #[error("required field `{column}` is missing")]
    MissingField { column: &'static str },
    #[error("field `{column}` expected {expected}, got {found}")]
    TypeMismatch {
        column: &'static str,
        expected: &'static str,
        found: String,
    },
    #[error("id `{id}` is not a valid {expected} id")]
    InvalidId { id: String, expected: &'static str },
    #[error("resource type `{found}` does not belong to kind `{kind}`")]
    WrongType { kind: &'static str, found: String },
}

/// Foreign key as read from the resource, before the existence check.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingReference {
    pub column: &'static str,
    pub relationship: String,
    pub target_table: &'static str,
    pub raw_id: Option<String>,
}

/// Mapped columns plus foreign keys that still need checking.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub kind: &'static str,
    pub table: &'static str,
    pub id: SqlValue,
    pub source_id: String,
    pub columns: Vec<(&'static str, SqlValue)>,
    pub references: Vec<PendingReference>,
}

/// A row whose foreign keys are all either existing ids or null.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistableRecord {
    pub table: &'static str,
    pub id: SqlValue,
    pub columns: Vec<(&'static str, SqlValue)>,
}

impl PersistableRecord {
    pub(crate) fn new(table: &'static str, id: SqlValue, columns: Vec<(&'static str, SqlValue)>) -> Self {
        Self { table, id, columns }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, value)| value)
    }
}

pub fn map_resource(spec: &KindSpec, resource: &RawResource) -> Result<MappedRecord, MappingError> {
    if resource.kind != spec.resource_type {
        return Err(MappingError::WrongType {
            kind: spec.name,
            found: resource.kind.clone(),
        });
    }
    let id = match spec.id_type {
        IdType::Text => SqlValue::Text(resource.id.clone()),
        IdType::Integer => resource
            .id
            .trim()
            .parse()
            .map(SqlValue::Integer)
            .map_err(|_| MappingError::InvalidId {
                id: resource.id.clone(),
                expected: "integer",
            })?,
    };

    let mut columns = Vec::with_capacity(spec.fields.len());
    for field in spec.fields {
        let value = match lookup(resource, &field.source) {
            Some(raw) => convert(field, &raw)?,
            None => SqlValue::Null,
        };
        if field.required && value.is_null() {
            return Err(MappingError::MissingField {
                column: field.column,
            });
        }
        columns.push((field.column, value));
    }

    let references = spec
        .foreign_keys
        .iter()
        .map(|fk| PendingReference {
            column: fk.column,
            relationship: fk.relationship_name(),
            target_table: fk.target_table,
            raw_id: fk.raw_id(resource).map(str::to_string),
        })
        .collect();

    Ok(MappedRecord {
        kind: spec.name,
        table: spec.table,
        id,
        source_id: resource.id.clone(),
        columns,
        references,
    })
}

fn lookup(resource: &RawResource, source: &FieldSource) -> Option<Value> {
    match source {
        FieldSource::Attribute(path) => resource.attr(path).cloned(),
        FieldSource::Included { path, attribute } => {
            let related = resource.included_at(path)?;
            if *attribute == "id" {
                Some(Value::String(related.id.clone()))
            } else {
                related.attr(attribute).cloned()
            }
        }
    }
}

fn convert(field: &FieldMap, raw: &Value) -> Result<SqlValue, MappingError> {
    let mismatch = || MappingError::TypeMismatch {
        column: field.column,
        expected: field.ty.name(),
        found: crate::fetch::truncate(&raw.to_string(), 60),
    };
    let value = match (field.ty, raw) {
        (ColumnType::Json, v) => SqlValue::Text(v.to_string()),
        (ColumnType::Text, Value::String(s)) => SqlValue::Text(s.clone()),
        (ColumnType::Text, Value::Number(n)) => SqlValue::Text(n.to_string()),
        (ColumnType::Text, Value::Bool(b)) => SqlValue::Text(b.to_string()),
        (ColumnType::Integer, Value::Number(n)) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => SqlValue::Integer(f as i64),
                _ => return Err(mismatch()),
            },
        },
        (ColumnType::Integer, Value::String(s)) => {
            SqlValue::Integer(s.trim().parse().map_err(|_| mismatch())?)
        }
        (ColumnType::Real, Value::Number(n)) => SqlValue::Real(n.as_f64().ok_or_else(mismatch)?),
        (ColumnType::Real, Value::String(s)) => {
            SqlValue::Real(s.trim().parse().map_err(|_| mismatch())?)
        }
        (ColumnType::Boolean, Value::Bool(b)) => SqlValue::Bool(*b),
        (ColumnType::Boolean, Value::Number(n)) if n.as_i64() == Some(0) => SqlValue::Bool(false),
        (ColumnType::Boolean, Value::Number(n)) if n.as_i64() == Some(1) => SqlValue::Bool(true),
        (ColumnType::Boolean, Value::String(s)) => match s.as_str() {
            "true" => SqlValue::Bool(true),
            "false" => SqlValue::Bool(false),
            _ => return Err(mismatch()),
        },
        (ColumnType::Timestamp, Value::String(s)) => {
            let parsed = DateTime::parse_from_rfc3339(s).map_err(|_| mismatch())?;
            SqlValue::Text(
                parsed
                    .with_timezone(&Utc)
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            )
        }
        (ColumnType::Date, Value::String(s)) => {
            let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| mismatch())?;
            SqlValue::Text(date.format("%Y-%m-%d").to_string())
        }
        _ => return Err(mismatch()),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::jsonapi::model::{Included, Relationship};
    use serde_json::json;

    fn deals() -> &'static KindSpec {
        catalog::find("deals").unwrap()
    }

    #[test]
    fn maps_attributes_and_raw_references() {
        let resource = RawResource::new("deals", "12")
            .with_attribute("name", json!("Website"))
            .with_attribute("probability", json!("80"))
            .with_attribute("date", json!("2024-02-01"))
            .with_relationship("company", Relationship::to_one("companies", "5"));

        let mapped = map_resource(deals(), &resource).unwrap();
        assert_eq!(mapped.id, SqlValue::Integer(12));
        let col = |name: &str| {
            mapped
                .columns
                .iter()
                .find(|(c, _)| *c == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(col("name"), SqlValue::Text("Website".into()));
        assert_eq!(col("probability"), SqlValue::Integer(80));
        assert_eq!(col("date"), SqlValue::Text("2024-02-01".into()));
        assert_eq!(col("closed_at"), SqlValue::Null);

        let company = mapped
            .references
            .iter()
            .find(|r| r.column == "company_id")
            .unwrap();
        assert_eq!(company.raw_id.as_deref(), Some("5"));
        assert_eq!(company.target_table, "companies");
        let project = mapped
            .references
            .iter()
            .find(|r| r.column == "project_id")
            .unwrap();
        assert!(project.raw_id.is_none());
    }

    #[test]
    fn missing_required_field_fails_the_record() {
        let resource = RawResource::new("deals", "12");
        assert_eq!(
            map_resource(deals(), &resource).unwrap_err(),
            MappingError::MissingField { column: "name" }
        );
    }

    #[test]
    fn type_mismatch_is_reported() {
        let resource = RawResource::new("deals", "12")
            .with_attribute("name", json!("x"))
            .with_attribute("probability", json!("eighty"));
        assert!(matches!(
            map_resource(deals(), &resource),
            Err(MappingError::TypeMismatch { column: "probability", .. })
        ));
    }

    #[test]
    fn non_numeric_id_rejected_for_integer_kinds() {
        let resource = RawResource::new("deals", "abc").with_attribute("name", json!("x"));
        assert!(matches!(
            map_resource(deals(), &resource),
            Err(MappingError::InvalidId { .. })
        ));
    }

    #[test]
    fn timestamps_normalize_to_utc() {
        let field = FieldMap::attr("closed_at", ColumnType::Timestamp);
        let value = convert(&field, &json!("2024-05-01T12:30:00.000+02:00")).unwrap();
        assert_eq!(value, SqlValue::Text("2024-05-01T10:30:00Z".into()));
    }

    #[test]
    fn json_columns_keep_structure() {
        let field = FieldMap::attr("tag_list", ColumnType::Json);
        let value = convert(&field, &json!(["a", "b"])).unwrap();
        assert_eq!(value, SqlValue::Text(r#"["a","b"]"#.into()));
    }

    #[test]
    fn multi_hop_foreign_key_reads_included_graph() {
        let fk = ForeignKey::new("deal_id", &["service", "deal"], "deals");
        let mut entry = RawResource::new("time_entries", "1")
            .with_relationship("service", Relationship::to_one("services", "7"));
        assert_eq!(fk.raw_id(&entry), None);

        let service = RawResource::new("services", "7")
            .with_relationship("deal", Relationship::to_one("deals", "3"));
        if let Some(rel) = entry.relationships.get_mut("service") {
            rel.included = Some(Included::One(Box::new(service)));
        }
        assert_eq!(fk.raw_id(&entry), Some("3"));
        assert_eq!(fk.relationship_name(), "service.deal");
    }
}
