//! JSON:API document shapes as returned by the upstream service.
//!
//! Attributes stay as `serde_json::Value` maps, but every read goes through
//! the typed accessors on [`RawResource`] so "missing key" consistently means
//! `None` instead of a panic or a silent default.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A `{type, id}` pair pointing at another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
}

impl ResourceIdentifier {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Key used by the included index: `"{type}:{id}"`.
    pub fn key(&self) -> String {
        index_key(&self.kind, &self.id)
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

pub fn index_key(kind: &str, id: &str) -> String {
    format!("{}:{}", kind, id)
}

/// Linkage data of a relationship: to-one or to-many.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationshipData {
    One(ResourceIdentifier),
    Many(Vec<ResourceIdentifier>),
}

/// Included resources attached to a relationship after resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Included {
    One(Box<RawResource>),
    Many(Vec<RawResource>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// `None` covers both `"data": null` and a relationship that only carries links/meta.
    #[serde(default)]
    pub data: Option<RelationshipData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    /// Filled by the resolver; never sent by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub included: Option<Included>,
}

impl Relationship {
    pub fn to_one(kind: &str, id: &str) -> Self {
        Self {
            data: Some(RelationshipData::One(ResourceIdentifier::new(kind, id))),
            ..Default::default()
        }
    }

    pub fn to_many(ids: Vec<ResourceIdentifier>) -> Self {
        Self {
            data: Some(RelationshipData::Many(ids)),
            ..Default::default()
        }
    }

    /// Identifier of a to-one relationship.
    pub fn single(&self) -> Option<&ResourceIdentifier> {
        match &self.data {
            Some(RelationshipData::One(ident)) => Some(ident),
            _ => None,
        }
    }

    /// Resolved included resource of a to-one relationship.
    pub fn included_one(&self) -> Option<&RawResource> {
        match &self.included {
            Some(Included::One(res)) => Some(res),
            _ => None,
        }
    }

    pub fn included_many(&self) -> &[RawResource] {
        match &self.included {
            Some(Included::Many(list)) => list,
            _ => &[],
        }
    }
}

/// One JSON:API resource object (primary data or an `included` entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub relationships: BTreeMap<String, Relationship>,
}

impl RawResource {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            attributes: Map::new(),
            relationships: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: Value) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn with_relationship(mut self, name: &str, relationship: Relationship) -> Self {
        self.relationships.insert(name.to_string(), relationship);
        self
    }

    pub fn key(&self) -> String {
        index_key(&self.kind, &self.id)
    }

    /// Look up an attribute by dotted path (`"address.city"`). JSON `null`
    /// is reported as absent.
    pub fn attr(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.attributes.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    pub fn attr_str(&self, path: &str) -> Option<&str> {
        self.attr(path).and_then(Value::as_str)
    }

    /// Integers are accepted as JSON numbers or numeric strings.
    pub fn attr_i64(&self, path: &str) -> Option<i64> {
        match self.attr(path)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn attr_f64(&self, path: &str) -> Option<f64> {
        match self.attr(path)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn attr_bool(&self, path: &str) -> Option<bool> {
        self.attr(path).and_then(Value::as_bool)
    }

    pub fn attr_datetime(&self, path: &str) -> Option<DateTime<Utc>> {
        self.attr_str(path)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn attr_date(&self, path: &str) -> Option<NaiveDate> {
        self.attr_str(path)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.get(name)
    }

    /// Id of a to-one relationship, if linked.
    pub fn relationship_id(&self, name: &str) -> Option<&str> {
        self.relationship(name)
            .and_then(Relationship::single)
            .map(|ident| ident.id.as_str())
    }

    /// Walk resolved to-one included resources along `path`
    /// (`["service", "deal"]` → the deal included under the service).
    pub fn included_at(&self, path: &[&str]) -> Option<&RawResource> {
        let (first, rest) = path.split_first()?;
        let mut current = self.relationship(first)?.included_one()?;
        for name in rest {
            current = current.relationship(name)?.included_one()?;
        }
        Some(current)
    }
}

/// The two primary-data shapes a response may carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryData {
    Many(Vec<RawResource>),
    One(Box<RawResource>),
}

/// A single-resource or collection document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub data: PrimaryData,
    #[serde(default)]
    pub included: Vec<RawResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}
