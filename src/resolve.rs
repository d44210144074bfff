//! Stitches a page's side-loaded `included` resources onto the relationships
//! of its primary resources.
//!
//! The index is flat (`"{type}:{id}"` → resource), so nested relationships of
//! included resources are resolved from the same index in a single pass. A
//! resource that is already being expanded higher up the current path is
//! attached without expanding it again, which keeps mutually-referencing
//! included resources (person ↔ company) from recursing forever.

use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::jsonapi::model::{Included, RawResource, RelationshipData};

/// Lookup of one response's `included` array.
#[derive(Debug, Default)]
pub struct IncludedIndex {
    entries: HashMap<String, RawResource>,
}

impl IncludedIndex {
    pub fn build(included: &[RawResource]) -> Self {
        let mut entries = HashMap::with_capacity(included.len());
        for resource in included {
            // Duplicate keys: the later entry wins.
            entries.insert(resource.key(), resource.clone());
        }
        let index = Self { entries };
        for (kind, count) in index.type_counts() {
            debug!(kind = %kind, count, "included resources indexed");
        }
        index
    }

    pub fn get(&self, key: &str) -> Option<&RawResource> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of indexed resources per JSON:API type.
    pub fn type_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for resource in self.entries.values() {
            *counts.entry(resource.kind.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Attach included resources to every relationship of `resource`,
    /// recursing into the attached copies.
    pub fn enrich(&self, resource: &mut RawResource) {
        let mut path = vec![resource.key()];
        self.enrich_on_path(resource, &mut path);
    }

    fn enrich_on_path(&self, resource: &mut RawResource, path: &mut Vec<String>) {
        for relationship in resource.relationships.values_mut() {
            let included = match &relationship.data {
                Some(RelationshipData::One(ident)) => self
                    .expand(&ident.key(), path)
                    .map(|found| Included::One(Box::new(found))),
                Some(RelationshipData::Many(idents)) => Some(Included::Many(
                    idents
                        .iter()
                        .filter_map(|ident| self.expand(&ident.key(), path))
                        .collect(),
                )),
                None => None,
            };
            if included.is_some() {
                relationship.included = included;
            }
        }
    }

    fn expand(&self, key: &str, path: &mut Vec<String>) -> Option<RawResource> {
        let mut found = self.entries.get(key)?.clone();
        if !path.iter().any(|k| k == key) {
            path.push(key.to_string());
            self.enrich_on_path(&mut found, path);
            path.pop();
        }
        Some(found)
    }
}

/// Resolve `included` onto `primary` and return the enriched resources.
/// Without included resources the input comes back untouched.
pub fn resolve(mut primary: Vec<RawResource>, included: &[RawResource]) -> Vec<RawResource> {
    if included.is_empty() {
        return primary;
    }
    let index = IncludedIndex::build(included);
    for resource in primary.iter_mut() {
        index.enrich(resource);
    }
    primary
}
