//! Drives one JSON:API collection endpoint to completion.
//!
//! Paging stops at the first page holding fewer than `page_size` resources.
//! A request error mentioning `include` retries the same page with the next,
//! smaller include spec, ending with no include at all. Any other error after
//! at least one good page ends the fetch with the pages collected so far.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::jsonapi::model::RawResource;
use crate::jsonapi::{JsonApiSource, PageRequest, SourceError};
use crate::resolve::IncludedIndex;

pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// What to do with a response that lacks a primary-data array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidPagePolicy {
    /// Request the same page number again, up to the configured retry limit.
    Retry,
    /// Fail the whole fetch for this kind.
    Abort,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{kind}: page {page} failed: {source}")]
    Source {
        kind: String,
        page: u32,
        #[source]
        source: SourceError,
    },
    #[error("{kind}: page {page} has no primary data array")]
    InvalidPage { kind: String, page: u32 },
}

/// Everything the fetcher needs to page through one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSpec {
    pub kind: String,
    pub path: String,
    pub page_size: u32,
    pub sort: Option<String>,
    pub include: Option<String>,
    /// Tried in order when the server rejects the current include spec.
    pub fallback_includes: Vec<String>,
    pub filters: Vec<(String, String)>,
    pub invalid_page_policy: InvalidPagePolicy,
    pub max_invalid_page_retries: u32,
}

impl FetchSpec {
    pub fn new(kind: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            path: path.into(),
            page_size: DEFAULT_PAGE_SIZE,
            sort: None,
            include: None,
            fallback_includes: Vec::new(),
            filters: Vec::new(),
            invalid_page_policy: InvalidPagePolicy::Retry,
            max_invalid_page_retries: 3,
        }
    }

    /// Include specs to try, in order, always ending with "no include".
    pub fn include_chain(&self) -> Vec<Option<String>> {
        let mut chain: Vec<Option<String>> = Vec::new();
        let specs = self
            .include
            .iter()
            .chain(self.fallback_includes.iter())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty());
        for spec in specs {
            let spec = Some(spec.to_string());
            if !chain.contains(&spec) {
                chain.push(spec);
            }
        }
        chain.push(None);
        chain
    }

    fn request(&self, page: u32, include: Option<&String>) -> PageRequest {
        PageRequest {
            path: self.path.clone(),
            page_number: page,
            page_size: self.page_size,
            sort: self.sort.clone(),
            include: include.cloned(),
            filters: self.filters.clone(),
        }
    }
}

/// Heuristic: does this failure look like the server rejecting `include`?
///
/// The upstream error taxonomy is not documented, so this is a plain
/// substring match on the body of an error response. Transport failures
/// never qualify. Keep every caller going through here so it can be
/// swapped for a structured error code later.
pub fn is_include_error(err: &SourceError) -> bool {
    match err {
        SourceError::Status { body, .. } => body.contains("include"),
        _ => false,
    }
}

/// Result of a completed (or partially completed) fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub resources: Vec<RawResource>,
    pub pages: u32,
    pub requests: u32,
    /// The include spec that produced the last good page.
    pub include_used: Option<String>,
    /// Set when paging stopped early on an error after some pages landed.
    pub partial_error: Option<String>,
    /// Source ids of `data` entries that could not be decoded.
    pub skipped: Vec<String>,
}

impl FetchOutcome {
    /// Paging stopped early or some entries were unreadable.
    pub fn is_partial(&self) -> bool {
        self.partial_error.is_some() || !self.skipped.is_empty()
    }
}

/// Progress notifications emitted while fetching.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    Page {
        kind: String,
        page: u32,
        fetched: usize,
        total: usize,
        included_types: BTreeMap<String, usize>,
    },
    IncludeFallback {
        kind: String,
        page: u32,
        from: Option<String>,
        to: Option<String>,
    },
    InvalidPage {
        kind: String,
        page: u32,
        attempt: u32,
    },
    Stopped {
        kind: String,
        page: u32,
        error: String,
    },
}

/// Receives fetch progress. Implementations must not block.
pub trait FetchObserver: Send + Sync {
    fn on_event(&self, event: &FetchEvent);
}

/// Default observer: forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl FetchObserver for TracingObserver {
    fn on_event(&self, event: &FetchEvent) {
        match event {
            FetchEvent::Page {
                kind,
                page,
                fetched,
                total,
                included_types,
            } => info!(
                kind = %kind,
                page,
                fetched,
                total,
                included = ?included_types,
                "page fetched"
            ),
            FetchEvent::IncludeFallback { kind, page, from, to } => warn!(
                kind = %kind,
                page,
                from = ?from,
                to = ?to,
                "include rejected; falling back"
            ),
            FetchEvent::InvalidPage { kind, page, attempt } => {
                warn!(kind = %kind, page, attempt, "page has no data array")
            }
            FetchEvent::Stopped { kind, page, error } => warn!(
                kind = %kind,
                page,
                error = %error,
                "paging stopped early; keeping earlier pages"
            ),
        }
    }
}

struct ParsedPage {
    primary: Vec<RawResource>,
    included: Vec<RawResource>,
    /// Length of the raw `data` array, decodable or not.
    raw_len: usize,
    skipped: Vec<String>,
}

fn entry_id(entry: &Value) -> String {
    match entry.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "<missing>".to_string(),
    }
}

/// Split a response body into primary resources and included resources.
/// `None` means the body had no primary-data array.
fn parse_page(body: &Value) -> Option<ParsedPage> {
    let data = body.get("data")?.as_array()?;
    let mut primary = Vec::with_capacity(data.len());
    let mut skipped = Vec::new();
    for entry in data {
        match serde_json::from_value(entry.clone()) {
            Ok(res) => primary.push(res),
            Err(err) => {
                let id = entry_id(entry);
                warn!(%err, id = %id, entry = %truncate(&entry.to_string(), 200), "skipping malformed resource");
                skipped.push(id);
            }
        }
    }
    let included = body
        .get("included")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|entry| match serde_json::from_value(entry.clone()) {
                    Ok(res) => Some(res),
                    Err(err) => {
                        warn!(
                            %err,
                            id = %entry_id(entry),
                            entry = %truncate(&entry.to_string(), 200),
                            "skipping malformed included resource"
                        );
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    Some(ParsedPage {
        primary,
        included,
        raw_len: data.len(),
        skipped,
    })
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push('…');
        out
    }
}

/// Page through `spec` and return every resource with its included graph attached.
pub async fn fetch_all(
    source: &dyn JsonApiSource,
    spec: &FetchSpec,
    observer: &dyn FetchObserver,
) -> Result<FetchOutcome, FetchError> {
    let chain = spec.include_chain();
    let mut include_at = 0usize;
    let mut page = 1u32;
    let mut invalid_attempts = 0u32;
    let mut outcome = FetchOutcome::default();

    loop {
        let include = chain[include_at].as_ref();
        let request = spec.request(page, include);
        outcome.requests += 1;

        let body = match source.get_page(&request).await {
            Ok(body) => body,
            Err(err) if is_include_error(&err) && include_at + 1 < chain.len() => {
                observer.on_event(&FetchEvent::IncludeFallback {
                    kind: spec.kind.clone(),
                    page,
                    from: include.cloned(),
                    to: chain[include_at + 1].clone(),
                });
                include_at += 1;
                continue;
            }
            Err(err) => {
                if outcome.pages == 0 {
                    return Err(FetchError::Source {
                        kind: spec.kind.clone(),
                        page,
                        source: err,
                    });
                }
                observer.on_event(&FetchEvent::Stopped {
                    kind: spec.kind.clone(),
                    page,
                    error: err.to_string(),
                });
                outcome.partial_error = Some(format!("page {}: {}", page, err));
                return Ok(outcome);
            }
        };

        let Some(parsed) = parse_page(&body) else {
            invalid_attempts += 1;
            observer.on_event(&FetchEvent::InvalidPage {
                kind: spec.kind.clone(),
                page,
                attempt: invalid_attempts,
            });
            let retry = spec.invalid_page_policy == InvalidPagePolicy::Retry
                && invalid_attempts <= spec.max_invalid_page_retries;
            if retry {
                continue;
            }
            if spec.invalid_page_policy == InvalidPagePolicy::Retry && outcome.pages > 0 {
                // Retries exhausted: same treatment as any other mid-fetch error.
                observer.on_event(&FetchEvent::Stopped {
                    kind: spec.kind.clone(),
                    page,
                    error: "no primary data array".into(),
                });
                outcome.partial_error = Some(format!("page {}: no primary data array", page));
                return Ok(outcome);
            }
            return Err(FetchError::InvalidPage {
                kind: spec.kind.clone(),
                page,
            });
        };
        invalid_attempts = 0;

        let index = IncludedIndex::build(&parsed.included);
        let fetched = parsed.primary.len();
        let mut primary = parsed.primary;
        if !index.is_empty() {
            for resource in primary.iter_mut() {
                index.enrich(resource);
            }
        }
        outcome.resources.extend(primary);
        outcome.skipped.extend(parsed.skipped);
        outcome.pages += 1;
        outcome.include_used = include.cloned();
        observer.on_event(&FetchEvent::Page {
            kind: spec.kind.clone(),
            page,
            fetched,
            total: outcome.resources.len(),
            included_types: index.type_counts(),
        });

        // Undecodable entries still count towards a full page.
        if parsed.raw_len < spec.page_size as usize {
            return Ok(outcome);
        }
        page += 1;
    }
}
