//! Resource kinds synced from the upstream API, in dependency order.
//!
//! A kind's foreign keys may only point at kinds listed before it, so a
//! front-to-back walk always stores parents before children.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::config::SyncOptions;
use crate::fetch::{FetchSpec, InvalidPagePolicy, DEFAULT_PAGE_SIZE};
use crate::mapping::{ColumnType as T, FieldMap as F, ForeignKey as Fk};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdType {
    Text,
    Integer,
}

impl IdType {
    pub fn sql_type(self) -> &'static str {
        match self {
            IdType::Text => "TEXT",
            IdType::Integer => "INTEGER",
        }
    }
}

#[derive(Debug)]
pub struct KindSpec {
    pub name: &'static str,
    /// JSON:API `type` of the primary resources.
    pub resource_type: &'static str,
    pub path: &'static str,
    pub table: &'static str,
    pub id_type: IdType,
    pub page_size: u32,
    pub sort: Option<&'static str>,
    pub include: Option<&'static str>,
    pub fallback_includes: &'static [&'static str],
    pub filters: &'static [(&'static str, &'static str)],
    /// Filter key that receives `sync.time_entries_after`, if any.
    pub date_filter: Option<&'static str>,
    pub invalid_page_policy: InvalidPagePolicy,
    pub fields: &'static [F],
    pub foreign_keys: &'static [Fk],
}

impl KindSpec {
    pub fn fetch_spec(&self, opts: &SyncOptions) -> FetchSpec {
        let mut filters: Vec<(String, String)> = self
            .filters
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if let (Some(key), Some(after)) = (self.date_filter, opts.time_entries_after) {
            filters.push((key.to_string(), after.format("%Y-%m-%d").to_string()));
        }
        FetchSpec {
            kind: self.name.to_string(),
            path: self.path.to_string(),
            page_size: self.page_size,
            sort: self.sort.map(str::to_string),
            include: self.include.map(str::to_string),
            fallback_includes: self.fallback_includes.iter().map(|s| s.to_string()).collect(),
            filters,
            invalid_page_policy: self.invalid_page_policy,
            max_invalid_page_retries: opts.max_invalid_page_retries,
        }
    }
}

const HEAVY_PAGE_SIZE: u32 = 50;

pub static CATALOG: &[KindSpec] = &[
    KindSpec {
        name: "subsidiaries",
        resource_type: "subsidiaries",
        path: "subsidiaries",
        table: "subsidiaries",
        id_type: IdType::Integer,
        page_size: DEFAULT_PAGE_SIZE,
        sort: None,
        include: None,
        fallback_includes: &[],
        filters: &[],
        date_filter: None,
        invalid_page_policy: InvalidPagePolicy::Abort,
        fields: &[
            F::attr("name", T::Text).required(),
            F::attr("invoice_number_format", T::Text),
            F::attr("archived_at", T::Timestamp),
        ],
        foreign_keys: &[],
    },
    KindSpec {
        name: "tax_rates",
        resource_type: "tax_rates",
        path: "tax_rates",
        table: "tax_rates",
        id_type: IdType::Integer,
        page_size: DEFAULT_PAGE_SIZE,
        sort: None,
        include: Some("subsidiary"),
        fallback_includes: &[],
        filters: &[],
        date_filter: None,
        invalid_page_policy: InvalidPagePolicy::Retry,
        fields: &[
            F::attr("name", T::Text).required(),
            F::attr("primary_component_name", T::Text),
            F::attr("primary_component_value", T::Real),
            F::attr("secondary_component_name", T::Text),
            F::attr("secondary_component_value", T::Real),
            F::attr("archived_at", T::Timestamp),
        ],
        foreign_keys: &[Fk::new("subsidiary_id", &["subsidiary"], "subsidiaries")],
    },
    KindSpec {
        name: "document_styles",
        resource_type: "document_styles",
        path: "document_styles",
        table: "document_styles",
        id_type: IdType::Integer,
        page_size: DEFAULT_PAGE_SIZE,
        sort: None,
        include: None,
        fallback_includes: &[],
        filters: &[],
        date_filter: None,
        invalid_page_policy: InvalidPagePolicy::Retry,
        fields: &[
            F::attr("name", T::Text).required(),
            F::attr("styles", T::Json),
            F::attr("archived_at", T::Timestamp),
        ],
        foreign_keys: &[],
    },
    KindSpec {
        name: "document_types",
        resource_type: "document_types",
        path: "document_types",
        table: "document_types",
        id_type: IdType::Integer,
        page_size: DEFAULT_PAGE_SIZE,
        sort: None,
        include: Some("subsidiary,document_style"),
        fallback_includes: &["subsidiary"],
        filters: &[],
        date_filter: None,
        invalid_page_policy: InvalidPagePolicy::Retry,
        fields: &[
            F::attr("name", T::Text).required(),
            F::attr("tax1_name", T::Text),
            F::attr("locale", T::Text),
            F::attr("note", T::Text),
            F::attr("archived_at", T::Timestamp),
        ],
        foreign_keys: &[
            Fk::new("subsidiary_id", &["subsidiary"], "subsidiaries"),
            Fk::new("document_style_id", &["document_style"], "document_styles"),
        ],
    },
    KindSpec {
        name: "workflows",
        resource_type: "workflows",
        path: "workflows",
        table: "workflows",
        id_type: IdType::Integer,
        page_size: DEFAULT_PAGE_SIZE,
        sort: None,
        include: None,
        fallback_includes: &[],
        filters: &[],
        date_filter: None,
        invalid_page_policy: InvalidPagePolicy::Retry,
        fields: &[
            F::attr("name", T::Text).required(),
            F::attr("archived_at", T::Timestamp),
        ],
        foreign_keys: &[],
    },
    KindSpec {
        name: "workflow_statuses",
        resource_type: "workflow_statuses",
        path: "workflow_statuses",
        table: "workflow_statuses",
        id_type: IdType::Integer,
        page_size: DEFAULT_PAGE_SIZE,
        sort: None,
        include: Some("workflow"),
        fallback_includes: &[],
        filters: &[],
        date_filter: None,
        invalid_page_policy: InvalidPagePolicy::Retry,
        fields: &[
            F::attr("name", T::Text).required(),
            F::attr("color_id", T::Integer),
            F::attr("position", T::Integer),
            F::attr("category_id", T::Integer),
        ],
        foreign_keys: &[Fk::new("workflow_id", &["workflow"], "workflows")],
    },
    KindSpec {
        name: "companies",
        resource_type: "companies",
        path: "companies",
        table: "companies",
        id_type: IdType::Integer,
        page_size: DEFAULT_PAGE_SIZE,
        sort: None,
        include: Some("subsidiary,default_tax_rate,default_document_type"),
        fallback_includes: &["subsidiary"],
        filters: &[],
        date_filter: None,
        invalid_page_policy: InvalidPagePolicy::Abort,
        fields: &[
            F::attr("name", T::Text).required(),
            F::attr("billing_name", T::Text),
            F::attr("vat", T::Text),
            F::attr("default_currency", T::Text),
            F::attr("company_code", T::Text),
            F::attr("domain", T::Text),
            F::attr("due_days", T::Integer),
            F::attr("tag_list", T::Json),
            F::attr("archived_at", T::Timestamp),
            F::attr("created_at", T::Timestamp),
            F::included("subsidiary_name", &["subsidiary"], "name", T::Text),
        ],
        foreign_keys: &[
            Fk::new("subsidiary_id", &["subsidiary"], "subsidiaries"),
            Fk::new("default_tax_rate_id", &["default_tax_rate"], "tax_rates"),
            Fk::new("default_document_type_id", &["default_document_type"], "document_types"),
        ],
    },
    KindSpec {
        name: "people",
        resource_type: "people",
        path: "people",
        table: "people",
        id_type: IdType::Integer,
        page_size: DEFAULT_PAGE_SIZE,
        sort: None,
        include: Some("company"),
        fallback_includes: &[],
        filters: &[],
        date_filter: None,
        invalid_page_policy: InvalidPagePolicy::Retry,
        fields: &[
            F::attr("first_name", T::Text),
            F::attr("last_name", T::Text),
            F::attr("email", T::Text),
            F::attr("title", T::Text),
            F::attr("is_user", T::Boolean).at("user"),
            F::attr("archived_at", T::Timestamp),
        ],
        foreign_keys: &[Fk::new("company_id", &["company"], "companies")],
    },
    KindSpec {
        name: "projects",
        resource_type: "projects",
        path: "projects",
        table: "projects",
        id_type: IdType::Integer,
        page_size: DEFAULT_PAGE_SIZE,
        sort: None,
        include: Some("company,project_manager,workflow"),
        fallback_includes: &["company,project_manager", "company"],
        filters: &[],
        date_filter: None,
        invalid_page_policy: InvalidPagePolicy::Retry,
        fields: &[
            F::attr("name", T::Text).required(),
            F::attr("number", T::Text),
            F::attr("project_number", T::Text),
            F::attr("project_type_id", T::Integer),
            F::attr("archived_at", T::Timestamp),
            F::attr("created_at", T::Timestamp),
            F::included("company_name", &["company"], "name", T::Text),
        ],
        foreign_keys: &[
            Fk::new("company_id", &["company"], "companies"),
            Fk::new("project_manager_id", &["project_manager"], "people"),
            Fk::new("workflow_id", &["workflow"], "workflows"),
        ],
    },
    KindSpec {
        name: "deals",
        resource_type: "deals",
        path: "deals",
        table: "deals",
        id_type: IdType::Integer,
        page_size: HEAVY_PAGE_SIZE,
        sort: None,
        include: Some("company,project,responsible,document_type,tax_rate"),
        fallback_includes: &["company,project,responsible", "company,project", "company"],
        filters: &[],
        date_filter: None,
        invalid_page_policy: InvalidPagePolicy::Abort,
        fields: &[
            F::attr("name", T::Text).required(),
            F::attr("number", T::Text),
            F::attr("date", T::Date),
            F::attr("end_date", T::Date),
            F::attr("probability", T::Integer),
            F::attr("budget", T::Boolean),
            F::attr("currency", T::Text),
            F::attr("closed_at", T::Timestamp),
            F::attr("created_at", T::Timestamp),
            F::included("company_name", &["company"], "name", T::Text),
        ],
        foreign_keys: &[
            Fk::new("company_id", &["company"], "companies"),
            Fk::new("project_id", &["project"], "projects"),
            Fk::new("responsible_id", &["responsible"], "people"),
            Fk::new("document_type_id", &["document_type"], "document_types"),
            Fk::new("tax_rate_id", &["tax_rate"], "tax_rates"),
        ],
    },
    KindSpec {
        name: "services",
        resource_type: "services",
        path: "services",
        table: "services",
        id_type: IdType::Integer,
        page_size: DEFAULT_PAGE_SIZE,
        sort: None,
        include: Some("deal"),
        fallback_includes: &[],
        filters: &[],
        date_filter: None,
        invalid_page_policy: InvalidPagePolicy::Retry,
        fields: &[
            F::attr("name", T::Text).required(),
            F::attr("budgeted_time", T::Integer),
            F::attr("worked_time", T::Integer),
            F::attr("billable", T::Boolean),
            F::attr("price", T::Real),
            F::attr("quantity", T::Real),
        ],
        foreign_keys: &[Fk::new("deal_id", &["deal"], "deals")],
    },
    KindSpec {
        name: "tasks",
        resource_type: "tasks",
        path: "tasks",
        table: "tasks",
        id_type: IdType::Integer,
        page_size: DEFAULT_PAGE_SIZE,
        sort: None,
        include: Some("project,assignee,workflow_status"),
        fallback_includes: &["project"],
        filters: &[],
        date_filter: None,
        invalid_page_policy: InvalidPagePolicy::Retry,
        fields: &[
            F::attr("title", T::Text).required(),
            F::attr("task_number", T::Text),
            F::attr("description", T::Text),
            F::attr("due_date", T::Date),
            F::attr("closed", T::Boolean),
            F::attr("created_at", T::Timestamp),
        ],
        foreign_keys: &[
            Fk::new("project_id", &["project"], "projects"),
            Fk::new("assignee_id", &["assignee"], "people"),
            Fk::new("workflow_status_id", &["workflow_status"], "workflow_statuses"),
        ],
    },
    KindSpec {
        name: "time_entries",
        resource_type: "time_entries",
        path: "time_entries",
        table: "time_entries",
        id_type: IdType::Integer,
        page_size: DEFAULT_PAGE_SIZE,
        sort: Some("date"),
        include: Some("person,service,service.deal,task"),
        fallback_includes: &["person,service,task", "service"],
        filters: &[],
        date_filter: Some("after"),
        invalid_page_policy: InvalidPagePolicy::Retry,
        fields: &[
            F::attr("date", T::Date).required(),
            F::attr("time", T::Integer),
            F::attr("billable_time", T::Integer),
            F::attr("note", T::Text),
            F::attr("approved", T::Boolean),
            F::attr("approved_at", T::Timestamp),
            F::attr("created_at", T::Timestamp),
        ],
        foreign_keys: &[
            Fk::new("person_id", &["person"], "people"),
            Fk::new("service_id", &["service"], "services"),
            Fk::new("task_id", &["task"], "tasks"),
            Fk::new("deal_id", &["service", "deal"], "deals"),
        ],
    },
    KindSpec {
        name: "time_entry_versions",
        resource_type: "time_entry_versions",
        path: "time_entry_versions",
        table: "time_entry_versions",
        id_type: IdType::Text,
        page_size: HEAVY_PAGE_SIZE,
        sort: Some("created_at"),
        include: Some("creator"),
        fallback_includes: &[],
        filters: &[],
        date_filter: Some("after"),
        invalid_page_policy: InvalidPagePolicy::Retry,
        fields: &[
            F::attr("event", T::Text),
            F::attr("item_id", T::Integer),
            F::attr("item_type", T::Text),
            F::attr("object_changes", T::Json),
            F::attr("created_at", T::Timestamp),
        ],
        foreign_keys: &[Fk::new("creator_id", &["creator"], "people")],
    },
    KindSpec {
        name: "invoices",
        resource_type: "invoices",
        path: "invoices",
        table: "invoices",
        id_type: IdType::Integer,
        page_size: DEFAULT_PAGE_SIZE,
        sort: None,
        include: Some("company,document_type,subsidiary"),
        fallback_includes: &["company"],
        filters: &[],
        date_filter: None,
        invalid_page_policy: InvalidPagePolicy::Retry,
        fields: &[
            F::attr("number", T::Text),
            F::attr("subject", T::Text),
            F::attr("invoiced_on", T::Date),
            F::attr("pay_on", T::Date),
            F::attr("currency", T::Text),
            F::attr("amount", T::Real),
            F::included("company_name", &["company"], "name", T::Text),
        ],
        foreign_keys: &[
            Fk::new("company_id", &["company"], "companies"),
            Fk::new("document_type_id", &["document_type"], "document_types"),
            Fk::new("subsidiary_id", &["subsidiary"], "subsidiaries"),
        ],
    },
];

static BY_NAME: Lazy<HashMap<&'static str, &'static KindSpec>> =
    Lazy::new(|| CATALOG.iter().map(|spec| (spec.name, spec)).collect());

static BY_TABLE: Lazy<HashMap<&'static str, &'static KindSpec>> =
    Lazy::new(|| CATALOG.iter().map(|spec| (spec.table, spec)).collect());

pub fn all() -> &'static [KindSpec] {
    CATALOG
}

pub fn find(name: &str) -> Option<&'static KindSpec> {
    BY_NAME.get(name).copied()
}

pub fn find_by_table(table: &str) -> Option<&'static KindSpec> {
    BY_TABLE.get(table).copied()
}

/// Kinds to sync, always in catalog order. Empty `names` selects everything.
pub fn select(names: &[String]) -> Vec<&'static KindSpec> {
    CATALOG
        .iter()
        .filter(|spec| names.is_empty() || names.iter().any(|n| n == spec.name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn foreign_keys_point_at_earlier_kinds() {
        for (position, spec) in CATALOG.iter().enumerate() {
            for fk in spec.foreign_keys {
                let target = CATALOG
                    .iter()
                    .position(|k| k.table == fk.target_table)
                    .unwrap_or_else(|| panic!("{}.{} targets unknown table", spec.name, fk.column));
                assert!(
                    target < position,
                    "{}.{} points at {} which is synced later",
                    spec.name,
                    fk.column,
                    fk.target_table
                );
            }
        }
    }

    #[test]
    fn multi_hop_paths_are_included() {
        for spec in CATALOG {
            for fk in spec.foreign_keys.iter().filter(|fk| fk.path.len() > 1) {
                let hops = fk.path[..fk.path.len() - 1].join(".");
                let include = spec.include.unwrap_or_default();
                assert!(
                    include.split(',').any(|part| part == hops),
                    "{} needs `{}` in its include spec",
                    spec.name,
                    hops
                );
            }
        }
    }

    #[test]
    fn names_and_tables_are_unique() {
        assert_eq!(BY_NAME.len(), CATALOG.len());
        assert_eq!(BY_TABLE.len(), CATALOG.len());
    }

    #[test]
    fn select_keeps_dependency_order() {
        let picked = select(&["deals".to_string(), "companies".to_string()]);
        let names: Vec<_> = picked.iter().map(|k| k.name).collect();
        assert_eq!(names, vec!["companies", "deals"]);
        assert_eq!(select(&[]).len(), CATALOG.len());
    }

    #[test]
    fn date_filter_applies_only_when_configured() {
        let spec = find("time_entries").unwrap();
        let mut opts = SyncOptions::default();
        assert!(spec.fetch_spec(&opts).filters.is_empty());

        opts.time_entries_after = NaiveDate::from_ymd_opt(2024, 1, 31);
        let fetch = spec.fetch_spec(&opts);
        assert_eq!(fetch.filters, vec![("after".to_string(), "2024-01-31".to_string())]);
        assert_eq!(fetch.include.as_deref(), Some("person,service,service.deal,task"));
        assert_eq!(fetch.fallback_includes.len(), 2);

        assert!(find("companies").unwrap().fetch_spec(&opts).filters.is_empty());
    }
}
