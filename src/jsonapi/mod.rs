use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;

pub mod model;

pub const DEFAULT_API_BASE: &str = "https://api.productive.io/api/v2/";
const JSONAPI_CONTENT_TYPE: &str = "application/vnd.api+json";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response is not valid JSON: {0}")]
    Decode(String),
    #[error("invalid request URL: {0}")]
    Url(String),
}

impl SourceError {
    /// Whether the HTTP layer should try the same request again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Transport(_) => true,
            SourceError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
            }
            SourceError::Decode(_) | SourceError::Url(_) => false,
        }
    }
}

/// Parameters of one collection-page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub path: String,
    pub page_number: u32,
    pub page_size: u32,
    pub sort: Option<String>,
    pub include: Option<String>,
    pub filters: Vec<(String, String)>,
}

impl PageRequest {
    pub fn new(path: impl Into<String>, page_number: u32, page_size: u32) -> Self {
        Self {
            path: path.into(),
            page_number,
            page_size,
            sort: None,
            include: None,
            filters: Vec::new(),
        }
    }

    /// Query parameters in the JSON:API bracket convention.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("page[number]".to_string(), self.page_number.to_string()),
            ("page[size]".to_string(), self.page_size.to_string()),
        ];
        if let Some(sort) = self.sort.as_deref().filter(|s| !s.is_empty()) {
            pairs.push(("sort".to_string(), sort.to_string()));
        }
        if let Some(include) = self.include.as_deref().filter(|s| !s.is_empty()) {
            pairs.push(("include".to_string(), include.to_string()));
        }
        for (key, value) in &self.filters {
            pairs.push((format!("filter[{}]", key), value.clone()));
        }
        pairs
    }
}

/// Anything that can serve one page of a JSON:API collection.
#[async_trait]
pub trait JsonApiSource: Send + Sync {
    async fn get_page(&self, request: &PageRequest) -> Result<Value, SourceError>;
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    token: String,
    organization_id: String,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("organization_id", &self.organization_id)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let base_url = Url::parse(&cfg.api.base_url)?;
        let http = Client::builder()
            .user_agent("productive-sync/0.1")
            .timeout(Duration::from_secs(cfg.api.timeout_secs))
            .build()?;
        Ok(Self::with_client(
            http,
            base_url,
            cfg.api.token.clone(),
            cfg.api.organization_id.clone(),
        )
        .with_retry(
            cfg.api.max_attempts,
            Duration::from_millis(cfg.api.retry_backoff_ms),
        ))
    }

    pub fn with_client(http: Client, mut base_url: Url, token: String, organization_id: String) -> Self {
        // Url::join drops the last segment unless the base ends with '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            http,
            base_url,
            token,
            organization_id,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    pub fn build_request(&self, page: &PageRequest) -> Result<reqwest::Request, SourceError> {
        let endpoint = self
            .base_url
            .join(page.path.trim_start_matches('/'))
            .map_err(|e| SourceError::Url(e.to_string()))?;
        self.http
            .get(endpoint)
            .header("X-Auth-Token", &self.token)
            .header("X-Organization-Id", &self.organization_id)
            .header("Content-Type", JSONAPI_CONTENT_TYPE)
            .query(&page.query_pairs())
            .build()
            .map_err(|e| SourceError::Url(e.to_string()))
    }

    async fn execute_once(&self, page: &PageRequest) -> Result<Value, SourceError> {
        let request = self.build_request(page)?;
        debug!(url = %request.url(), "jsonapi request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| SourceError::Transport(e.without_url().to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = res
            .text()
            .await
            .map_err(|e| SourceError::Transport(e.without_url().to_string()))?;
        serde_json::from_str(&body).map_err(|e| SourceError::Decode(e.to_string()))
    }
}

#[async_trait]
impl JsonApiSource for ApiClient {
    async fn get_page(&self, request: &PageRequest) -> Result<Value, SourceError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.execute_once(request).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        path = %request.path,
                        page = request.page_number,
                        attempt,
                        %err,
                        "request failed; retrying"
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
