//! Firecrawl search provider (primary)
//!
//! Firecrawl has no include-domains filter on every plan, so domain
//! preferences are expressed as `site:` hints appended to the query.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::SearchError;
use crate::search::provider::{send_json, ProviderResult, SearchParams, SearchProvider};
use crate::search::url::{sanitize_domains, sanitize_query};

const DEFAULT_BASE_URL: &str = "https://api.firecrawl.dev";

/// Default timeout for Firecrawl API requests
const DEFAULT_TIMEOUT_SECS: u64 = 20;

const MAX_LIMIT: usize = 10;

/// Number of `site:` hints appended to a query
const MAX_SITE_HINTS: usize = 3;

pub struct FirecrawlSearchProvider {
    api_key: String,
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl FirecrawlSearchProvider {
    pub const NAME: &'static str = "firecrawl";

    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Create from environment variable FIRECRAWL_API_KEY
    pub fn from_env() -> Result<Self, SearchError> {
        match std::env::var("FIRECRAWL_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key)),
            _ => Err(SearchError::MissingApiKey("FIRECRAWL")),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_request(query: &str, params: &SearchParams) -> FirecrawlRequest {
        let query = sanitize_query(query);
        let hosts = sanitize_domains(&params.include_domains, MAX_SITE_HINTS);
        let query = if hosts.is_empty() {
            query
        } else {
            let hints = hosts
                .iter()
                .map(|h| format!("site:{}", h))
                .collect::<Vec<_>>()
                .join(" OR ");
            format!("{} ({})", query, hints)
        };

        FirecrawlRequest {
            query,
            limit: params.max_results.clamp(1, MAX_LIMIT),
        }
    }
}

#[derive(Debug, Serialize)]
struct FirecrawlRequest {
    query: String,
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct FirecrawlResponse {
    #[serde(default)]
    data: Vec<FirecrawlItem>,
}

#[derive(Debug, Deserialize)]
struct FirecrawlItem {
    url: Option<String>,
    title: Option<String>,
    description: Option<String>,
    content: Option<String>,
    #[serde(default)]
    metadata: Option<FirecrawlMetadata>,
}

#[derive(Debug, Deserialize)]
struct FirecrawlMetadata {
    title: Option<String>,
}

impl FirecrawlItem {
    fn title(&self) -> Option<&str> {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.metadata.as_ref().and_then(|m| m.title.as_deref()))
    }

    fn snippet(&self) -> Option<&str> {
        self.description
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .or(self.content.as_deref())
    }
}

#[async_trait]
impl SearchProvider for FirecrawlSearchProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn search(
        &self,
        query: &str,
        params: &SearchParams,
    ) -> Result<Vec<ProviderResult>, SearchError> {
        if self.api_key.trim().is_empty() {
            return Err(SearchError::MissingApiKey("FIRECRAWL"));
        }

        let request = Self::build_request(query, params);
        debug!(query = %request.query, limit = request.limit, "Firecrawl search");

        let response: FirecrawlResponse = send_json(
            self.client
                .post(format!("{}/v1/search", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request),
            self.timeout,
        )
        .await?;

        Ok(response
            .data
            .iter()
            .take(params.max_results.max(1) * 2)
            .filter_map(|item| {
                ProviderResult::from_raw(
                    Self::NAME,
                    item.title(),
                    item.url.as_deref(),
                    item.snippet(),
                    None,
                )
            })
            .collect())
    }
}
