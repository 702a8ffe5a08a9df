//! Search provider capability
//!
//! Every backend (Exa, Firecrawl, Tavily, or a test fake) implements
//! [`SearchProvider`]. The router only ever sees this trait, so providers
//! can be swapped or counted in tests without touching routing logic.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SearchError;
use crate::search::url::{source_name, truncate_chars};

/// Title length kept from any provider
pub const MAX_TITLE_CHARS: usize = 300;

/// Snippet/text length kept from any provider
pub const MAX_CONTENT_CHARS: usize = 1200;

/// Search depth hint. Providers without a depth control ignore it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SearchDepth {
    /// Fast search with basic results
    Basic,
    /// More thorough search with detailed results
    #[default]
    Advanced,
}

impl SearchDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchDepth::Basic => "basic",
            SearchDepth::Advanced => "advanced",
        }
    }
}

/// Time window filter for providers that support recency restriction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TimeRange {
    Day,
    Week,
    Month,
    Year,
}

impl TimeRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::Day => "day",
            TimeRange::Week => "week",
            TimeRange::Month => "month",
            TimeRange::Year => "year",
        }
    }
}

/// Provider-neutral search parameters.
///
/// Each provider maps these onto its own request shape and clamps them to
/// its own limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Requested result count
    pub max_results: usize,
    /// Restrict results to these domains
    pub include_domains: Vec<String>,
    pub depth: SearchDepth,
    pub time_range: Option<TimeRange>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            max_results: 5,
            include_domains: Vec::new(),
            depth: SearchDepth::Advanced,
            time_range: None,
        }
    }
}

impl SearchParams {
    pub fn new(max_results: usize) -> Self {
        Self {
            max_results: max_results.max(1),
            ..Default::default()
        }
    }

    pub fn with_domains(mut self, domains: Vec<String>) -> Self {
        self.include_domains = domains;
        self
    }

    pub fn with_depth(mut self, depth: SearchDepth) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }
}

/// One raw result of a provider call. Consumed by the router after merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResult {
    pub title: String,
    pub url: String,
    /// Snippet or extracted page text
    pub content: String,
    /// Publication date as reported by the provider, if any
    pub published_date: Option<String>,
    /// Name of the provider that produced this result
    pub provider: String,
}

impl ProviderResult {
    pub fn new(
        provider: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            content: content.into(),
            published_date: None,
            provider: provider.into(),
        }
    }

    pub fn with_published_date(mut self, date: impl Into<String>) -> Self {
        self.published_date = Some(date.into());
        self
    }

    /// Build a result from raw provider fields.
    ///
    /// Items without a URL or title are dropped. Title and content are cut
    /// to the shared limits.
    pub fn from_raw(
        provider: &str,
        title: Option<&str>,
        url: Option<&str>,
        content: Option<&str>,
        published_date: Option<&str>,
    ) -> Option<Self> {
        let url = url.map(str::trim).filter(|u| !u.is_empty())?;
        let title = title.map(str::trim).filter(|t| !t.is_empty())?;
        let content = content
            .map(|c| truncate_chars(c.trim(), MAX_CONTENT_CHARS))
            .unwrap_or_default();

        Some(Self {
            title: truncate_chars(title, MAX_TITLE_CHARS),
            url: url.to_string(),
            content,
            published_date: published_date
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            provider: provider.to_string(),
        })
    }

    pub fn has_text(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

/// What happened to a source during research.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Fetched,
    Deduped,
    Failed,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Fetched => "fetched",
            FetchStatus::Deduped => "deduped",
            FetchStatus::Failed => "failed",
        }
    }
}

/// A scored, normalized source gathered for a sub-question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub source_name: String,
    pub title: String,
    pub url: String,
    pub extracted_text: String,
    pub provider: String,
    pub fetch_status: FetchStatus,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
}

impl EvidenceItem {
    pub fn from_result(result: ProviderResult, fetch_status: FetchStatus, score: f64) -> Self {
        Self {
            source_name: source_name(&result.url),
            title: result.title,
            url: result.url,
            extracted_text: result.content,
            provider: result.provider,
            fetch_status,
            score,
            published_date: result.published_date,
        }
    }
}

/// Send a prepared JSON request and decode the response body.
///
/// Transport failures and non-success statuses are mapped into typed
/// [`SearchError`]s so callers can decide whether to retry.
pub(crate) async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<T, SearchError> {
    let response = request
        .header("Content-Type", "application/json")
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| SearchError::from_transport(e, timeout))?;

    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| SearchError::ParseError(e.to_string()));
    }

    let error_text = response.text().await.unwrap_or_default();
    Err(SearchError::from_status(status.as_u16(), error_text))
}

/// A deduplicated source reference shown in reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub url: String,
    pub source_name: String,
}

impl From<&EvidenceItem> for Citation {
    fn from(item: &EvidenceItem) -> Self {
        Self {
            title: item.title.clone(),
            url: item.url.clone(),
            source_name: item.source_name.clone(),
        }
    }
}

/// Capability interface for a web-search backend.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Provider name used in logs, evidence items and failure events
    fn name(&self) -> &str;

    /// Run one search.
    async fn search(
        &self,
        query: &str,
        params: &SearchParams,
    ) -> Result<Vec<ProviderResult>, SearchError>;
}
