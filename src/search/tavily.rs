//! Tavily search provider (fallback)
//!
//! Used by the router only when the primaries fail or return nothing.
//!
//! # Production Features
//!
//! - HTTP timeout and retry with exponential backoff, all inside one
//!   total budget that stays under the router's provider timeout
//! - Typed error handling for rate limits and timeouts
//! - Request ladder: advanced with domains, then advanced, then basic

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SearchError;
use crate::search::provider::{
    send_json, ProviderResult, SearchDepth, SearchParams, SearchProvider,
};
use crate::search::url::{sanitize_domains, sanitize_query};

const DEFAULT_BASE_URL: &str = "https://api.tavily.com";

/// Default timeout for a single Tavily API request
const DEFAULT_TIMEOUT_SECS: u64 = 8;

/// Wall-clock budget for one search across every rung and retry
const DEFAULT_TOTAL_TIMEOUT_SECS: u64 = 18;

/// Maximum retry attempts for transient failures
const MAX_RETRIES: u32 = 1;

/// Base delay for exponential backoff (milliseconds)
const RETRY_BASE_DELAY_MS: u64 = 500;

const MAX_RESULTS: usize = 20;
const MAX_INCLUDE_DOMAINS: usize = 20;

/// Tavily search provider
///
/// # Example
/// ```ignore
/// let tavily = TavilySearchProvider::from_env()?.with_max_retries(1);
/// let results = tavily.search("Rust async programming", &SearchParams::new(5)).await?;
/// ```
pub struct TavilySearchProvider {
    api_key: String,
    client: Client,
    base_url: String,
    timeout: Duration,
    total_timeout: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl TavilySearchProvider {
    pub const NAME: &'static str = "tavily";

    /// Create a new provider with the given API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            total_timeout: Duration::from_secs(DEFAULT_TOTAL_TIMEOUT_SECS),
            max_retries: MAX_RETRIES,
            retry_base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
        }
    }

    /// Create from environment variable TAVILY_API_KEY
    pub fn from_env() -> Result<Self, SearchError> {
        match std::env::var("TAVILY_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key)),
            _ => Err(SearchError::MissingApiKey("TAVILY")),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Cap the whole search (ladder, retries and backoff). Keep it below
    /// the router's provider timeout so a late rung can still answer.
    pub fn with_total_timeout(mut self, total: Duration) -> Self {
        self.total_timeout = total;
        self
    }

    /// Set custom max retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Requests to try in order until one succeeds.
    fn request_ladder(query: &str, params: &SearchParams) -> Vec<TavilyRequest> {
        let base = TavilyRequest {
            api_key: None,
            query: sanitize_query(query),
            search_depth: params.depth.as_str(),
            topic: "general",
            max_results: params.max_results.clamp(1, MAX_RESULTS),
            include_answer: false,
            include_images: false,
            include_raw_content: false,
            include_domains: sanitize_domains(&params.include_domains, MAX_INCLUDE_DOMAINS),
            time_range: params.time_range.map(|t| t.as_str()),
        };

        let mut ladder = Vec::with_capacity(3);
        if !base.include_domains.is_empty() {
            ladder.push(base.clone());
        }
        let no_domains = TavilyRequest {
            include_domains: Vec::new(),
            ..base
        };
        if no_domains.search_depth != SearchDepth::Basic.as_str() {
            ladder.push(no_domains.clone());
        }
        ladder.push(TavilyRequest {
            search_depth: SearchDepth::Basic.as_str(),
            ..no_domains
        });
        ladder
    }

    /// Execute HTTP request with retry and backoff
    async fn execute_with_retry(
        &self,
        request: &TavilyRequest,
        deadline: Instant,
    ) -> Result<TavilyResponse, SearchError> {
        let mut last_error = SearchError::Timeout(self.total_timeout);

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.retry_base_delay * 2u32.pow(attempt - 1);
                if Instant::now() + delay >= deadline {
                    break;
                }
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying Tavily request");
                tokio::time::sleep(delay).await;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SearchError::Timeout(self.total_timeout));
            }

            match self.execute_single_request(request, self.timeout.min(remaining)).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    // Only retry on transient errors
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    warn!(attempt, error = %e, "Tavily request failed, will retry");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn execute_single_request(
        &self,
        request: &TavilyRequest,
        timeout: Duration,
    ) -> Result<TavilyResponse, SearchError> {
        let mut body = request.clone();
        // Older accounts still expect the key in the body.
        body.api_key = Some(self.api_key.clone());

        send_json(
            self.client
                .post(format!("{}/search", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body),
            timeout,
        )
        .await
    }
}

/// Request body for Tavily API
#[derive(Debug, Clone, Serialize)]
struct TavilyRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
    query: String,
    search_depth: &'static str,
    topic: &'static str,
    max_results: usize,
    include_answer: bool,
    include_images: bool,
    include_raw_content: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    include_domains: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_range: Option<&'static str>,
}

/// Response from Tavily API
#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

/// Individual search result
#[derive(Debug, Deserialize)]
struct TavilyResult {
    title: Option<String>,
    url: Option<String>,
    /// Extracted content/snippet
    content: Option<String>,
    snippet: Option<String>,
    published_date: Option<String>,
}

#[async_trait]
impl SearchProvider for TavilySearchProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn search(
        &self,
        query: &str,
        params: &SearchParams,
    ) -> Result<Vec<ProviderResult>, SearchError> {
        if self.api_key.trim().is_empty() {
            return Err(SearchError::MissingApiKey("TAVILY"));
        }

        let ladder = Self::request_ladder(query, params);
        let rungs = ladder.len();
        let deadline = Instant::now() + self.total_timeout;
        let mut last_error = SearchError::Timeout(self.total_timeout);

        for (rung, request) in ladder.iter().enumerate() {
            if Instant::now() >= deadline {
                warn!(rung = rung + 1, rungs, "Tavily budget spent before trying every rung");
                break;
            }
            match self.execute_with_retry(request, deadline).await {
                Ok(response) => {
                    return Ok(response
                        .results
                        .iter()
                        .filter_map(|item| {
                            let content = item
                                .content
                                .as_deref()
                                .filter(|c| !c.trim().is_empty())
                                .or(item.snippet.as_deref());
                            ProviderResult::from_raw(
                                Self::NAME,
                                item.title.as_deref(),
                                item.url.as_deref(),
                                content,
                                item.published_date.as_deref(),
                            )
                        })
                        .collect());
                }
                Err(e) => {
                    warn!(
                        rung = rung + 1,
                        rungs,
                        depth = request.search_depth,
                        domains = !request.include_domains.is_empty(),
                        error = %e,
                        "Tavily attempt failed"
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::provider::TimeRange;

    #[test]
    fn test_ladder_with_domains() {
        let params = SearchParams::new(5).with_domains(vec!["imf.org".to_string()]);
        let ladder = TavilySearchProvider::request_ladder("q", &params);

        assert_eq!(ladder.len(), 3);
        assert_eq!(ladder[0].search_depth, "advanced");
        assert_eq!(ladder[0].include_domains, vec!["imf.org"]);
        assert_eq!(ladder[1].search_depth, "advanced");
        assert!(ladder[1].include_domains.is_empty());
        assert_eq!(ladder[2].search_depth, "basic");
        assert!(ladder[2].include_domains.is_empty());
    }

    #[test]
    fn test_ladder_without_domains() {
        let ladder = TavilySearchProvider::request_ladder("q", &SearchParams::new(5));
        assert_eq!(ladder.len(), 2);

        let basic = SearchParams::new(5).with_depth(SearchDepth::Basic);
        let ladder = TavilySearchProvider::request_ladder("q", &basic);
        assert_eq!(ladder.len(), 1);
        assert_eq!(ladder[0].search_depth, "basic");
    }

    #[test]
    fn test_request_serialization() {
        let params = SearchParams::new(40).with_time_range(TimeRange::Week);
        let ladder = TavilySearchProvider::request_ladder("q", &params);
        let json = serde_json::to_value(&ladder[0]).unwrap();

        assert_eq!(json["max_results"], 20);
        assert_eq!(json["time_range"], "week");
        assert!(json.get("include_domains").is_none());
        assert!(json.get("api_key").is_none());
    }

    #[test]
    fn test_from_env_missing_key() {
        std::env::remove_var("TAVILY_API_KEY");
        let result = TavilySearchProvider::from_env();
        assert!(matches!(result, Err(SearchError::MissingApiKey("TAVILY"))));
    }

    #[test]
    fn test_builder_pattern() {
        let tool = TavilySearchProvider::new("test-key")
            .with_timeout(Duration::from_secs(60))
            .with_max_retries(5);

        assert_eq!(tool.timeout, Duration::from_secs(60));
        assert_eq!(tool.max_retries, 5);
    }

    #[test]
    fn test_default_budget_fits_router_timeout() {
        let tool = TavilySearchProvider::new("test-key");
        let router_timeout = crate::search::RouterConfig::default().provider_timeout;
        assert!(tool.total_timeout < router_timeout);

        // one rung with every retry and its backoff fits the budget
        let attempts = tool.max_retries + 1;
        let backoff: Duration = (1..attempts)
            .map(|a| tool.retry_base_delay * 2u32.pow(a - 1))
            .sum();
        assert!(tool.timeout * attempts + backoff <= tool.total_timeout);
    }
}
