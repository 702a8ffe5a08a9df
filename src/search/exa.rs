//! Exa search provider (primary)

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::SearchError;
use crate::search::provider::{send_json, ProviderResult, SearchParams, SearchProvider};
use crate::search::url::{sanitize_domains, sanitize_query};

const DEFAULT_BASE_URL: &str = "https://api.exa.ai";

/// Default timeout for Exa API requests
const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Exa accepts at most this many results per call
const MAX_NUM_RESULTS: usize = 10;

/// Exa accepts at most this many include domains
const MAX_INCLUDE_DOMAINS: usize = 10;

pub struct ExaSearchProvider {
    api_key: String,
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl ExaSearchProvider {
    pub const NAME: &'static str = "exa";

    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Create from environment variable EXA_API_KEY
    pub fn from_env() -> Result<Self, SearchError> {
        match std::env::var("EXA_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key)),
            _ => Err(SearchError::MissingApiKey("EXA")),
        }
    }

    /// Point the client at another host (used for mocking)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_request(query: &str, params: &SearchParams) -> ExaRequest {
        ExaRequest {
            query: sanitize_query(query),
            search_type: "auto",
            num_results: params.max_results.clamp(1, MAX_NUM_RESULTS),
            contents: ExaContents { text: true },
            include_domains: sanitize_domains(&params.include_domains, MAX_INCLUDE_DOMAINS),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExaRequest {
    query: String,
    #[serde(rename = "type")]
    search_type: &'static str,
    num_results: usize,
    contents: ExaContents,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    include_domains: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ExaContents {
    text: bool,
}

#[derive(Debug, Deserialize)]
struct ExaResponse {
    #[serde(default)]
    results: Vec<ExaResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExaResult {
    title: Option<String>,
    url: Option<String>,
    text: Option<String>,
    summary: Option<String>,
    published_date: Option<String>,
}

#[async_trait]
impl SearchProvider for ExaSearchProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn search(
        &self,
        query: &str,
        params: &SearchParams,
    ) -> Result<Vec<ProviderResult>, SearchError> {
        if self.api_key.trim().is_empty() {
            return Err(SearchError::MissingApiKey("EXA"));
        }

        let request = Self::build_request(query, params);
        debug!(query = %request.query, num_results = request.num_results, "Exa search");

        let response: ExaResponse = send_json(
            self.client
                .post(format!("{}/search", self.base_url))
                .header("x-api-key", &self.api_key)
                .json(&request),
            self.timeout,
        )
        .await?;

        Ok(response
            .results
            .iter()
            .take(params.max_results.max(1) * 2)
            .filter_map(|item| {
                let content = item
                    .text
                    .as_deref()
                    .filter(|t| !t.trim().is_empty())
                    .or(item.summary.as_deref());
                ProviderResult::from_raw(
                    Self::NAME,
                    item.title.as_deref(),
                    item.url.as_deref(),
                    content,
                    item.published_date.as_deref(),
                )
            })
            .collect())
    }
}


/// HTTP tests with a mocked Exa server
#[cfg(test)]
mod http_tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_successful_search() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/search"))
            .and(header("x-api-key", "exa-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {
                        "title": "Paris - Wikipedia",
                        "url": "https://en.wikipedia.org/wiki/Paris",
                        "text": "Paris is the capital of France.",
                        "publishedDate": "2024-05-01T00:00:00.000Z"
                    },
                    {
                        "title": "No url here",
                        "text": "dropped"
                    },
                    {
                        "title": "Summary only",
                        "url": "https://example.org/a",
                        "summary": "A summary."
                    }
                ]
            })))
            .mount(&mock_server)
            .await;

        let provider = ExaSearchProvider::new("exa-key").with_base_url(mock_server.uri());
        let results = provider
            .search("capital of France", &SearchParams::new(3))
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].provider, "exa");
        assert_eq!(results[0].content, "Paris is the capital of France.");
        assert!(results[0].published_date.is_some());
        assert_eq!(results[1].content, "A summary.");
    }

    #[tokio::test]
    async fn test_http_unauthorized() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&mock_server)
            .await;

        let provider = ExaSearchProvider::new("wrong").with_base_url(mock_server.uri());
        let err = provider.search("q", &SearchParams::default()).await.unwrap_err();
        assert_eq!(err, SearchError::Unauthorized);
    }

    #[tokio::test]
    async fn test_http_timeout() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "results": [] }))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&mock_server)
            .await;

        let provider = ExaSearchProvider::new("k")
            .with_base_url(mock_server.uri())
            .with_timeout(Duration::from_millis(50));
        let err = provider.search("q", &SearchParams::default()).await.unwrap_err();
        assert!(matches!(err, SearchError::Timeout(_)));
    }
}
