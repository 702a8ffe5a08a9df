//! Wikipedia search provider (reference)
//!
//! Keyless MediaWiki search. The router uses it for the reference phase of
//! a trusted-first run and as the fallback once paid providers hit their
//! call cap or quota. Full-text search comes first; an empty answer falls
//! back to the title-prefix `opensearch` API.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::SearchError;
use crate::search::provider::{send_json, ProviderResult, SearchParams, SearchProvider};
use crate::search::url::sanitize_query;

const DEFAULT_BASE_URL: &str = "https://en.wikipedia.org";

const PAGE_BASE_URL: &str = "https://en.wikipedia.org/wiki/";

pub const DEFAULT_USER_AGENT: &str = "DeepResearchAgent/1.0 (research-assistant; contact: local-dev)";

const DEFAULT_TIMEOUT_SECS: u64 = 12;

const MAX_RESULTS: usize = 8;

/// MediaWiki caps `srsearch` well above this; longer queries only add noise
const MAX_QUERY_CHARS: usize = 350;

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));

pub struct WikipediaSearchProvider {
    client: Client,
    base_url: String,
    user_agent: String,
    timeout: Duration,
}

impl Default for WikipediaSearchProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl WikipediaSearchProvider {
    pub const NAME: &'static str = "wikipedia";

    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Point the client at another host (used for mocking)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Wikimedia asks API clients to identify themselves.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, query: &[(&str, String)]) -> Result<T, SearchError> {
        send_json(
            self.client
                .get(format!("{}/w/api.php", self.base_url))
                .header("User-Agent", &self.user_agent)
                .header("Accept", "application/json")
                .query(query),
            self.timeout,
        )
        .await
    }

    async fn full_text(&self, query: &str, limit: usize) -> Result<Vec<ProviderResult>, SearchError> {
        let response: QueryResponse = self
            .get(&[
                ("action", "query".to_string()),
                ("list", "search".to_string()),
                ("srsearch", query.to_string()),
                ("format", "json".to_string()),
                ("srlimit", limit.to_string()),
            ])
            .await?;

        Ok(response
            .query
            .search
            .iter()
            .filter_map(|hit| {
                let url = page_url(&hit.title)?;
                entry(&hit.title, &url, &clean_snippet(&hit.snippet))
            })
            .collect())
    }

    async fn title_prefix(&self, query: &str, limit: usize) -> Result<Vec<ProviderResult>, SearchError> {
        let OpenSearchResponse(_, titles, descriptions, urls): OpenSearchResponse = self
            .get(&[
                ("action", "opensearch".to_string()),
                ("search", query.to_string()),
                ("limit", limit.to_string()),
                ("namespace", "0".to_string()),
                ("format", "json".to_string()),
            ])
            .await?;

        Ok(titles
            .iter()
            .enumerate()
            .filter_map(|(i, title)| {
                let url = urls.get(i).cloned().or_else(|| page_url(title))?;
                let description = descriptions.get(i).map(|d| clean_snippet(d)).unwrap_or_default();
                entry(title, &url, &description)
            })
            .take(limit)
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    query: QueryBody,
}

#[derive(Debug, Default, Deserialize)]
struct QueryBody {
    #[serde(default)]
    search: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    title: String,
    #[serde(default)]
    snippet: String,
}

/// `[query, titles, descriptions, urls]`
#[derive(Debug, Deserialize)]
struct OpenSearchResponse(String, Vec<String>, Vec<String>, Vec<String>);

/// Article URL for a page title (spaces become underscores).
fn page_url(title: &str) -> Option<String> {
    let title = title.trim();
    if title.is_empty() {
        return None;
    }
    let mut url = Url::parse(PAGE_BASE_URL).ok()?;
    url.path_segments_mut()
        .ok()?
        .pop_if_empty()
        .push(&title.replace(' ', "_"));
    Some(url.to_string())
}

/// Strip search-match markup and collapse whitespace.
fn clean_snippet(raw: &str) -> String {
    TAG_RE
        .replace_all(raw, "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn entry(title: &str, url: &str, snippet: &str) -> Option<ProviderResult> {
    let content = if snippet.is_empty() {
        format!("Wikipedia entry for {}", title.trim())
    } else {
        snippet.to_string()
    };
    ProviderResult::from_raw(WikipediaSearchProvider::NAME, Some(title), Some(url), Some(&content), None)
}

#[async_trait]
impl SearchProvider for WikipediaSearchProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn search(
        &self,
        query: &str,
        params: &SearchParams,
    ) -> Result<Vec<ProviderResult>, SearchError> {
        let query: String = sanitize_query(query).chars().take(MAX_QUERY_CHARS).collect();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let limit = params.max_results.clamp(1, MAX_RESULTS);
        debug!(query = %query, limit, "Wikipedia search");

        let results = self.full_text(&query, limit).await?;
        if !results.is_empty() {
            return Ok(results);
        }
        debug!(query = %query, "Wikipedia full-text search empty, trying opensearch");
        self.title_prefix(&query, limit).await
    }
}


/// HTTP tests with a mocked MediaWiki API
#[cfg(test)]
mod http_tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_full_text_search() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/w/api.php"))
            .and(query_param("list", "search"))
            .and(query_param("srlimit", "3"))
            .and(header("User-Agent", "test-agent/1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "query": {
                    "search": [
                        { "title": "Basque people", "snippet": "The <span class=\"searchmatch\">Basques</span> are" },
                        { "title": "Basque language", "snippet": "" }
                    ]
                }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = WikipediaSearchProvider::new()
            .with_base_url(mock_server.uri())
            .with_user_agent("test-agent/1.0");
        let results = provider
            .search("history of the Basques", &SearchParams::new(3))
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "https://en.wikipedia.org/wiki/Basque_people");
        assert_eq!(results[0].content, "The Basques are");
        assert_eq!(results[1].content, "Wikipedia entry for Basque language");
    }

    #[tokio::test]
    async fn test_http_falls_back_to_opensearch() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/w/api.php"))
            .and(query_param("list", "search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "query": { "search": [] }
            })))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/w/api.php"))
            .and(query_param("action", "opensearch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                "zzq",
                ["Zzq"],
                [""],
                ["https://en.wikipedia.org/wiki/Zzq"]
            ])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = WikipediaSearchProvider::new().with_base_url(mock_server.uri());
        let results = provider.search("zzq", &SearchParams::new(20)).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Zzq");
        assert_eq!(results[0].content, "Wikipedia entry for Zzq");
    }

    #[tokio::test]
    async fn test_http_server_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/w/api.php"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&mock_server)
            .await;

        let provider = WikipediaSearchProvider::new().with_base_url(mock_server.uri());
        let err = provider.search("q", &SearchParams::default()).await.unwrap_err();
        assert!(matches!(err, SearchError::ServerError(503, _)));
    }
}
