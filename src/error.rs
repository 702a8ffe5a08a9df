//! Error types for the research agent
//!
//! Library code returns these typed errors; the binary wraps them in
//! `anyhow` with context.

use std::time::Duration;
use thiserror::Error;

/// Errors from a single search provider call.
///
/// These never fail a router call on their own: the router turns them into
/// failure records and, when every primary is down, a fallback attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("{0} API key is not set")]
    MissingApiKey(&'static str),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unauthorized - check API key")]
    Unauthorized,

    #[error("Rate limited - too many requests")]
    RateLimited,

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Server error ({0}): {1}")]
    ServerError(u16, String),

    #[error("HTTP error ({0}): {1}")]
    HttpError(u16, String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

impl SearchError {
    /// Transient errors worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SearchError::Timeout(_)
                | SearchError::Connection(_)
                | SearchError::RateLimited
                | SearchError::ServerError(_, _)
        )
    }

    /// Map a reqwest transport error into a typed search error.
    pub fn from_transport(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            SearchError::Timeout(timeout)
        } else if err.is_connect() {
            SearchError::Connection(err.to_string())
        } else {
            SearchError::Network(err.to_string())
        }
    }

    /// Map a non-success HTTP status and body into a typed search error.
    pub fn from_status(status: u16, body: String) -> Self {
        let body = truncate_body(body);
        match status {
            401 | 403 => SearchError::Unauthorized,
            429 => SearchError::RateLimited,
            432 | 433 => SearchError::QuotaExceeded(body),
            400 => SearchError::BadRequest(body),
            500..=599 => SearchError::ServerError(status, body),
            _ => SearchError::HttpError(status, body),
        }
    }
}

fn truncate_body(body: String) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() > 240 {
        let cut: String = trimmed.chars().take(240).collect();
        format!("{}...", cut)
    } else {
        trimmed.to_string()
    }
}

/// Errors from the language-model capability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM returned an empty response")]
    EmptyResponse,

    #[error("Failed to parse model response into {target}: {message}")]
    Parse { target: &'static str, message: String },

    #[error("LLM stream interrupted: {0}")]
    Stream(String),
}

/// Errors from thread memory persistence.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Memory backend error: {0}")]
    Backend(String),

    #[error("Thread memory serialization failed: {0}")]
    Serialization(String),
}

/// Errors that abort a workflow run.
///
/// Everything else is recorded into the run's error list and the run keeps
/// going.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Planning failed: {0}")]
    Planning(#[source] LlmError),

    #[error("Query must not be empty")]
    EmptyQuery,

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Workflow task failed: {0}")]
    Task(String),
}

impl WorkflowError {
    /// The stage name reported in terminal error events.
    pub fn stage(&self) -> &'static str {
        match self {
            WorkflowError::Planning(_) | WorkflowError::EmptyQuery => "plan",
            WorkflowError::Memory(_) => "memory",
            WorkflowError::Task(_) => "workflow",
        }
    }
}
