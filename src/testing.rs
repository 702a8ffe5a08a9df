//! Test doubles shared by the unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{LlmError, SearchError};
use crate::llm::{LanguageModel, LlmRequest, LlmTask, TextStream};
use crate::search::{ProviderResult, SearchParams, SearchProvider};

/// Language model that answers from a per-task script.
///
/// One-shot replies queued with [`ScriptedModel::then`] are used first;
/// afterwards the sticky reply set with [`ScriptedModel::with`] repeats.
/// Unscripted tasks fail.
#[derive(Default)]
pub(crate) struct ScriptedModel {
    sticky: HashMap<LlmTask, Result<String, LlmError>>,
    queued: Mutex<HashMap<LlmTask, VecDeque<Result<String, LlmError>>>>,
    broken_stream: Option<String>,
    calls: Mutex<Vec<LlmRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, task: LlmTask, reply: &str) -> Self {
        self.sticky.insert(task, Ok(reply.to_string()));
        self
    }

    pub fn then(self, task: LlmTask, reply: &str) -> Self {
        if let Ok(mut queued) = self.queued.lock() {
            queued.entry(task).or_default().push_back(Ok(reply.to_string()));
        }
        self
    }

    pub fn failing(mut self, task: LlmTask) -> Self {
        self.sticky
            .insert(task, Err(LlmError::Request(format!("scripted {} failure", task.as_str()))));
        self
    }

    /// Report streams yield `partial` and then fail.
    pub fn with_broken_stream(mut self, partial: &str) -> Self {
        self.broken_stream = Some(partial.to_string());
        self
    }

    pub fn calls(&self, task: LlmTask) -> Vec<LlmRequest> {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|r| r.task == task).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        if let Some(reply) = self
            .queued
            .lock()
            .ok()
            .and_then(|mut q| q.get_mut(&request.task).and_then(|r| r.pop_front()))
        {
            return reply;
        }
        self.sticky
            .get(&request.task)
            .cloned()
            .unwrap_or_else(|| Err(LlmError::Request(format!("no script for {}", request.task.as_str()))))
    }

    async fn stream(&self, request: &LlmRequest) -> Result<TextStream, LlmError> {
        if let (LlmTask::Report, Some(partial)) = (request.task, &self.broken_stream) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(request.clone());
            }
            let items: Vec<Result<String, LlmError>> = vec![
                Ok(partial.clone()),
                Err(LlmError::Stream("connection reset".to_string())),
            ];
            return Ok(Box::pin(futures::stream::iter(items)));
        }
        let text = self.complete(request).await?;
        let chunks: Vec<Result<String, LlmError>> = crate::llm::chunk_text(&text, 40)
            .into_iter()
            .map(Ok)
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Search provider returning canned results, counting calls.
pub(crate) struct StaticProvider {
    name: String,
    results: Result<Vec<ProviderResult>, SearchError>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl StaticProvider {
    pub fn ok(name: &str, results: Vec<ProviderResult>) -> Self {
        Self {
            name: name.to_string(),
            results: Ok(results),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str, error: SearchError) -> Self {
        Self {
            name: name.to_string(),
            results: Err(error),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, _query: &str, _params: &SearchParams) -> Result<Vec<ProviderResult>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.results.clone()
    }
}
