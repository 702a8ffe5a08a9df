//! Language model capability
//!
//! The workflow nodes talk to models only through [`LanguageModel`].
//! Implementations bridge to a concrete backend (see
//! [`RigLanguageModel`](super::RigLanguageModel)) or, in tests, return
//! scripted text.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::de::DeserializeOwned;

use crate::error::LlmError;

/// Size of the chunks produced when a backend cannot stream natively
pub const STREAM_CHUNK_CHARS: usize = 450;

/// Ordered stream of text fragments
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// What a request is for. Lets test doubles script answers per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmTask {
    Plan,
    Synthesis,
    Report,
    Summary,
    Quality,
}

impl LlmTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmTask::Plan => "plan",
            LlmTask::Synthesis => "synthesis",
            LlmTask::Report => "report",
            LlmTask::Summary => "summary",
            LlmTask::Quality => "quality",
        }
    }
}

/// A single prompt with its system preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmRequest {
    pub task: LlmTask,
    pub system: String,
    pub prompt: String,
}

impl LlmRequest {
    pub fn new(task: LlmTask, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task,
            system: system.into(),
            prompt: prompt.into(),
        }
    }
}

/// Core language model trait
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a full completion
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError>;

    /// Generate a streamed completion
    ///
    /// Default implementation falls back to `complete()` and re-chunks the
    /// text. Override for backends that support native streaming.
    async fn stream(&self, request: &LlmRequest) -> Result<TextStream, LlmError> {
        let text = self.complete(request).await?;
        let chunks: Vec<Result<String, LlmError>> = chunk_text(&text, STREAM_CHUNK_CHARS)
            .into_iter()
            .map(Ok)
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    /// Model name for logging/debugging
    fn name(&self) -> &str;
}

/// Split text into chunks of at most `size` characters.
pub fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

/// Pull the JSON object out of a model reply.
///
/// Handles fenced code blocks and leading/trailing prose.
pub fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Complete a request and decode the reply as JSON.
pub async fn complete_json<T: DeserializeOwned>(
    llm: &dyn LanguageModel,
    request: &LlmRequest,
    target: &'static str,
) -> Result<T, LlmError> {
    let raw = llm.complete(request).await?;
    if raw.trim().is_empty() {
        return Err(LlmError::EmptyResponse);
    }
    parse_json(&raw, target)
}

/// Decode a model reply as JSON.
pub fn parse_json<T: DeserializeOwned>(raw: &str, target: &'static str) -> Result<T, LlmError> {
    let body = extract_json(raw).ok_or_else(|| LlmError::Parse {
        target,
        message: "no JSON object in response".to_string(),
    })?;
    serde_json::from_str(body).map_err(|e| LlmError::Parse {
        target,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde::Deserialize;

    struct EchoModel;

    #[async_trait]
    impl LanguageModel for EchoModel {
        async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
            Ok(request.prompt.clone())
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    #[derive(Debug, Deserialize)]
    struct Verdict {
        passed: bool,
    }

    #[test]
    fn test_chunk_text() {
        assert_eq!(chunk_text("abcdef", 4), vec!["abcd", "ef"]);
        assert!(chunk_text("", 4).is_empty());
        // multi-byte characters stay intact
        assert_eq!(chunk_text("ééé", 2), vec!["éé", "é"]);
    }

    #[test]
    fn test_extract_json_from_fence() {
        let raw = "Here you go:\n```json\n{\"passed\": true}\n```";
        assert_eq!(extract_json(raw), Some("{\"passed\": true}"));
        assert_eq!(extract_json("no json"), None);
    }

    #[test]
    fn test_parse_json_error_names_target() {
        let err = parse_json::<Verdict>("{\"passed\": \"maybe\"}", "quality verdict").unwrap_err();
        match err {
            LlmError::Parse { target, .. } => assert_eq!(target, "quality verdict"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_default_stream_rechunks() {
        let text = "x".repeat(1000);
        let request = LlmRequest::new(LlmTask::Report, "", text.clone());
        let chunks: Vec<String> = EchoModel
            .stream(&request)
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), text);
    }

    #[tokio::test]
    async fn test_complete_json() {
        let request = LlmRequest::new(LlmTask::Quality, "", "{\"passed\": false}");
        let verdict: Verdict = complete_json(&EchoModel, &request, "verdict").await.unwrap();
        assert!(!verdict.passed);

        let empty = LlmRequest::new(LlmTask::Quality, "", "  ");
        let err = complete_json::<Verdict>(&EchoModel, &empty, "verdict").await.unwrap_err();
        assert_eq!(err, LlmError::EmptyResponse);
    }
}
