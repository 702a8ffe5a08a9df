//! rig-core backed language model
//!
//! Wraps a rig Ollama or OpenAI client behind [`LanguageModel`]. A fresh
//! agent is built per request so every call carries its own preamble.
//! Reports are streamed token by token through rig's streaming prompt.

use std::fmt::Display;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rig::agent::{Agent, MultiTurnStreamItem};
use rig::client::{CompletionClient, Nothing, ProviderClient};
use rig::completion::{CompletionModel, GetTokenUsage, Prompt};
use rig::providers::{ollama, openai};
use rig::streaming::{StreamedAssistantContent, StreamingPrompt};
use tracing::debug;

use super::provider::{LanguageModel, LlmRequest, TextStream};
use crate::error::LlmError;

/// Which rig provider to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Ollama,
    OpenAi,
}

impl LlmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmBackend::Ollama => "ollama",
            LlmBackend::OpenAi => "openai",
        }
    }
}

impl std::str::FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(LlmBackend::Ollama),
            "openai" => Ok(LlmBackend::OpenAi),
            other => Err(format!("unknown LLM provider '{}' (expected ollama or openai)", other)),
        }
    }
}

enum RigClient {
    Ollama(ollama::Client),
    OpenAi(openai::Client),
}

pub struct RigLanguageModel {
    client: RigClient,
    model: String,
    temperature: f64,
}

impl RigLanguageModel {
    /// Local Ollama model served at `host`.
    pub fn ollama(host: &str, model: impl Into<String>) -> Result<Self, LlmError> {
        let client = ollama::Client::builder()
            .api_key(Nothing)
            .base_url(host)
            .build()
            .map_err(|e| LlmError::Request(format!("invalid Ollama host {}: {}", host, e)))?;
        Ok(Self {
            client: RigClient::Ollama(client),
            model: model.into(),
            temperature: 0.2,
        })
    }

    /// OpenAI model. Requires OPENAI_API_KEY.
    pub fn openai(model: impl Into<String>) -> Result<Self, LlmError> {
        if std::env::var("OPENAI_API_KEY").map_or(true, |k| k.trim().is_empty()) {
            return Err(LlmError::Request("OPENAI_API_KEY is not set".to_string()));
        }
        Ok(Self {
            client: RigClient::OpenAi(openai::Client::from_env()),
            model: model.into(),
            temperature: 0.2,
        })
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LanguageModel for RigLanguageModel {
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
        debug!(
            task = request.task.as_str(),
            model = %self.model,
            prompt_chars = request.prompt.len(),
            "LLM request"
        );

        let response = match &self.client {
            RigClient::Ollama(client) => {
                let agent = client
                    .agent(&self.model)
                    .preamble(&request.system)
                    .temperature(self.temperature)
                    .build();
                agent.prompt(request.prompt.as_str()).await
            }
            RigClient::OpenAi(client) => {
                let agent = client
                    .agent(&self.model)
                    .preamble(&request.system)
                    .temperature(self.temperature)
                    .build();
                agent.prompt(request.prompt.as_str()).await
            }
        }
        .map_err(|e| LlmError::Request(format!("{} completion failed: {}", self.name(), e)))?;

        if response.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(response)
    }

    async fn stream(&self, request: &LlmRequest) -> Result<TextStream, LlmError> {
        debug!(
            task = request.task.as_str(),
            model = %self.model,
            prompt_chars = request.prompt.len(),
            "LLM stream request"
        );

        let stream = match &self.client {
            RigClient::Ollama(client) => {
                let agent = client
                    .agent(&self.model)
                    .preamble(&request.system)
                    .temperature(self.temperature)
                    .build();
                text_stream(agent, &request.prompt).await
            }
            RigClient::OpenAi(client) => {
                let agent = client
                    .agent(&self.model)
                    .preamble(&request.system)
                    .temperature(self.temperature)
                    .build();
                text_stream(agent, &request.prompt).await
            }
        };
        Ok(stream)
    }

    fn name(&self) -> &str {
        match self.client {
            RigClient::Ollama(_) => "ollama",
            RigClient::OpenAi(_) => "openai",
        }
    }
}

async fn text_stream<M>(agent: Agent<M>, prompt: &str) -> TextStream
where
    M: CompletionModel + 'static,
    M::StreamingResponse: GetTokenUsage + Send,
{
    text_deltas(agent.stream_prompt(prompt.to_string()).await)
}

/// Text deltas of a rig multi-turn stream. Tool calls, reasoning and the
/// final usage record are skipped.
fn text_deltas<S, R, E>(stream: S) -> TextStream
where
    S: Stream<Item = Result<MultiTurnStreamItem<R>, E>> + Send + 'static,
    R: Send + 'static,
    E: Display + Send + 'static,
{
    Box::pin(stream.filter_map(|item| async move {
        match item {
            Ok(MultiTurnStreamItem::StreamAssistantItem(StreamedAssistantContent::Text(text))) => {
                Some(Ok(text.text))
            }
            Ok(_) => None,
            Err(err) => Some(Err(LlmError::Stream(err.to_string()))),
        }
    }))
}
