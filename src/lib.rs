//! deep_research: multi-provider deep research workflow
//!
//! - `workflow`: plan → research → write → quality state machine that
//!   streams progress events and asks for at most one rewrite
//! - `search`: Exa / Firecrawl / Tavily / Wikipedia clients behind one
//!   router that fans out, dedupes, scores by relevance and credibility,
//!   and falls back; a per-run budget caps paid calls and accepted sources
//! - `memory`: per-thread history and report snapshots with a derived
//!   shared-memory digest for follow-up questions
//! - `llm`: `LanguageModel` trait with a rig-core backend (Ollama or OpenAI)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use deep_research::{
//!     ExaSearchProvider, MemoryConfig, ResearchEngine, RigLanguageModel, RouterConfig,
//!     SearchRouter, TavilySearchProvider, ThreadMemoryStore,
//! };
//!
//! let router = SearchRouter::new(RouterConfig::default())
//!     .with_primary(Arc::new(ExaSearchProvider::from_env()?))
//!     .with_fallback(Arc::new(TavilySearchProvider::from_env()?));
//! let llm = Arc::new(RigLanguageModel::ollama("http://localhost:11434", "llama3.2")?);
//! let engine = ResearchEngine::new(llm, Arc::new(router), ThreadMemoryStore::in_memory(MemoryConfig::default()));
//!
//! let run = engine.run_to_completion("State of solid-state batteries", None).await;
//! println!("{}", run.result?.report);
//! ```

pub mod error;
pub mod llm;
pub mod memory;
pub mod search;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use error::{LlmError, MemoryError, SearchError, WorkflowError};
pub use llm::{LanguageModel, LlmBackend, LlmRequest, LlmTask, RigLanguageModel, TextStream};
pub use memory::{
    HistoryEntry, InMemoryBackend, MemoryBackend, MemoryConfig, ReportMemory, Role, RunSummary,
    SharedMemory, ThreadMemory, ThreadMemoryStore,
};
pub use search::{
    Citation, EvidenceItem, ExaSearchProvider, FetchStatus, FirecrawlSearchProvider,
    ProviderResult, RouterConfig, RouterOutcome, SearchBudget, SearchConstraints, SearchParams,
    SearchProvider, SearchRouter, SourcePolicy, TavilySearchProvider, WikipediaSearchProvider,
};
pub use workflow::{
    CompletedRun, ContradictionDetector, DonePayload, EngineConfig, EventKind, NumericClaimDetector,
    ResearchEngine, RunHandle, WorkflowEvent,
};
