//! Deep-research workflow
//!
//! # Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Research Workflow                        │
//! │                                                               │
//! │  Plan       query → prioritized sub-questions                 │
//! │   │         (skips research for context-only follow-ups)      │
//! │   ▼                                                           │
//! │  Research   router per query, bounded concurrency,            │
//! │   │         synthesis + contradiction notes per sub-question  │
//! │   ▼                                                           │
//! │  Write      streamed report with [S#] anchors, then summary   │
//! │   │  ▲                                                        │
//! │   ▼  │ one rewrite with reviewer feedback                     │
//! │  Quality    deterministic checks + model verdict              │
//! │   │                                                           │
//! │   ▼                                                           │
//! │  End        memory saved, `done` emitted                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let engine = ResearchEngine::new(llm, Arc::new(router), ThreadMemoryStore::in_memory(MemoryConfig::default()));
//! let mut handle = engine.run("Impact of heat pumps on EU grid demand", None);
//! while let Some(event) = handle.events.next().await {
//!     print!("{}", event.to_sse());
//! }
//! ```

pub mod contradictions;
pub mod engine;
pub mod events;
pub mod graph;
pub mod nodes;
pub mod prompts;
pub mod state;

pub use contradictions::{ContradictionDetector, NumericClaimDetector};
pub use engine::{CompletedRun, EngineConfig, ResearchEngine, RunHandle};
pub use events::{
    DoneMetadata, DonePayload, EventEmitter, EventKind, EventStream, ProgressStatus, TraceStatus,
    WorkflowEvent,
};
pub use graph::{next_stage, Stage, MAX_REWRITES};
pub use state::{
    FinalReport, Plan, PriorContext, QualityAssessment, ResearchNote, RunMetadata, RunState,
    StageError, SubQuestion,
};
