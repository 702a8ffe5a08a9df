//! Node behaviors
//!
//! Each node reads and updates the run's [`RunState`] and reports progress
//! through the run's [`EventEmitter`]. Only planning can fail the run;
//! every other failure is recorded and degraded around.

pub mod plan;
pub mod quality;
pub mod research;
pub mod write;

use super::contradictions::ContradictionDetector;
use super::engine::EngineConfig;
use super::events::EventEmitter;
use super::state::{RunState, StageError};
use crate::llm::LanguageModel;
use crate::search::SearchRouter;

/// Collaborators shared by all nodes of one run
pub(crate) struct NodeContext<'a> {
    pub llm: &'a dyn LanguageModel,
    pub router: &'a SearchRouter,
    pub detector: &'a dyn ContradictionDetector,
    pub config: &'a EngineConfig,
    pub events: &'a EventEmitter,
}

impl NodeContext<'_> {
    /// Echo a recoverable error to the client.
    pub async fn emit_error(&self, error: &StageError) {
        self.events
            .error(&error.stage, error.detail.clone(), error.sub_question_id.as_deref())
            .await;
    }

    /// Record a recoverable error in the run state and echo it.
    pub async fn record_error(&self, state: &mut RunState, error: StageError) {
        self.emit_error(&error).await;
        state.record_error(error);
    }
}
