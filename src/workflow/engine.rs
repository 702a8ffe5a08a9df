//! Research workflow engine
//!
//! Owns the collaborators, spawns one task per run and drives the stage
//! machine from [`graph`](super::graph). Each run checks out its thread's
//! memory for the whole run, so follow-ups on the same thread see the
//! previous run's summary.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::contradictions::{ContradictionDetector, NumericClaimDetector};
use super::events::{
    DoneMetadata, DonePayload, EventEmitter, EventKind, EventStream, TraceStatus, WorkflowEvent,
    DEFAULT_EVENT_BUFFER,
};
use super::graph::{next_stage, Stage};
use super::nodes::{self, NodeContext};
use super::state::{PriorContext, RunState};
use crate::error::WorkflowError;
use crate::llm::LanguageModel;
use crate::memory::{HistoryEntry, ReportMemory, RunSummary, ThreadCheckout, ThreadMemoryStore};
use crate::search::{SearchRouter, SourcePolicy};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sub-questions researched at the same time
    pub max_concurrency: usize,

    /// Sub-questions kept from the plan
    pub max_sub_questions: usize,

    /// Search queries kept per sub-question
    pub max_queries_per_sub_question: usize,

    /// Deadline for the whole research stage
    pub research_timeout: Duration,

    /// Minimum quality score for a report to pass
    pub quality_pass_score: u8,

    /// Sub-question ids whose searches are skipped (failure drills)
    pub simulated_failures: HashSet<String>,

    /// Event channel capacity per run
    pub event_buffer: usize,

    /// Search phases each sub-question query goes through
    pub source_policy: SourcePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_sub_questions: 6,
            max_queries_per_sub_question: 2,
            research_timeout: Duration::from_secs(180),
            quality_pass_score: 72,
            simulated_failures: HashSet::new(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            source_policy: SourcePolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_max_sub_questions(mut self, max: usize) -> Self {
        self.max_sub_questions = max.max(1);
        self
    }

    pub fn with_max_queries_per_sub_question(mut self, max: usize) -> Self {
        self.max_queries_per_sub_question = max.max(1);
        self
    }

    pub fn with_research_timeout(mut self, timeout: Duration) -> Self {
        self.research_timeout = timeout;
        self
    }

    pub fn with_quality_pass_score(mut self, score: u8) -> Self {
        self.quality_pass_score = score.min(100);
        self
    }

    pub fn with_simulated_failures<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.simulated_failures = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_event_buffer(mut self, buffer: usize) -> Self {
        self.event_buffer = buffer.max(1);
        self
    }

    pub fn with_source_policy(mut self, policy: SourcePolicy) -> Self {
        self.source_policy = policy;
        self
    }
}

/// A running workflow: its thread id, event stream and task.
pub struct RunHandle {
    pub thread_id: String,
    pub events: EventStream,
    task: JoinHandle<Result<DonePayload, WorkflowError>>,
}

impl RunHandle {
    /// Drain every event, then wait for the run to finish.
    pub async fn finish(mut self) -> CompletedRun {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let result = match self.task.await {
            Ok(result) => result,
            Err(err) => Err(WorkflowError::Task(err.to_string())),
        };
        CompletedRun {
            thread_id: self.thread_id,
            events,
            result,
        }
    }

    /// Stop the run. Its thread lock is released when the task unwinds.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Everything a finished run produced
#[derive(Debug)]
pub struct CompletedRun {
    pub thread_id: String,
    pub events: Vec<WorkflowEvent>,
    pub result: Result<DonePayload, WorkflowError>,
}

/// Deep-research workflow engine
#[derive(Clone)]
pub struct ResearchEngine {
    llm: Arc<dyn LanguageModel>,
    router: Arc<SearchRouter>,
    store: ThreadMemoryStore,
    detector: Arc<dyn ContradictionDetector>,
    config: EngineConfig,
}

impl ResearchEngine {
    pub fn new(llm: Arc<dyn LanguageModel>, router: Arc<SearchRouter>, store: ThreadMemoryStore) -> Self {
        Self {
            llm,
            router,
            store,
            detector: Arc::new(NumericClaimDetector::default()),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn ContradictionDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &ThreadMemoryStore {
        &self.store
    }

    /// Start a run. A missing or blank thread id gets a fresh one.
    pub fn run(&self, query: impl Into<String>, thread_id: Option<String>) -> RunHandle {
        let thread_id = thread_id
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (events, stream) = EventEmitter::channel(thread_id.clone(), self.config.event_buffer);

        let engine = self.clone();
        let query = query.into();
        let task = tokio::spawn(async move { engine.execute(query, events).await });

        RunHandle {
            thread_id,
            events: stream,
            task,
        }
    }

    /// Run to the end and collect every event.
    pub async fn run_to_completion(&self, query: impl Into<String>, thread_id: Option<String>) -> CompletedRun {
        self.run(query, thread_id).finish().await
    }

    async fn execute(&self, query: String, events: EventEmitter) -> Result<DonePayload, WorkflowError> {
        let thread_id = events.thread_id().to_string();
        events.emit(EventKind::ThreadId {}).await;

        let query = query.trim().to_string();
        if query.is_empty() {
            return Err(self.abort_run(&events, None, &query, WorkflowError::EmptyQuery).await);
        }

        let checkout = match self.store.checkout(&thread_id).await {
            Ok(checkout) => checkout,
            Err(err) => return Err(self.abort_run(&events, None, &query, err.into()).await),
        };

        info!(thread_id = %thread_id, query = %query, "Research run started");
        let mut state = RunState::new(query, thread_id, PriorContext::from(checkout.memory()));
        let ctx = NodeContext {
            llm: self.llm.as_ref(),
            router: self.router.as_ref(),
            detector: self.detector.as_ref(),
            config: &self.config,
            events: &events,
        };

        let mut stage = Stage::Plan;
        while !stage.is_terminal() {
            let node = stage.as_str();
            events.trace(node, TraceStatus::Start, None).await;
            let started = Instant::now();

            let outcome = match stage {
                Stage::Plan => nodes::plan::run(&ctx, &mut state).await,
                Stage::Research => {
                    nodes::research::run(&ctx, &mut state).await;
                    Ok(())
                }
                Stage::Write => {
                    nodes::write::run(&ctx, &mut state).await;
                    Ok(())
                }
                Stage::Quality => {
                    nodes::quality::run(&ctx, &mut state).await;
                    Ok(())
                }
                Stage::End => Ok(()),
            };

            let elapsed = started.elapsed().as_millis() as u64;
            state.add_timing(node, elapsed);
            events.trace(node, TraceStatus::End, Some(elapsed)).await;

            if let Err(err) = outcome {
                return Err(self.abort_run(&events, Some(checkout), &state.query, err).await);
            }

            let next = next_stage(stage, &state);
            if stage == Stage::Quality && next == Stage::Write {
                state.rewrite_count += 1;
                info!(rewrite_count = state.rewrite_count, "Quality gate requested a rewrite");
            }
            stage = next;
        }

        let done = done_payload(&state);
        let summary = run_summary(&state, &done);
        if let Err(err) = checkout.save(summary).await {
            warn!(thread_id = %state.thread_id(), error = %err, "Failed to save thread memory");
            events.error("memory", err.to_string(), None).await;
        }

        info!(
            thread_id = %state.thread_id(),
            sources = done.metadata.sources_analyzed,
            quality_score = ?done.metadata.quality_score,
            refinement_used = done.metadata.refinement_used,
            errors = state.errors.len(),
            "Research run finished"
        );
        events.emit(EventKind::Done(done.clone())).await;
        Ok(done)
    }

    /// Fatal path: report the failing stage, then the terminal workflow
    /// error, and remember the user's turn.
    async fn abort_run(
        &self,
        events: &EventEmitter,
        checkout: Option<ThreadCheckout>,
        query: &str,
        err: WorkflowError,
    ) -> WorkflowError {
        error!(thread_id = %events.thread_id(), stage = err.stage(), error = %err, "Research run failed");
        events.error(err.stage(), err.to_string(), None).await;
        events
            .error("workflow", format!("Run aborted: {}", err), None)
            .await;

        if let Some(checkout) = checkout {
            let summary = RunSummary {
                messages: vec![HistoryEntry::user(query)],
                report: None,
            };
            if let Err(save_err) = checkout.save(summary).await {
                warn!(thread_id = %events.thread_id(), error = %save_err, "Failed to save thread memory");
            }
        }
        err
    }
}

fn done_payload(state: &RunState) -> DonePayload {
    let report = state.report.clone().unwrap_or_default();
    DonePayload {
        query: state.query.clone(),
        executive_summary: report.executive_summary,
        report: report.report,
        key_takeaways: report.key_takeaways,
        limitations: report.limitations,
        citations: state.citations.clone(),
        metadata: DoneMetadata {
            sub_question_count: state.plan.sub_questions.len(),
            sources_analyzed: state.citations.len(),
            completion_timestamp: Utc::now(),
            quality_score: state.quality.as_ref().map(|q| q.score),
            refinement_used: state.rewrite_count > 0,
            timings_ms: state.metadata.timings_ms.clone(),
            research_skipped: state.plan.skip_research,
        },
    }
}

fn run_summary(state: &RunState, done: &DonePayload) -> RunSummary {
    let mut gaps: Vec<String> = state
        .empty_sub_questions()
        .iter()
        .map(|sq| format!("No evidence found for: {}", sq.question))
        .collect();
    for gap in state.all_gaps() {
        if !gaps.contains(&gap) {
            gaps.push(gap);
        }
    }

    RunSummary {
        messages: vec![
            HistoryEntry::user(state.query.clone()),
            HistoryEntry::assistant(done.report.clone()),
        ],
        report: Some(ReportMemory {
            query: state.query.clone(),
            executive_summary: done.executive_summary.clone(),
            key_takeaways: done.key_takeaways.clone(),
            limitations: done.limitations.clone(),
            gaps,
            citations: done.citations.clone(),
            completed_at: done.metadata.completion_timestamp,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmTask;
    use crate::memory::MemoryConfig;
    use crate::search::{ProviderResult, RouterConfig};
    use crate::testing::{ScriptedModel, StaticProvider};

    fn engine(llm: ScriptedModel) -> ResearchEngine {
        let provider = StaticProvider::ok(
            "exa",
            vec![ProviderResult::new("exa", "Result", "https://example.com/a", "Body text")],
        );
        let router = SearchRouter::new(RouterConfig::default()).with_primary(Arc::new(provider));
        ResearchEngine::new(
            Arc::new(llm),
            Arc::new(router),
            ThreadMemoryStore::in_memory(MemoryConfig::default()),
        )
    }

    fn scripted() -> ScriptedModel {
        ScriptedModel::new()
            .with(
                LlmTask::Plan,
                r#"{"sub_questions": [{"question": "What?", "priority": 1, "search_queries": ["what"]}]}"#,
            )
            .with(
                LlmTask::Synthesis,
                r#"{"evidence_bullets": ["a", "b", "c", "d"], "gaps": ["g"]}"#,
            )
            .with(LlmTask::Report, "Context\n-------\nBody [S1]")
            .with(LlmTask::Summary, r#"{"executive_summary": "s", "key_takeaways": [], "limitations": "l"}"#)
            .with(LlmTask::Quality, r#"{"pass_check": true}"#)
    }

    #[tokio::test]
    async fn test_event_envelope() {
        let run = engine(scripted()).run_to_completion("What?", Some("t-1".to_string())).await;

        assert_eq!(run.thread_id, "t-1");
        let names: Vec<_> = run.events.iter().map(|e| e.name()).collect();
        assert_eq!(names.first(), Some(&"thread_id"));
        assert_eq!(names.last(), Some(&"done"));
        assert_eq!(run.events.iter().filter(|e| e.kind.is_terminal()).count(), 1);
        assert!(run.events.iter().all(|e| e.thread_id == "t-1"));

        let traces: Vec<_> = run
            .events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Trace { node, status, .. } => Some((node.as_str(), *status)),
                _ => None,
            })
            .collect();
        assert_eq!(traces[0], ("plan", TraceStatus::Start));
        assert_eq!(traces[1], ("plan", TraceStatus::End));
        assert!(traces.contains(&("quality", TraceStatus::End)));
    }

    #[tokio::test]
    async fn test_generates_thread_id() {
        let run = engine(scripted()).run_to_completion("What?", Some("  ".to_string())).await;
        assert!(Uuid::parse_str(&run.thread_id).is_ok());
    }

    #[tokio::test]
    async fn test_planning_failure_is_terminal() {
        let engine = engine(scripted().failing(LlmTask::Plan));
        let run = engine.run_to_completion("What?", Some("t-2".to_string())).await;

        assert!(matches!(run.result, Err(WorkflowError::Planning(_))));
        let last = run.events.last().unwrap();
        assert!(matches!(&last.kind, EventKind::Error { stage, .. } if stage == "workflow"));
        assert!(!run.events.iter().any(|e| e.name() == "done"));

        // the user's turn is still remembered
        let memory = engine.store().load("t-2").await.unwrap();
        assert_eq!(memory.history.len(), 1);
        assert!(memory.report_memories.is_empty());
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let run = engine(scripted()).run_to_completion("   ", None).await;
        assert!(matches!(run.result, Err(WorkflowError::EmptyQuery)));
        assert_eq!(run.events.iter().filter(|e| e.kind.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_success_saves_memory() {
        let engine = engine(scripted());
        let run = engine.run_to_completion("What?", Some("t-3".to_string())).await;
        let done = run.result.unwrap();

        let memory = engine.store().load("t-3").await.unwrap();
        assert_eq!(memory.history.len(), 2);
        assert_eq!(memory.history[1].content, done.report);
        assert_eq!(memory.report_memories[0].gaps, vec!["g"]);
        assert_eq!(memory.run_count, 1);
        assert!(done.metadata.timings_ms.contains_key("research"));
    }
}
