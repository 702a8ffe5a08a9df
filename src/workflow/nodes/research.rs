//! Research node: bounded-concurrency evidence gathering per sub-question
//!
//! ```text
//!   sq1 ──┐                                     ┌─▶ note sq1
//!   sq2 ──┼─▶ [permit] ─▶ router per query ─▶ merge ─▶ synthesis ─┼─▶ note sq2
//!   sq3 ──┘     (max_concurrency)                     └─▶ ...
//! ```
//!
//! Sub-questions start in priority order. The stage deadline drops whatever
//! is still in flight; finished notes are kept. Every sub-question draws on
//! one search budget per run: paid calls and accepted sources are capped
//! across the whole run, not per sub-question.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::NodeContext;
use crate::llm::{complete_json, LlmRequest, LlmTask};
use crate::search::policy::{ENOUGH_SOURCES, HISTORICAL_RESULTS_PER_QUERY, REFERENCE_RESULTS};
use crate::search::scoring::trusted_domain_seeds;
use crate::search::{
    normalize_url, query_intent, EvidenceItem, FetchStatus, QueryIntent, RouterOutcome, SearchBudget,
    SearchConstraints, SearchPhase,
};
use crate::workflow::contradictions::MAX_CONTRADICTIONS;
use crate::workflow::events::{EventKind, ProgressStatus};
use crate::workflow::prompts::ResearchPrompts;
use crate::workflow::state::{ResearchNote, RunState, StageError, SubQuestion};

const MIN_BULLETS: usize = 4;
const MAX_BULLETS: usize = 8;
const MAX_GAPS: usize = 5;

const THIN_EVIDENCE_BULLET: &str = "Insufficient evidence volume for this sub-question.";
const FALLBACK_GAP: &str = "Need additional high-quality sources for stronger confidence.";

#[derive(Debug, Default, Deserialize)]
struct SynthesisOutput {
    #[serde(default)]
    evidence_bullets: Vec<String>,
    #[serde(default)]
    contradictions: Vec<String>,
    #[serde(default)]
    gaps: Vec<String>,
}

/// Search settings shared by every sub-question of one run.
struct RunSearch {
    budget: Arc<SearchBudget>,
    phases: Vec<SearchPhase>,
    intent: QueryIntent,
}

impl RunSearch {
    fn constraints(&self, phase: SearchPhase) -> SearchConstraints {
        let mut constraints = SearchConstraints {
            budget: Some(self.budget.clone()),
            ..Default::default()
        };
        if phase == SearchPhase::Trusted {
            constraints.include_domains = trusted_domain_seeds();
        }
        if self.intent == QueryIntent::Historical {
            constraints.max_results = Some(HISTORICAL_RESULTS_PER_QUERY);
        }
        constraints
    }
}

/// What one sub-question task hands back to the stage.
#[derive(Debug)]
struct SubQuestionOutcome {
    note: ResearchNote,
    errors: Vec<StageError>,
    fallback_searches: usize,
}

pub(crate) async fn run(ctx: &NodeContext<'_>, state: &mut RunState) {
    state.research_ran = true;
    let query = state.query.clone();
    let sub_questions = state.plan.sub_questions.clone();
    let permits = Semaphore::new(ctx.config.max_concurrency.max(1));
    let deadline = Instant::now() + ctx.config.research_timeout;
    let intent = query_intent(&query);
    let search = RunSearch {
        budget: ctx.router.run_budget(),
        phases: ctx.config.source_policy.phases(intent),
        intent,
    };

    info!(
        sub_questions = sub_questions.len(),
        max_concurrency = ctx.config.max_concurrency,
        policy = %ctx.config.source_policy,
        intent = ?intent,
        "Research started"
    );

    let mut pending: FuturesUnordered<_> = sub_questions
        .iter()
        .map(|sq| research_sub_question(ctx, &permits, &search, sq, &query))
        .collect();

    let mut outcomes: HashMap<String, SubQuestionOutcome> = HashMap::new();
    let mut timed_out = false;
    loop {
        match timeout_at(deadline, pending.next()).await {
            Ok(Some(outcome)) => {
                outcomes.insert(outcome.note.sub_question_id.clone(), outcome);
            }
            Ok(None) => break,
            Err(_) => {
                timed_out = true;
                break;
            }
        }
    }
    // cancels in-flight sub-questions and their provider calls
    drop(pending);

    if timed_out {
        warn!(
            finished = outcomes.len(),
            total = sub_questions.len(),
            timeout_secs = ctx.config.research_timeout.as_secs(),
            "Research deadline reached"
        );
        state.metadata.research_timed_out = true;
    }

    // apply in plan order so the error log is deterministic
    for sq in &sub_questions {
        match outcomes.remove(&sq.id) {
            Some(outcome) => {
                state.metadata.fallback_searches += outcome.fallback_searches;
                state.errors.extend(outcome.errors);
                state.research_notes.insert(sq.id.clone(), outcome.note);
            }
            None => {
                let mut note = ResearchNote::empty(&sq.id);
                note.gaps.push(format!("Research timed out before answering: {}", sq.question));
                state.research_notes.insert(sq.id.clone(), note);

                let error = StageError::for_sub_question(
                    "research",
                    &sq.id,
                    format!("Research deadline reached before {} completed", sq.id),
                );
                ctx.record_error(state, error).await;
                ctx.events
                    .emit(EventKind::ResearchProgress {
                        sub_question_id: sq.id.clone(),
                        status: ProgressStatus::Failed,
                        evidence_count: 0,
                        message: "Timed out".to_string(),
                    })
                    .await;
            }
        }
    }

    state.rebuild_citations();
    info!(
        search_calls = search.budget.calls_made(),
        accepted_sources = search.budget.sources_accepted(),
        citations = state.citations.len(),
        empty = state.empty_sub_questions().len(),
        "Research finished"
    );
}

async fn research_sub_question(
    ctx: &NodeContext<'_>,
    permits: &Semaphore,
    search: &RunSearch,
    sq: &SubQuestion,
    query: &str,
) -> SubQuestionOutcome {
    let _permit = permits.acquire().await.ok();

    let mut outcome = SubQuestionOutcome {
        note: ResearchNote::empty(&sq.id),
        errors: Vec::new(),
        fallback_searches: 0,
    };

    ctx.events
        .emit(EventKind::ResearchProgress {
            sub_question_id: sq.id.clone(),
            status: ProgressStatus::Started,
            evidence_count: 0,
            message: sq.question.clone(),
        })
        .await;

    let evidence = if ctx.config.simulated_failures.contains(&sq.id) {
        let error = StageError::for_sub_question(
            "research",
            &sq.id,
            format!("Simulated search failure for {}", sq.id),
        );
        ctx.emit_error(&error).await;
        outcome.errors.push(error);
        Vec::new()
    } else {
        gather_evidence(ctx, sq, search, &mut outcome).await
    };

    if evidence.is_empty() {
        let error = StageError::for_sub_question(
            "research",
            &sq.id,
            format!("No evidence gathered for {}", sq.id),
        );
        ctx.emit_error(&error).await;
        outcome.errors.push(error);
        outcome.note.gaps.push(format!("No evidence found for: {}", sq.question));
        ctx.events
            .emit(EventKind::ResearchProgress {
                sub_question_id: sq.id.clone(),
                status: ProgressStatus::Failed,
                evidence_count: 0,
                message: "No evidence found".to_string(),
            })
            .await;
        return outcome;
    }

    let synthesis = synthesize(ctx, sq, query, &evidence, &mut outcome).await;
    let mut contradictions = synthesis.contradictions;
    for detected in ctx.detector.detect(&evidence) {
        if !contradictions.contains(&detected) {
            contradictions.push(detected);
        }
    }
    contradictions.truncate(MAX_CONTRADICTIONS);

    let count = evidence.len();
    outcome.note.evidence = evidence;
    outcome.note.evidence_bullets = synthesis.evidence_bullets;
    outcome.note.contradictions = contradictions;
    outcome.note.gaps = synthesis.gaps;

    ctx.events
        .emit(EventKind::ResearchProgress {
            sub_question_id: sq.id.clone(),
            status: ProgressStatus::Completed,
            evidence_count: count,
            message: format!("Collected {} sources", count),
        })
        .await;
    outcome
}

/// Router calls per derived query and search phase, merged and capped.
async fn gather_evidence(
    ctx: &NodeContext<'_>,
    sq: &SubQuestion,
    search: &RunSearch,
    outcome: &mut SubQuestionOutcome,
) -> Vec<EvidenceItem> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut merged: Vec<EvidenceItem> = Vec::new();

    for search_query in &sq.search_queries {
        if search.budget.sources_exhausted() {
            debug!(sub_question = %sq.id, "Run source budget spent, skipping remaining queries");
            break;
        }
        for &phase in &search.phases {
            let result = match phase {
                SearchPhase::Reference => ctx.router.search_reference(search_query, REFERENCE_RESULTS).await,
                SearchPhase::Trusted | SearchPhase::Broad => {
                    ctx.router.search(search_query, &search.constraints(phase)).await
                }
            };
            debug!(
                sub_question = %sq.id,
                phase = phase.as_str(),
                results = result.evidence.len(),
                "Search phase finished"
            );
            merge_outcome(ctx, sq, search, result, &mut seen, &mut merged, outcome).await;
            if phase != SearchPhase::Reference && merged.len() >= ENOUGH_SOURCES {
                break;
            }
        }
    }

    if merged.is_empty() && ctx.router.has_reference() && !search.budget.sources_exhausted() {
        debug!(sub_question = %sq.id, "No evidence from search phases, asking reference provider");
        let result = ctx.router.search_reference(&sq.question, REFERENCE_RESULTS).await;
        merge_outcome(ctx, sq, search, result, &mut seen, &mut merged, outcome).await;
    }

    merged.sort_by(|a, b| b.score.total_cmp(&a.score));
    merged.truncate(ctx.router.config().max_evidence);
    let accepted = merged
        .iter()
        .take_while(|_| search.budget.try_accept_source())
        .count();
    if accepted < merged.len() {
        debug!(
            sub_question = %sq.id,
            dropped = merged.len() - accepted,
            "Run source budget reached"
        );
    }
    merged.truncate(accepted);

    for item in &merged {
        emit_source(ctx, &sq.id, item, FetchStatus::Fetched).await;
    }
    debug!(sub_question = %sq.id, evidence = merged.len(), "Evidence merged");
    merged
}

/// Fold one router outcome into the sub-question's evidence and report its
/// failures, rejected items and duplicates.
async fn merge_outcome(
    ctx: &NodeContext<'_>,
    sq: &SubQuestion,
    search: &RunSearch,
    result: RouterOutcome,
    seen: &mut HashSet<String>,
    merged: &mut Vec<EvidenceItem>,
    outcome: &mut SubQuestionOutcome,
) {
    if result.fallback_used {
        outcome.fallback_searches += 1;
    }
    if result.call_cap_reached && search.budget.note_call_cap() {
        let error = StageError::for_sub_question(
            "research",
            &sq.id,
            format!(
                "Search call cap reached ({}/{}); switching to reference search for this run",
                search.budget.calls_made(),
                search.budget.max_calls()
            ),
        );
        ctx.emit_error(&error).await;
        outcome.errors.push(error);
    }
    for provider in &result.quota_exhausted {
        let error = StageError::for_sub_question(
            "research",
            &sq.id,
            format!("{} quota exceeded; skipped for the rest of this run", provider),
        );
        ctx.emit_error(&error).await;
        outcome.errors.push(error);
    }

    for failure in &result.failures {
        ctx.events
            .emit(EventKind::SourceFetch {
                sub_question_id: sq.id.clone(),
                source_name: failure.provider.clone(),
                title: failure.error.to_string(),
                url: String::new(),
                status: FetchStatus::Failed,
            })
            .await;
    }
    for item in &result.rejected {
        emit_source(ctx, &sq.id, item, FetchStatus::Failed).await;
    }

    let mut duplicates = result.duplicates;
    for item in result.evidence {
        let key = normalize_url(&item.url).unwrap_or_else(|| item.url.clone());
        if seen.insert(key) {
            merged.push(item);
        } else {
            duplicates.push(EvidenceItem {
                fetch_status: FetchStatus::Deduped,
                ..item
            });
        }
    }
    for item in duplicates {
        emit_source(ctx, &sq.id, &item, FetchStatus::Deduped).await;
    }
}

async fn emit_source(ctx: &NodeContext<'_>, sub_question_id: &str, item: &EvidenceItem, status: FetchStatus) {
    ctx.events
        .emit(EventKind::SourceFetch {
            sub_question_id: sub_question_id.to_string(),
            source_name: item.source_name.clone(),
            title: item.title.clone(),
            url: item.url.clone(),
            status,
        })
        .await;
}

async fn synthesize(
    ctx: &NodeContext<'_>,
    sq: &SubQuestion,
    query: &str,
    evidence: &[EvidenceItem],
    outcome: &mut SubQuestionOutcome,
) -> SynthesisOutput {
    let request = LlmRequest::new(
        LlmTask::Synthesis,
        ResearchPrompts::synthesis_system(),
        ResearchPrompts::synthesis(&format!("{} (overall query: {})", sq.question, query), evidence),
    );

    match complete_json::<SynthesisOutput>(ctx.llm, &request, "synthesis").await {
        Ok(mut output) => {
            output.evidence_bullets.retain(|b| !b.trim().is_empty());
            if output.evidence_bullets.len() < MIN_BULLETS {
                debug!(sub_question = %sq.id, "Synthesis too thin, using evidence titles");
                return fallback_synthesis(evidence);
            }
            output.evidence_bullets.truncate(MAX_BULLETS);
            output.contradictions.retain(|c| !c.trim().is_empty());
            output.contradictions.truncate(MAX_CONTRADICTIONS);
            output.gaps.retain(|g| !g.trim().is_empty());
            output.gaps.truncate(MAX_GAPS);
            output
        }
        Err(err) => {
            warn!(sub_question = %sq.id, error = %err, "Synthesis failed, using evidence titles");
            let error = StageError::for_sub_question(
                "research",
                &sq.id,
                format!("Synthesis failed ({}); evidence titles used instead", err),
            );
            ctx.emit_error(&error).await;
            outcome.errors.push(error);
            fallback_synthesis(evidence)
        }
    }
}

fn fallback_synthesis(evidence: &[EvidenceItem]) -> SynthesisOutput {
    let mut bullets: Vec<String> = evidence.iter().take(MAX_BULLETS).map(|e| e.title.clone()).collect();
    while bullets.len() < MIN_BULLETS {
        bullets.push(THIN_EVIDENCE_BULLET.to_string());
    }
    SynthesisOutput {
        evidence_bullets: bullets,
        contradictions: Vec::new(),
        gaps: vec![FALLBACK_GAP.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::error::SearchError;
    use crate::search::{
        ProviderResult, RouterConfig, SearchParams, SearchProvider, SearchRouter, SourcePolicy,
    };
    use crate::testing::{ScriptedModel, StaticProvider};
    use crate::workflow::contradictions::NumericClaimDetector;
    use crate::workflow::engine::EngineConfig;
    use crate::workflow::events::{EventEmitter, WorkflowEvent};
    use crate::workflow::state::{PriorContext, SubQuestion};

    const SYNTHESIS: &str = r#"{"evidence_bullets": ["a", "b", "c", "d"], "contradictions": [], "gaps": ["more data"]}"#;

    fn sub_question(id: &str, priority: u32) -> SubQuestion {
        SubQuestion {
            id: id.to_string(),
            question: format!("Question {}", id),
            priority,
            search_queries: vec![format!("query {}", id)],
        }
    }

    fn result(url: &str) -> ProviderResult {
        ProviderResult::new("exa", format!("Title {}", url), url, "Some extracted page text")
    }

    async fn run_research(
        router: SearchRouter,
        llm: ScriptedModel,
        config: EngineConfig,
        sub_questions: Vec<SubQuestion>,
    ) -> (RunState, Vec<WorkflowEvent>) {
        let (events, mut stream) = EventEmitter::channel("t1", 1024);
        let detector = NumericClaimDetector::default();
        let mut state = RunState::new("overall", "t1", PriorContext::default());
        state.plan.sub_questions = sub_questions;
        {
            let ctx = NodeContext {
                llm: &llm,
                router: &router,
                detector: &detector,
                config: &config,
                events: &events,
            };
            run(&ctx, &mut state).await;
        }
        drop(events);
        let mut collected = Vec::new();
        while let Some(event) = stream.recv().await {
            collected.push(event);
        }
        (state, collected)
    }

    #[tokio::test]
    async fn test_merges_queries_and_emits_statuses() {
        let provider = Arc::new(StaticProvider::ok(
            "exa",
            vec![result("https://a.com/1"), result("https://b.com/2")],
        ));
        let router = SearchRouter::new(RouterConfig::default()).with_primary(provider.clone());
        let mut sq = sub_question("sq1", 1);
        sq.search_queries.push("second query".to_string());

        let (state, events) = run_research(
            router,
            ScriptedModel::new().with(LlmTask::Synthesis, SYNTHESIS),
            EngineConfig::default(),
            vec![sq],
        )
        .await;

        assert_eq!(provider.call_count(), 2);
        let note = &state.research_notes["sq1"];
        assert_eq!(note.evidence.len(), 2);
        assert_eq!(note.evidence_bullets.len(), 4);
        assert_eq!(state.citations.len(), 2);
        assert!(state.errors.is_empty());

        let statuses: Vec<FetchStatus> = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::SourceFetch { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        // second query returns the same two urls
        assert_eq!(
            statuses,
            vec![FetchStatus::Deduped, FetchStatus::Deduped, FetchStatus::Fetched, FetchStatus::Fetched]
        );
    }

    #[tokio::test]
    async fn test_zero_evidence_becomes_gap() {
        let router = SearchRouter::new(RouterConfig::default())
            .with_primary(Arc::new(StaticProvider::failing("exa", SearchError::Unauthorized)));

        let (state, events) = run_research(
            router,
            ScriptedModel::new(),
            EngineConfig::default(),
            vec![sub_question("sq1", 1)],
        )
        .await;

        let note = &state.research_notes["sq1"];
        assert!(note.evidence.is_empty());
        assert_eq!(note.gaps, vec!["No evidence found for: Question sq1"]);
        assert_eq!(state.errors.len(), 1);
        assert_eq!(state.errors[0].sub_question_id.as_deref(), Some("sq1"));
        assert_eq!(state.empty_sub_questions().len(), 1);
        assert!(events.iter().any(|e| matches!(
            &e.kind,
            EventKind::SourceFetch { status: FetchStatus::Failed, source_name, .. } if source_name == "exa"
        )));
        assert!(events.iter().any(|e| matches!(
            &e.kind,
            EventKind::ResearchProgress { status: ProgressStatus::Failed, .. }
        )));
    }

    #[tokio::test]
    async fn test_simulated_failure_skips_search() {
        let provider = Arc::new(StaticProvider::ok("exa", vec![result("https://a.com/1")]));
        let router = SearchRouter::new(RouterConfig::default()).with_primary(provider.clone());
        let config = EngineConfig::default().with_simulated_failures(["sq2"]);

        let (state, _) = run_research(
            router,
            ScriptedModel::new().with(LlmTask::Synthesis, SYNTHESIS),
            config,
            vec![sub_question("sq1", 1), sub_question("sq2", 2)],
        )
        .await;

        assert_eq!(provider.call_count(), 1);
        assert_eq!(state.research_notes["sq1"].evidence.len(), 1);
        assert!(state.research_notes["sq2"].evidence.is_empty());
        let sq2_errors: Vec<_> = state
            .errors
            .iter()
            .filter(|e| e.sub_question_id.as_deref() == Some("sq2"))
            .collect();
        assert_eq!(sq2_errors.len(), 2);
        assert!(sq2_errors[0].detail.contains("Simulated"));
    }

    #[tokio::test]
    async fn test_synthesis_failure_uses_titles() {
        let router = SearchRouter::new(RouterConfig::default())
            .with_primary(Arc::new(StaticProvider::ok("exa", vec![result("https://a.com/1")])));

        let (state, _) = run_research(
            router,
            ScriptedModel::new().with(LlmTask::Synthesis, "not json"),
            EngineConfig::default(),
            vec![sub_question("sq1", 1)],
        )
        .await;

        let note = &state.research_notes["sq1"];
        assert_eq!(note.evidence_bullets[0], "Title https://a.com/1");
        assert_eq!(note.evidence_bullets.len(), MIN_BULLETS);
        assert_eq!(note.gaps, vec![FALLBACK_GAP]);
        assert_eq!(state.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_citations_follow_priority_not_completion() {
        struct ByQuery;

        #[async_trait]
        impl SearchProvider for ByQuery {
            fn name(&self) -> &str {
                "exa"
            }

            async fn search(&self, query: &str, _p: &SearchParams) -> Result<Vec<ProviderResult>, SearchError> {
                // sq1 finishes last
                if query.ends_with("sq1") {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Ok(vec![result(&format!("https://{}.com/", query.replace(' ', "-")))])
            }
        }

        let router = SearchRouter::new(RouterConfig::default()).with_primary(Arc::new(ByQuery));
        let (state, _) = run_research(
            router,
            ScriptedModel::new().with(LlmTask::Synthesis, SYNTHESIS),
            EngineConfig::default(),
            vec![sub_question("sq1", 1), sub_question("sq2", 2)],
        )
        .await;

        let urls: Vec<_> = state.citations.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(urls, vec!["https://query-sq1.com/", "https://query-sq2.com/"]);
    }

    #[tokio::test]
    async fn test_concurrency_bounded() {
        struct Gauge {
            current: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl SearchProvider for Gauge {
            fn name(&self) -> &str {
                "gauge"
            }

            async fn search(&self, query: &str, _p: &SearchParams) -> Result<Vec<ProviderResult>, SearchError> {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(vec![result(&format!("https://{}.com", query.replace(' ', "-")))])
            }
        }

        let gauge = Arc::new(Gauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let router = SearchRouter::new(RouterConfig::default().with_max_outbound_calls(6))
            .with_primary(gauge.clone());
        let sub_questions = (1..=6).map(|i| sub_question(&format!("sq{}", i), i)).collect();

        run_research(
            router,
            ScriptedModel::new().with(LlmTask::Synthesis, SYNTHESIS),
            EngineConfig::default().with_max_concurrency(2),
            sub_questions,
        )
        .await;

        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_deadline_keeps_finished_notes() {
        let fast = Arc::new(StaticProvider::ok("exa", vec![result("https://a.com/1")]));
        let router = SearchRouter::new(
            RouterConfig::default().with_provider_timeout(Duration::from_secs(30)),
        )
        .with_primary(fast);
        let config = EngineConfig::default()
            .with_max_concurrency(1)
            .with_research_timeout(Duration::from_millis(200));

        struct SlowSynthesis(ScriptedModel);

        #[async_trait]
        impl crate::llm::LanguageModel for SlowSynthesis {
            async fn complete(&self, request: &LlmRequest) -> Result<String, crate::error::LlmError> {
                // the first synthesis answers at once, later ones stall
                if !self.0.calls(LlmTask::Synthesis).is_empty() {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                self.0.complete(request).await
            }

            fn name(&self) -> &str {
                "slow"
            }
        }

        let llm = SlowSynthesis(ScriptedModel::new().with(LlmTask::Synthesis, SYNTHESIS));
        let (events, mut stream) = EventEmitter::channel("t1", 1024);
        let detector = NumericClaimDetector::default();
        let mut state = RunState::new("overall", "t1", PriorContext::default());
        state.plan.sub_questions = vec![sub_question("sq1", 1), sub_question("sq2", 2)];
        {
            let ctx = NodeContext {
                llm: &llm,
                router: &router,
                detector: &detector,
                config: &config,
                events: &events,
            };
            run(&ctx, &mut state).await;
        }
        drop(events);
        while stream.recv().await.is_some() {}

        assert!(state.metadata.research_timed_out);
        assert_eq!(state.research_notes["sq1"].evidence.len(), 1);
        assert!(state.research_notes["sq2"].evidence.is_empty());
        assert!(state.research_notes["sq2"].gaps[0].contains("timed out"));
        assert!(state
            .errors
            .iter()
            .any(|e| e.sub_question_id.as_deref() == Some("sq2") && e.detail.contains("deadline")));
    }

    #[tokio::test]
    async fn test_trusted_first_runs_phases_in_order() {
        struct DomainAware {
            domain_filters: std::sync::Mutex<Vec<usize>>,
        }

        #[async_trait]
        impl SearchProvider for DomainAware {
            fn name(&self) -> &str {
                "exa"
            }

            async fn search(&self, _query: &str, p: &SearchParams) -> Result<Vec<ProviderResult>, SearchError> {
                self.domain_filters.lock().unwrap().push(p.include_domains.len());
                let url = if p.include_domains.is_empty() {
                    "https://blog.example.com/b"
                } else {
                    "https://www.reuters.com/a"
                };
                Ok(vec![result(url)])
            }
        }

        let primary = Arc::new(DomainAware {
            domain_filters: std::sync::Mutex::new(Vec::new()),
        });
        let reference = Arc::new(StaticProvider::ok(
            "wikipedia",
            vec![ProviderResult::new(
                "wikipedia",
                "Overall",
                "https://en.wikipedia.org/wiki/Overall",
                "Reference text",
            )],
        ));
        let router = SearchRouter::new(RouterConfig::default())
            .with_primary(primary.clone())
            .with_reference(reference.clone());

        let (state, _) = run_research(
            router,
            ScriptedModel::new().with(LlmTask::Synthesis, SYNTHESIS),
            EngineConfig::default().with_source_policy(SourcePolicy::HybridTrustedFirst),
            vec![sub_question("sq1", 1)],
        )
        .await;

        assert_eq!(reference.call_count(), 1);
        let filters = primary.domain_filters.lock().unwrap().clone();
        assert_eq!(filters.len(), 2);
        assert!(filters[0] > 0, "trusted phase restricts domains");
        assert_eq!(filters[1], 0);

        let urls: HashSet<_> = state.research_notes["sq1"]
            .evidence
            .iter()
            .map(|e| e.url.clone())
            .collect();
        assert_eq!(urls.len(), 3);
        assert!(urls.contains("https://en.wikipedia.org/wiki/Overall"));
    }

    #[tokio::test]
    async fn test_source_budget_spans_sub_questions() {
        let provider = Arc::new(StaticProvider::ok(
            "exa",
            vec![result("https://a.com/1"), result("https://b.com/2")],
        ));
        let router = SearchRouter::new(RouterConfig::default().with_max_sources_per_run(2))
            .with_primary(provider.clone());

        let (state, _) = run_research(
            router,
            ScriptedModel::new().with(LlmTask::Synthesis, SYNTHESIS),
            EngineConfig::default().with_max_concurrency(1),
            vec![sub_question("sq1", 1), sub_question("sq2", 2)],
        )
        .await;

        let total: usize = state.research_notes.values().map(|n| n.evidence.len()).sum();
        assert_eq!(total, 2);
        assert_eq!(state.empty_sub_questions().len(), 1);
        // the second sub-question stops before searching
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_content_reported_and_fallback_used() {
        let primary = Arc::new(StaticProvider::ok(
            "exa",
            vec![ProviderResult::new("exa", "Blank page", "https://blank.com/", "   ")],
        ));
        let fallback = Arc::new(StaticProvider::ok(
            "tavily",
            vec![ProviderResult::new("tavily", "Real page", "https://real.com/", "Readable text")],
        ));
        let router = SearchRouter::new(RouterConfig::default())
            .with_primary(primary)
            .with_fallback(fallback.clone());

        let (state, events) = run_research(
            router,
            ScriptedModel::new().with(LlmTask::Synthesis, SYNTHESIS),
            EngineConfig::default(),
            vec![sub_question("sq1", 1)],
        )
        .await;

        assert_eq!(fallback.call_count(), 1);
        assert_eq!(state.metadata.fallback_searches, 1);
        let note = &state.research_notes["sq1"];
        assert_eq!(note.evidence.len(), 1);
        assert_eq!(note.evidence[0].url, "https://real.com/");
        assert!(events.iter().any(|e| matches!(
            &e.kind,
            EventKind::SourceFetch { status: FetchStatus::Failed, url, .. } if url == "https://blank.com/"
        )));
    }

    #[tokio::test]
    async fn test_call_cap_reported_once_and_reference_serves_rest() {
        let primary = Arc::new(StaticProvider::ok("exa", vec![result("https://a.com/1")]));
        let reference = Arc::new(StaticProvider::ok(
            "wikipedia",
            vec![ProviderResult::new(
                "wikipedia",
                "Entry",
                "https://en.wikipedia.org/wiki/Entry",
                "Reference text",
            )],
        ));
        let router = SearchRouter::new(RouterConfig::default().with_max_calls_per_run(1))
            .with_primary(primary.clone())
            .with_reference(reference.clone());

        let (state, _) = run_research(
            router,
            ScriptedModel::new().with(LlmTask::Synthesis, SYNTHESIS),
            EngineConfig::default().with_max_concurrency(1),
            vec![sub_question("sq1", 1), sub_question("sq2", 2), sub_question("sq3", 3)],
        )
        .await;

        assert_eq!(primary.call_count(), 1);
        assert_eq!(reference.call_count(), 2);
        assert!(state.empty_sub_questions().is_empty());
        let cap_errors = state
            .errors
            .iter()
            .filter(|e| e.detail.contains("call cap reached (1/1)"))
            .count();
        assert_eq!(cap_errors, 1);
    }
}
