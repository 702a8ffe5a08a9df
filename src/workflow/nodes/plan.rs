//! Plan node: query decomposition and the skip-research decision

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::NodeContext;
use crate::error::{LlmError, WorkflowError};
use crate::llm::{parse_json, LlmRequest, LlmTask};
use crate::workflow::events::EventKind;
use crate::workflow::prompts::{ResearchPrompts, SKIP_RESEARCH_MARKER};
use crate::workflow::state::{Plan, RunState, StageError, SubQuestion};

/// History entries shown to the planner
const PLANNER_HISTORY: usize = 4;

#[derive(Debug, Deserialize)]
struct PlanOutput {
    #[serde(default)]
    sub_questions: Vec<RawSubQuestion>,
    #[serde(default)]
    assumptions: Vec<String>,
    #[serde(default)]
    skip_research: bool,
}

#[derive(Debug, Deserialize)]
struct RawSubQuestion {
    #[serde(default)]
    question: String,
    #[serde(default)]
    priority: Option<u32>,
    #[serde(default)]
    search_queries: Vec<String>,
}

pub(crate) async fn run(ctx: &NodeContext<'_>, state: &mut RunState) -> Result<(), WorkflowError> {
    let history = &state.context.history;
    let recent = &history[history.len().saturating_sub(PLANNER_HISTORY)..];
    let request = LlmRequest::new(
        LlmTask::Plan,
        ResearchPrompts::planner_system(),
        ResearchPrompts::planner(
            &state.query,
            recent,
            &state.context.shared_memory,
            ctx.config.max_queries_per_sub_question,
        ),
    );

    let parsed = match ctx.llm.complete(&request).await {
        Ok(raw) if raw.trim().is_empty() => Err(LlmError::EmptyResponse),
        Ok(raw) => parse_json::<PlanOutput>(&raw, "plan"),
        Err(LlmError::EmptyResponse) => Err(LlmError::EmptyResponse),
        Err(err) => {
            warn!(error = %err, "Planner model call failed");
            return Err(WorkflowError::Planning(err));
        }
    };

    let has_prior_context = state.context.has_prior_context;
    let plan = match parsed {
        Ok(output) => {
            let plan = normalize(output, ctx, has_prior_context);
            if plan.sub_questions.is_empty() && !plan.skip_research {
                let error = StageError::new("plan", "Planner returned no sub-questions; using fallback plan");
                ctx.record_error(state, error).await;
                state.metadata.plan_fallback = true;
                fallback_plan(&state.query, ctx.config.max_queries_per_sub_question)
            } else {
                plan
            }
        }
        Err(err) => {
            warn!(error = %err, "Planner output unusable, using fallback plan");
            let error = StageError::new("plan", format!("Planner output unusable ({}); using fallback plan", err));
            ctx.record_error(state, error).await;
            state.metadata.plan_fallback = true;
            fallback_plan(&state.query, ctx.config.max_queries_per_sub_question)
        }
    };

    info!(
        sub_questions = plan.sub_questions.len(),
        skip_research = plan.skip_research,
        fallback = state.metadata.plan_fallback,
        "Plan ready"
    );

    ctx.events
        .emit(EventKind::Planning {
            sub_question_count: plan.sub_questions.len(),
            sub_questions: plan.sub_questions.clone(),
        })
        .await;
    state.plan = plan;
    Ok(())
}

fn normalize(output: PlanOutput, ctx: &NodeContext<'_>, has_prior_context: bool) -> Plan {
    let max_queries = ctx.config.max_queries_per_sub_question.max(1);

    let mut raw: Vec<RawSubQuestion> = output
        .sub_questions
        .into_iter()
        .filter(|sq| !sq.question.trim().is_empty())
        .collect();
    // stable, so unprioritized items keep model order after prioritized ones
    raw.sort_by_key(|sq| sq.priority.unwrap_or(u32::MAX));

    let sub_questions = raw
        .into_iter()
        .take(ctx.config.max_sub_questions.max(1))
        .enumerate()
        .map(|(idx, sq)| {
            let question = sq.question.trim().to_string();
            let mut queries: Vec<String> = Vec::new();
            for query in sq.search_queries {
                let query = query.trim().to_string();
                if !query.is_empty() && !queries.contains(&query) {
                    queries.push(query);
                }
            }
            if queries.is_empty() {
                queries.push(question.clone());
            }
            queries.truncate(max_queries);
            SubQuestion {
                id: format!("sq{}", idx + 1),
                question,
                priority: idx as u32 + 1,
                search_queries: queries,
            }
        })
        .collect();

    let assumptions: Vec<String> = output
        .assumptions
        .into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect();

    let requested = output.skip_research || assumptions.iter().any(|a| a == SKIP_RESEARCH_MARKER);
    if requested && !has_prior_context {
        debug!("Ignoring skip-research request on a thread without prior context");
    }

    Plan {
        sub_questions,
        assumptions,
        skip_research: requested && has_prior_context,
    }
}

/// Deterministic three-question plan used when the planner output is unusable.
pub fn fallback_plan(query: &str, max_queries: usize) -> Plan {
    let seeds = [
        (
            format!("What is the current landscape relevant to: {}?", query),
            [format!("{} overview", query), format!("{} latest data", query)],
        ),
        (
            format!("What are the main risks and downsides for: {}?", query),
            [format!("{} risks", query), format!("{} challenges evidence", query)],
        ),
        (
            format!("What opportunities and best practices exist for: {}?", query),
            [format!("{} opportunities", query), format!("{} best practices", query)],
        ),
    ];

    let sub_questions = seeds
        .into_iter()
        .enumerate()
        .map(|(idx, (question, queries))| SubQuestion {
            id: format!("sq{}", idx + 1),
            question,
            priority: idx as u32 + 1,
            search_queries: queries.into_iter().take(max_queries.max(1)).collect(),
        })
        .collect();

    Plan {
        sub_questions,
        assumptions: vec!["Fallback plan generated after a planner failure.".to_string()],
        skip_research: false,
    }
}
