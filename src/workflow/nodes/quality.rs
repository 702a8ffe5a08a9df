//! Quality node: deterministic checks combined with a model verdict

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use super::NodeContext;
use crate::llm::{complete_json, LlmRequest, LlmTask};
use crate::workflow::events::EventKind;
use crate::workflow::prompts::{ResearchPrompts, SECTION_HEADERS};
use crate::workflow::state::{FinalReport, QualityAssessment, RunState, StageError};

static ANCHOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[S\d+\]").expect("valid anchor regex"));

const MIN_REPORT_CHARS: usize = 900;
const MIN_SUMMARY_LINES: usize = 4;
const MIN_ANCHORS: usize = 3;
const MIN_CITATIONS: usize = 4;
const MIN_BALANCE_MARKERS: usize = 2;
const BALANCE_MARKERS: [&str; 4] = ["risk", "opportunit", "trade-off", "counter"];

const MAX_MODEL_FEEDBACK: usize = 5;
const MAX_ISSUES: usize = 8;
const MAX_FEEDBACK_ITEMS: usize = 4;

const DEFAULT_GUIDANCE: [&str; 4] = [
    "Improve balance: cover both upside and downside explicitly.",
    "Strengthen limitations and assumptions with concrete caveats.",
    "Add citation anchors [S#] to key claims.",
    "Tighten the executive summary to 5-8 specific lines.",
];

#[derive(Debug, Deserialize)]
struct Verdict {
    pass_check: bool,
    #[serde(default)]
    feedback: Vec<String>,
}

/// Rule-based score and the issues that lowered it.
pub fn deterministic_checks(report: &FinalReport, citation_count: usize) -> (u8, Vec<String>) {
    let mut score: i32 = 100;
    let mut issues = Vec::new();
    let text = &report.report;

    if text.trim().chars().count() < MIN_REPORT_CHARS {
        issues.push("Report body is too short; add more concrete findings.".to_string());
        score -= 18;
    }

    let missing: Vec<&str> = SECTION_HEADERS
        .iter()
        .copied()
        .filter(|h| !text.contains(h))
        .collect();
    if !missing.is_empty() {
        issues.push(format!("Missing required sections: {}.", missing.join(", ")));
        score -= 25;
    }

    let summary_lines = report
        .executive_summary
        .lines()
        .filter(|l| !l.trim().is_empty())
        .count();
    if summary_lines < MIN_SUMMARY_LINES {
        issues.push("Executive summary is too thin; target 5-8 concise lines.".to_string());
        score -= 12;
    }

    let lower = text.to_lowercase();
    if !lower.contains("limitations") && !lower.contains("assumption") {
        issues.push("Limitations and assumptions are not explicit.".to_string());
        score -= 15;
    }

    if ANCHOR_RE.find_iter(text).count() < MIN_ANCHORS && citation_count < MIN_CITATIONS {
        issues.push("Citation grounding is weak; include inline anchors like [S1].".to_string());
        score -= 18;
    }

    let balance = BALANCE_MARKERS.iter().filter(|m| lower.contains(*m)).count();
    if balance < MIN_BALANCE_MARKERS {
        issues.push("Analysis appears one-sided; include a balanced perspective.".to_string());
        score -= 12;
    }

    (score.clamp(0, 100) as u8, issues)
}

/// Combine the deterministic result with the model verdict.
pub fn assess(
    base_score: u8,
    deterministic: Vec<String>,
    model_pass: bool,
    model_feedback: Vec<String>,
    threshold: u8,
) -> QualityAssessment {
    let passed = base_score >= threshold && model_pass && deterministic.len() <= 1;
    if passed {
        return QualityAssessment {
            score: base_score.max(threshold),
            passed: true,
            issues: Vec::new(),
            feedback: None,
        };
    }

    let mut issues: Vec<String> = Vec::new();
    for issue in deterministic.into_iter().chain(model_feedback.into_iter().take(MAX_MODEL_FEEDBACK)) {
        let issue = issue.trim().to_string();
        if !issue.is_empty() && !issues.contains(&issue) {
            issues.push(issue);
        }
    }
    issues.truncate(MAX_ISSUES);

    let guidance: Vec<&str> = if issues.is_empty() {
        DEFAULT_GUIDANCE.to_vec()
    } else {
        issues.iter().take(MAX_FEEDBACK_ITEMS).map(String::as_str).collect()
    };
    let feedback = guidance
        .iter()
        .map(|g| format!("- {}", g))
        .collect::<Vec<_>>()
        .join("\n");

    QualityAssessment {
        score: base_score.min(threshold.saturating_sub(1)),
        passed: false,
        issues,
        feedback: Some(feedback),
    }
}

pub(crate) async fn run(ctx: &NodeContext<'_>, state: &mut RunState) {
    let report = state.report.clone().unwrap_or_default();
    let (base_score, deterministic) = deterministic_checks(&report, state.citations.len());

    let request = LlmRequest::new(
        LlmTask::Quality,
        ResearchPrompts::quality_system(),
        ResearchPrompts::quality(&state.query, &report.executive_summary, &report.report),
    );
    let (model_pass, model_feedback) = match complete_json::<Verdict>(ctx.llm, &request, "quality verdict").await {
        Ok(verdict) => (verdict.pass_check, verdict.feedback),
        Err(err) => {
            warn!(error = %err, "Quality verdict unavailable, applying deterministic checks only");
            let detail = format!("Quality review failed ({}); deterministic checks only", err);
            ctx.record_error(state, StageError::new("quality", detail)).await;
            (true, Vec::new())
        }
    };

    let assessment = assess(
        base_score,
        deterministic,
        model_pass,
        model_feedback,
        ctx.config.quality_pass_score,
    );
    info!(
        score = assessment.score,
        passed = assessment.passed,
        base_score,
        model_pass,
        rewrite_count = state.rewrite_count,
        "Quality assessed"
    );

    ctx.events
        .emit(EventKind::Quality {
            score: assessment.score,
            passed: assessment.passed,
            issues: assessment.issues.clone(),
        })
        .await;
    state.quality = Some(assessment);
}
