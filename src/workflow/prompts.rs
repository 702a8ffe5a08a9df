//! Prompt templates for the workflow nodes
//!
//! - Planner: decomposes the query into prioritized sub-questions
//! - Synthesizer: condenses one sub-question's evidence
//! - Writer: streams the plain-text report, then summarizes it
//! - Quality reviewer: pass/fail verdict on the finished report

use chrono::Utc;

use crate::memory::{HistoryEntry, Role, SharedMemory};
use crate::search::url::truncate_chars;
use crate::search::EvidenceItem;

/// Planner assumption that marks a query answerable from thread context
pub const SKIP_RESEARCH_MARKER: &str = "SKIP_WEB_RESEARCH";

/// Section headers every report must contain, in order
pub const SECTION_HEADERS: [&str; 5] = [
    "Context",
    "Findings by Sub-Question",
    "Contradictions and Gaps",
    "Actionable Takeaways",
    "Limitations and Assumptions",
];

/// Report characters shown to the summary and quality prompts
const REPORT_EXCERPT_CHARS: usize = 7000;
const SNIPPET_CHARS: usize = 320;

/// Prompt templates for the research workflow
pub struct ResearchPrompts;

impl ResearchPrompts {
    /// Get the current date formatted for prompts
    fn current_date() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    pub fn planner_system() -> String {
        format!(
            "You are a research planning agent. Today's date is {}. \
             Return ONLY valid JSON matching the requested schema. \
             Generate a practical plan with 3-6 sub-questions, each with 1-2 focused web queries.",
            Self::current_date()
        )
    }

    pub fn planner(query: &str, history: &[HistoryEntry], shared: &SharedMemory, max_queries: usize) -> String {
        let history = Self::history_block(history);
        let memory = shared.render();
        format!(
            r#"User query:
{query}

Recent thread history:
{history}

Shared memory summary:
{memory}

Requirements:
- Output keys: sub_questions, assumptions, skip_research.
- sub_questions: 3 to 6 items (target 4).
- Each sub_question has: id, question, priority, search_queries.
- id format: sq1, sq2, ...
- priority is a unique integer (1 = highest).
- search_queries: 1 to {max_queries} short focused web queries.
- If the query is ambiguous, add explicit assumptions.
- If the query can be answered directly from the thread history or shared memory
  without a web lookup, set skip_research to true and include the assumption {marker}."#,
            query = query,
            history = or_none(&history),
            memory = or_none(&memory),
            max_queries = max_queries,
            marker = SKIP_RESEARCH_MARKER,
        )
    }

    pub fn synthesis_system() -> &'static str {
        "You are a research synthesis agent. Return ONLY JSON. \
         Use the provided findings to produce concise evidence bullets, contradictions, and gaps."
    }

    pub fn synthesis(question: &str, evidence: &[EvidenceItem]) -> String {
        let findings = evidence
            .iter()
            .map(|e| {
                format!(
                    "- title: {}\n  url: {}\n  snippet: {}",
                    e.title,
                    e.url,
                    truncate_chars(&e.extracted_text, SNIPPET_CHARS)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            r#"Sub-question:
{question}

Findings:
{findings}

Return JSON keys:
- evidence_bullets (4-8)
- contradictions (0-4)
- gaps (1-5)"#,
            question = question,
            findings = or_none(&findings),
        )
    }

    pub fn report_system() -> &'static str {
        "You are a research report writer. Produce a concise, well-structured plain-text report. \
         Follow the exact section headers provided."
    }

    /// Report prompt. `evidence_packet` and `anchors` are pre-rendered
    /// blocks; `feedback` is set on the rewrite pass.
    pub fn report(
        query: &str,
        evidence_packet: &str,
        anchors: &str,
        prior_reports: &str,
        feedback: Option<&str>,
    ) -> String {
        let headers = SECTION_HEADERS
            .iter()
            .map(|h| format!("  {}\n  {}", h, "-".repeat(h.len())))
            .collect::<Vec<_>>()
            .join("\n");
        let mut prompt = format!(
            r#"Query:
{query}

Evidence packet:
{evidence}

Citation anchors:
{anchors}

Prior reports in this thread:
{prior}

Output requirements:
- Plain text only
- Max 850 words total
- Short paragraphs; prefer bullets where possible
- Use EXACT section headers and separators:
{headers}
- Within findings, max 3 bullets per sub-question
- Use citation anchors like [S1], [S2] inline
- Cover both risks and opportunities, and state trade-offs explicitly"#,
            query = query,
            evidence = or_none(evidence_packet),
            anchors = or_none(anchors),
            prior = or_none(prior_reports),
            headers = headers,
        );
        if let Some(feedback) = feedback {
            prompt.push_str(&format!(
                "\n\nA reviewer rejected the previous draft. Address every point:\n{}",
                feedback
            ));
        }
        prompt
    }

    pub fn summary_system() -> &'static str {
        "You are a report generation agent. Return ONLY JSON with keys: \
         executive_summary, key_takeaways, limitations."
    }

    pub fn summary(query: &str, report: &str) -> String {
        format!(
            r#"Query:
{query}

Report body:
{report}

Output requirements:
- executive_summary: 5-8 concise lines
- key_takeaways: 4-8 actionable bullets
- limitations: include ambiguity, gaps and any failures"#,
            query = query,
            report = truncate_chars(report, REPORT_EXCERPT_CHARS),
        )
    }

    pub fn quality_system() -> &'static str {
        "You are a strict quality checker for research reports. \
         Fail reports that lack balanced perspective, explicit limitations, or citation grounding."
    }

    pub fn quality(query: &str, executive_summary: &str, report: &str) -> String {
        format!(
            r#"Query:
{query}

Executive Summary:
{summary}

Report:
{report}

Return JSON:
- pass_check: boolean
- feedback: concise list of issues to fix (max 5)"#,
            query = query,
            summary = executive_summary,
            report = truncate_chars(report, REPORT_EXCERPT_CHARS),
        )
    }

    fn history_block(history: &[HistoryEntry]) -> String {
        history
            .iter()
            .map(|h| {
                let role = match h.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                let content = h.content.split_whitespace().collect::<Vec<_>>().join(" ");
                format!("- {}: {}", role, truncate_chars(&content, 220))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn or_none(block: &str) -> &str {
    if block.trim().is_empty() {
        "- (none)"
    } else {
        block
    }
}
