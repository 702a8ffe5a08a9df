//! Write node: streamed report plus structured summary
//!
//! Report text reaches the client as ordered `message` chunks whose
//! concatenation is the final report. When the model stream yields nothing
//! a template report is built from the evidence and streamed the same way.

use futures::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};

use super::NodeContext;
use crate::llm::{chunk_text, complete_json, LlmRequest, LlmTask, STREAM_CHUNK_CHARS};
use crate::search::url::truncate_chars;
use crate::workflow::events::EventKind;
use crate::workflow::prompts::{ResearchPrompts, SECTION_HEADERS};
use crate::workflow::state::{FinalReport, RunState, StageError};

const PACKET_BULLETS: usize = 5;
const PACKET_SOURCES: usize = 3;
const PACKET_SNIPPET_CHARS: usize = 220;
const PACKET_NOTES: usize = 3;

#[derive(Debug, Default, Deserialize)]
struct SummaryOutput {
    #[serde(default)]
    executive_summary: String,
    #[serde(default)]
    key_takeaways: Vec<String>,
    #[serde(default)]
    limitations: String,
}

pub(crate) async fn run(ctx: &NodeContext<'_>, state: &mut RunState) {
    let iteration = state.rewrite_count;
    state.write_passes += 1;
    // describes the latest pass only
    state.metadata.writer_fallback = false;
    ctx.events
        .emit(EventKind::Writing {
            rewrite_iteration: iteration,
        })
        .await;

    let feedback = if iteration > 0 {
        state.quality.as_ref().and_then(|q| q.feedback.clone())
    } else {
        None
    };
    let request = LlmRequest::new(
        LlmTask::Report,
        ResearchPrompts::report_system(),
        ResearchPrompts::report(
            &state.query,
            &evidence_packet(state),
            &anchor_block(state, ctx.router.config().max_sources_per_run),
            &state.context.shared_memory.render_reports(),
            feedback.as_deref(),
        ),
    );

    let (text, stream_error) = stream_report(ctx, &request).await;

    let summary = if text.trim().is_empty() {
        let detail = match stream_error {
            Some(err) => format!("Report generation failed ({}); template report used", err),
            None => "Report generation returned no text; template report used".to_string(),
        };
        warn!(iteration, "{}", detail);
        ctx.record_error(state, StageError::new("write", detail)).await;
        state.metadata.writer_fallback = true;

        let report = template_report(state);
        for chunk in chunk_text(&report, STREAM_CHUNK_CHARS) {
            ctx.events.emit(EventKind::Message { chunk }).await;
        }
        template_summary(report)
    } else {
        if let Some(err) = stream_error {
            let detail = format!("Report stream interrupted ({}); partial report kept", err);
            ctx.record_error(state, StageError::new("write", detail)).await;
        }
        summarize(ctx, state, text).await
    };

    let limitations = with_limitation_notes(summary.limitations, &limitation_notes(state));
    info!(
        iteration,
        chars = summary.report.len(),
        fallback = state.metadata.writer_fallback,
        "Report written"
    );
    state.report = Some(FinalReport {
        limitations,
        ..summary
    });
}

/// Drain the model stream into message events. Returns the text received
/// and the error that ended the stream early, if any.
async fn stream_report(ctx: &NodeContext<'_>, request: &LlmRequest) -> (String, Option<String>) {
    let mut stream = match ctx.llm.stream(request).await {
        Ok(stream) => stream,
        Err(err) => return (String::new(), Some(err.to_string())),
    };

    let mut text = String::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) if chunk.is_empty() => {}
            Ok(chunk) => {
                text.push_str(&chunk);
                ctx.events.emit(EventKind::Message { chunk }).await;
            }
            Err(err) => return (text, Some(err.to_string())),
        }
    }
    (text, None)
}

async fn summarize(ctx: &NodeContext<'_>, state: &mut RunState, report: String) -> FinalReport {
    let request = LlmRequest::new(
        LlmTask::Summary,
        ResearchPrompts::summary_system(),
        ResearchPrompts::summary(&state.query, &report),
    );

    match complete_json::<SummaryOutput>(ctx.llm, &request, "summary").await {
        Ok(output) if !output.executive_summary.trim().is_empty() => FinalReport {
            executive_summary: output.executive_summary.trim().to_string(),
            report,
            key_takeaways: output
                .key_takeaways
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            limitations: output.limitations.trim().to_string(),
        },
        result => {
            let detail = match result {
                Err(err) => format!("Summary generation failed ({}); default summary used", err),
                Ok(_) => "Summary generation returned no executive summary; default summary used".to_string(),
            };
            warn!("{}", detail);
            ctx.record_error(state, StageError::new("write", detail)).await;
            state.metadata.summary_fallback = true;
            FinalReport {
                executive_summary: "Executive summary unavailable due to summarization failure.".to_string(),
                report,
                key_takeaways: vec![
                    "Review the findings and action items by section.".to_string(),
                    "Validate high-impact assumptions with primary sources.".to_string(),
                ],
                limitations: "Summarization failed; use the report body and citations as primary evidence."
                    .to_string(),
            }
        }
    }
}

/// Sentences the limitations must always carry for this run.
fn limitation_notes(state: &RunState) -> Vec<String> {
    let mut notes: Vec<String> = state
        .empty_sub_questions()
        .iter()
        .map(|sq| format!("No evidence was found for {} ({}).", sq.id, sq.question))
        .collect();
    if state.plan.skip_research {
        notes.push("Web research was skipped; this answer relies on prior thread context.".to_string());
    }
    if state.metadata.research_timed_out {
        notes.push("Research was cut short by the stage deadline.".to_string());
    }
    notes
}

fn with_limitation_notes(limitations: String, notes: &[String]) -> String {
    let mut out = limitations.trim().to_string();
    for note in notes {
        if out.contains(note.as_str()) {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(note);
    }
    out
}

/// Compressed per-sub-question evidence for the report prompt.
fn evidence_packet(state: &RunState) -> String {
    let mut blocks = Vec::new();
    for (sq, note) in state.notes_in_order() {
        let mut lines = vec![format!("{} {}", sq.id.to_uppercase(), sq.question)];
        match note {
            Some(note) if !note.evidence.is_empty() => {
                for bullet in note.evidence_bullets.iter().take(PACKET_BULLETS) {
                    lines.push(format!("- {}", bullet));
                }
                for item in note.evidence.iter().take(PACKET_SOURCES) {
                    let anchor = state.anchor_for(&item.url).unwrap_or_default();
                    lines.push(format!(
                        "- [{}] {} ({}): {}",
                        anchor,
                        item.title,
                        item.source_name,
                        truncate_chars(&item.extracted_text, PACKET_SNIPPET_CHARS)
                    ));
                }
                for contradiction in note.contradictions.iter().take(PACKET_NOTES) {
                    lines.push(format!("- contradiction: {}", contradiction));
                }
                for gap in note.gaps.iter().take(PACKET_NOTES) {
                    lines.push(format!("- gap: {}", gap));
                }
            }
            _ => lines.push("- no evidence gathered".to_string()),
        }
        blocks.push(lines.join("\n"));
    }
    blocks.join("\n\n")
}

/// `[S#]` anchors for the first `limit` citations
fn anchor_block(state: &RunState, limit: usize) -> String {
    state
        .citations
        .iter()
        .take(limit)
        .enumerate()
        .map(|(idx, c)| format!("[S{}] {} - {} ({})", idx + 1, c.source_name, c.title, c.url))
        .collect::<Vec<_>>()
        .join("\n")
}

fn section(lines: &mut Vec<String>, header: &str) {
    if !lines.is_empty() {
        lines.push(String::new());
    }
    lines.push(header.to_string());
    lines.push("-".repeat(header.len()));
}

/// Plain report assembled from evidence titles, used when the model
/// produced no report text.
pub(crate) fn template_report(state: &RunState) -> String {
    let [context, findings, contradictions, takeaways, limitations] = SECTION_HEADERS;
    let mut lines: Vec<String> = Vec::new();

    section(&mut lines, context);
    lines.push(format!("Research completed with partial synthesis for query: {}", state.query));

    section(&mut lines, findings);
    for (sq, note) in state.notes_in_order() {
        lines.push(format!("{} {}", sq.id.to_uppercase(), sq.question));
        let evidence = note.map(|n| n.evidence.as_slice()).unwrap_or_default();
        if evidence.is_empty() {
            lines.push("- No evidence gathered.".to_string());
        }
        for item in evidence.iter().take(PACKET_NOTES) {
            let anchor = state.anchor_for(&item.url).unwrap_or_default();
            lines.push(format!("- {} [{}]", item.title, anchor));
        }
    }

    section(&mut lines, contradictions);
    for (sq, note) in state.notes_in_order() {
        let Some(note) = note else { continue };
        if !note.contradictions.is_empty() {
            lines.push(format!("{} contradictions: {}", sq.id.to_uppercase(), note.contradictions.join("; ")));
        }
        if !note.gaps.is_empty() {
            lines.push(format!("{} gaps: {}", sq.id.to_uppercase(), note.gaps.join("; ")));
        }
    }

    section(&mut lines, takeaways);
    lines.push("- Prioritize decisions with the strongest cross-source support.".to_string());
    lines.push("- Validate high-impact assumptions with primary institutional sources.".to_string());

    section(&mut lines, limitations);
    lines.push("- The report writer failed, so this is a template built from raw evidence.".to_string());
    lines.push("- Some sub-questions may need additional source coverage.".to_string());

    if !state.citations.is_empty() {
        section(&mut lines, "Source Anchors");
        for (idx, c) in state.citations.iter().enumerate() {
            lines.push(format!("[S{}] {} - {}", idx + 1, c.source_name, c.title));
        }
    }
    lines.join("\n")
}

fn template_summary(report: String) -> FinalReport {
    FinalReport {
        executive_summary: "Partial synthesis generated by the template formatter after a writer failure."
            .to_string(),
        report,
        key_takeaways: vec![
            "Evidence has been condensed into the standard sections.".to_string(),
            "Use the source anchors [S#] for quick citation checks.".to_string(),
            "Review limitations before making definitive recommendations.".to_string(),
        ],
        limitations: "A template report was used; the narrative should be reviewed for depth and completeness."
            .to_string(),
    }
}
