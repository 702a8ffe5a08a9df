//! Run state for one workflow execution

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::{HistoryEntry, SharedMemory, ThreadMemory};
use crate::search::{normalize_url, Citation, EvidenceItem};

/// A decomposed, independently researchable part of the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubQuestion {
    pub id: String,
    pub question: String,
    pub priority: u32,
    pub search_queries: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub sub_questions: Vec<SubQuestion>,
    pub assumptions: Vec<String>,
    pub skip_research: bool,
}

/// Evidence and synthesis for one sub-question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchNote {
    pub sub_question_id: String,
    pub evidence: Vec<EvidenceItem>,
    pub evidence_bullets: Vec<String>,
    pub contradictions: Vec<String>,
    pub gaps: Vec<String>,
}

impl ResearchNote {
    pub fn empty(sub_question_id: impl Into<String>) -> Self {
        Self {
            sub_question_id: sub_question_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalReport {
    pub executive_summary: String,
    pub report: String,
    pub key_takeaways: Vec<String>,
    pub limitations: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityAssessment {
    /// 0..=100
    pub score: u8,
    pub passed: bool,
    pub issues: Vec<String>,
    /// Guidance for the rewrite pass; only set on failure
    pub feedback: Option<String>,
}

impl QualityAssessment {
    pub fn needs_rewrite(&self) -> bool {
        !self.passed
    }
}

/// A recoverable failure recorded during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_question_id: Option<String>,
}

impl StageError {
    pub fn new(stage: &str, detail: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            detail: detail.into(),
            sub_question_id: None,
        }
    }

    pub fn for_sub_question(stage: &str, sub_question_id: &str, detail: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            detail: detail.into(),
            sub_question_id: Some(sub_question_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub thread_id: String,
    pub started_at: DateTime<Utc>,
    /// Node name to accumulated duration
    pub timings_ms: BTreeMap<String, u64>,
    pub plan_fallback: bool,
    pub writer_fallback: bool,
    pub summary_fallback: bool,
    /// Router calls that went to the fallback provider
    pub fallback_searches: usize,
    pub research_timed_out: bool,
}

/// Context taken from thread memory at run start. Read-only during the run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorContext {
    pub history: Vec<HistoryEntry>,
    pub shared_memory: SharedMemory,
    pub has_prior_context: bool,
}

impl From<&ThreadMemory> for PriorContext {
    fn from(memory: &ThreadMemory) -> Self {
        Self {
            history: memory.history.iter().cloned().collect(),
            shared_memory: memory.shared_memory.clone(),
            has_prior_context: memory.has_prior_context(),
        }
    }
}

/// Mutable record of one run, owned by that run alone.
#[derive(Debug, Clone)]
pub struct RunState {
    pub query: String,
    pub context: PriorContext,
    pub plan: Plan,
    pub research_notes: BTreeMap<String, ResearchNote>,
    pub citations: Vec<Citation>,
    pub report: Option<FinalReport>,
    pub quality: Option<QualityAssessment>,
    pub errors: Vec<StageError>,
    pub rewrite_count: u8,
    pub write_passes: u8,
    pub research_ran: bool,
    pub metadata: RunMetadata,
}

impl RunState {
    pub fn new(query: impl Into<String>, thread_id: impl Into<String>, context: PriorContext) -> Self {
        Self {
            query: query.into(),
            context,
            plan: Plan::default(),
            research_notes: BTreeMap::new(),
            citations: Vec::new(),
            report: None,
            quality: None,
            errors: Vec::new(),
            rewrite_count: 0,
            write_passes: 0,
            research_ran: false,
            metadata: RunMetadata {
                thread_id: thread_id.into(),
                started_at: Utc::now(),
                timings_ms: BTreeMap::new(),
                plan_fallback: false,
                writer_fallback: false,
                summary_fallback: false,
                fallback_searches: 0,
                research_timed_out: false,
            },
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.metadata.thread_id
    }

    pub fn record_error(&mut self, error: StageError) {
        self.errors.push(error);
    }

    pub fn add_timing(&mut self, node: &str, duration_ms: u64) {
        *self.metadata.timings_ms.entry(node.to_string()).or_insert(0) += duration_ms;
    }

    /// Notes in plan priority order.
    pub fn notes_in_order(&self) -> Vec<(&SubQuestion, Option<&ResearchNote>)> {
        self.plan
            .sub_questions
            .iter()
            .map(|sq| (sq, self.research_notes.get(&sq.id)))
            .collect()
    }

    /// Sub-questions that were researched but have no evidence.
    pub fn empty_sub_questions(&self) -> Vec<&SubQuestion> {
        if !self.research_ran {
            return Vec::new();
        }
        self.notes_in_order()
            .into_iter()
            .filter(|(_, note)| note.map_or(true, |n| n.evidence.is_empty()))
            .map(|(sq, _)| sq)
            .collect()
    }

    /// Rebuild citations from notes: sub-question priority order, then
    /// evidence order, deduplicated by normalized URL.
    pub fn rebuild_citations(&mut self) {
        let mut seen: HashSet<String> = HashSet::new();
        let mut citations = Vec::new();
        for (_, note) in self.notes_in_order() {
            let Some(note) = note else { continue };
            for item in &note.evidence {
                let key = normalize_url(&item.url).unwrap_or_else(|| item.url.clone());
                if seen.insert(key) {
                    citations.push(Citation::from(item));
                }
            }
        }
        self.citations = citations;
    }

    /// Anchor label (`S1`, `S2`, ...) of a URL in the final citation order.
    pub fn anchor_for(&self, url: &str) -> Option<String> {
        let key = normalize_url(url)?;
        self.citations
            .iter()
            .position(|c| normalize_url(&c.url).as_deref() == Some(key.as_str()))
            .map(|i| format!("S{}", i + 1))
    }

    /// Gaps across all notes, deduplicated, in plan order.
    pub fn all_gaps(&self) -> Vec<String> {
        let mut gaps: Vec<String> = Vec::new();
        for (_, note) in self.notes_in_order() {
            for gap in note.map(|n| n.gaps.as_slice()).unwrap_or_default() {
                if !gaps.contains(gap) {
                    gaps.push(gap.clone());
                }
            }
        }
        gaps
    }
}
