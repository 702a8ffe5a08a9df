//! Shared-memory projection

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{HistoryEntry, ReportMemory, Role};
use crate::search::url::truncate_chars;

const USER_MESSAGES: usize = 2;
const ASSISTANT_MESSAGES: usize = 1;
const MESSAGE_CHARS: usize = 220;

const RECENT_REPORTS: usize = 3;
const QUERY_CHARS: usize = 140;
const SUMMARY_CHARS: usize = 220;
const TAKEAWAY_CHARS: usize = 120;

const OPEN_GAPS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDigest {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDigest {
    pub query: String,
    pub summary: String,
    pub takeaway: Option<String>,
}

/// Bounded digest of a thread used as planning and writing context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedMemory {
    /// Chronological, at most two user turns and one assistant turn
    pub recent_messages: Vec<MessageDigest>,
    /// Oldest first
    pub recent_reports: Vec<ReportDigest>,
    pub open_gaps: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SharedMemory {
    /// Deterministic projection of history and report snapshots.
    pub fn project(
        history: &VecDeque<HistoryEntry>,
        reports: &VecDeque<ReportMemory>,
        now: DateTime<Utc>,
    ) -> Self {
        // walk newest first, then restore chronological order
        let mut users = 0;
        let mut assistants = 0;
        let mut picked: Vec<MessageDigest> = Vec::new();
        for entry in history.iter().rev() {
            let take = match entry.role {
                Role::User if users < USER_MESSAGES => {
                    users += 1;
                    true
                }
                Role::Assistant if assistants < ASSISTANT_MESSAGES => {
                    assistants += 1;
                    true
                }
                _ => false,
            };
            if take {
                picked.push(MessageDigest {
                    role: entry.role,
                    content: clip(&entry.content, MESSAGE_CHARS),
                });
            }
        }
        picked.reverse();

        let skip = reports.len().saturating_sub(RECENT_REPORTS);
        let recent_reports = reports
            .iter()
            .skip(skip)
            .map(|r| ReportDigest {
                query: clip(&r.query, QUERY_CHARS),
                summary: clip(&r.executive_summary, SUMMARY_CHARS),
                takeaway: r
                    .key_takeaways
                    .first()
                    .map(|t| clip(t, TAKEAWAY_CHARS))
                    .filter(|t| !t.is_empty()),
            })
            .collect();

        let mut open_gaps: Vec<String> = Vec::new();
        for report in reports.iter().rev().take(RECENT_REPORTS) {
            for gap in &report.gaps {
                let gap = clip(gap, SUMMARY_CHARS);
                if !gap.is_empty() && !open_gaps.contains(&gap) {
                    open_gaps.push(gap);
                }
            }
        }
        open_gaps.truncate(OPEN_GAPS);

        Self {
            recent_messages: picked,
            recent_reports,
            open_gaps,
            updated_at: Some(now),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.recent_messages.is_empty() && self.recent_reports.is_empty() && self.open_gaps.is_empty()
    }

    /// Equal in everything but `updated_at`.
    pub fn same_content(&self, other: &SharedMemory) -> bool {
        self.recent_messages == other.recent_messages
            && self.recent_reports == other.recent_reports
            && self.open_gaps == other.open_gaps
    }

    /// Prior report lines (`R1 query: ...`) for prompts.
    pub fn render_reports(&self) -> String {
        let mut lines = Vec::new();
        for (idx, report) in self.recent_reports.iter().enumerate() {
            let n = idx + 1;
            if !report.query.is_empty() {
                lines.push(format!("R{} query: {}", n, report.query));
            }
            if !report.summary.is_empty() {
                lines.push(format!("R{} summary: {}", n, report.summary));
            }
            if let Some(takeaway) = &report.takeaway {
                lines.push(format!("R{} takeaway: {}", n, takeaway));
            }
        }
        lines.join("\n")
    }

    /// Full digest as prompt context. Empty when there is nothing to say.
    pub fn render(&self) -> String {
        let mut sections = Vec::new();
        if !self.recent_messages.is_empty() {
            let messages = self
                .recent_messages
                .iter()
                .map(|m| {
                    let role = match m.role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    };
                    format!("- {}: {}", role, m.content)
                })
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("Recent messages:\n{}", messages));
        }
        let reports = self.render_reports();
        if !reports.is_empty() {
            sections.push(format!("Prior reports:\n{}", reports));
        }
        if !self.open_gaps.is_empty() {
            let gaps = self
                .open_gaps
                .iter()
                .map(|g| format!("- {}", g))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("Open gaps:\n{}", gaps));
        }
        sections.join("\n\n")
    }
}

/// Collapse whitespace and cut to `max` characters.
fn clip(text: &str, max: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, max)
}
