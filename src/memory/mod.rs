//! Thread memory
//!
//! Per-thread conversation history and compact snapshots of completed
//! reports, plus the [`SharedMemory`] digest derived from them. The digest
//! is never edited directly; [`ThreadMemory::apply`] recomputes it after
//! every save.

mod shared;
mod store;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::search::Citation;

pub use shared::{MessageDigest, ReportDigest, SharedMemory};
pub use store::{InMemoryBackend, MemoryBackend, MemoryConfig, ThreadCheckout, ThreadMemoryStore};

/// Citations kept per report snapshot
pub const MAX_MEMORY_CITATIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Compact snapshot of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMemory {
    pub query: String,
    pub executive_summary: String,
    pub key_takeaways: Vec<String>,
    pub limitations: String,
    /// Unresolved gaps carried into follow-up runs
    pub gaps: Vec<String>,
    pub citations: Vec<Citation>,
    pub completed_at: DateTime<Utc>,
}

/// What a finished run folds back into its thread.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub messages: Vec<HistoryEntry>,
    pub report: Option<ReportMemory>,
}

impl RunSummary {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.report.is_none()
    }
}

/// Everything remembered about one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMemory {
    pub thread_id: String,
    pub history: VecDeque<HistoryEntry>,
    pub report_memories: VecDeque<ReportMemory>,
    pub shared_memory: SharedMemory,
    /// Completed runs folded into this thread
    pub run_count: u64,
}

impl ThreadMemory {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            history: VecDeque::new(),
            report_memories: VecDeque::new(),
            shared_memory: SharedMemory::default(),
            run_count: 0,
        }
    }

    /// True once the thread has anything a follow-up could build on.
    pub fn has_prior_context(&self) -> bool {
        !self.history.is_empty() || !self.report_memories.is_empty()
    }

    /// Append a run summary, evict beyond the windows, recompute the digest.
    pub fn apply(&mut self, summary: RunSummary, config: &MemoryConfig, now: DateTime<Utc>) {
        let counted = !summary.is_empty();

        self.history.extend(summary.messages);
        while self.history.len() > config.history_window {
            self.history.pop_front();
        }

        if let Some(mut report) = summary.report {
            report.citations.truncate(MAX_MEMORY_CITATIONS);
            self.report_memories.push_back(report);
        }
        while self.report_memories.len() > config.report_window {
            self.report_memories.pop_front();
        }

        if counted {
            self.run_count += 1;
        }
        self.shared_memory = SharedMemory::project(&self.history, &self.report_memories, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(query: &str) -> ReportMemory {
        ReportMemory {
            query: query.to_string(),
            executive_summary: format!("Summary of {}", query),
            key_takeaways: vec![format!("Takeaway for {}", query)],
            limitations: String::new(),
            gaps: Vec::new(),
            citations: (0..12)
                .map(|i| Citation {
                    title: format!("Source {}", i),
                    url: format!("https://example.com/{}", i),
                    source_name: "example.com".to_string(),
                })
                .collect(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_apply_evicts_oldest_first() {
        let config = MemoryConfig::new().with_history_window(3).with_report_window(2);
        let mut memory = ThreadMemory::new("t1");

        for i in 0..3 {
            memory.apply(
                RunSummary {
                    messages: vec![
                        HistoryEntry::user(format!("q{}", i)),
                        HistoryEntry::assistant(format!("a{}", i)),
                    ],
                    report: Some(report(&format!("q{}", i))),
                },
                &config,
                Utc::now(),
            );
        }

        let contents: Vec<_> = memory.history.iter().map(|h| h.content.as_str()).collect();
        assert_eq!(contents, vec!["a1", "q2", "a2"]);
        let queries: Vec<_> = memory.report_memories.iter().map(|r| r.query.as_str()).collect();
        assert_eq!(queries, vec!["q1", "q2"]);
        assert_eq!(memory.run_count, 3);
        assert!(memory
            .report_memories
            .iter()
            .all(|r| r.citations.len() == MAX_MEMORY_CITATIONS));
    }

    #[test]
    fn test_empty_summary_only_touches_timestamp() {
        let config = MemoryConfig::default();
        let mut memory = ThreadMemory::new("t1");
        memory.apply(
            RunSummary {
                messages: vec![HistoryEntry::user("hello")],
                report: Some(report("hello")),
            },
            &config,
            Utc::now(),
        );
        let before = memory.clone();

        memory.apply(RunSummary::empty(), &config, Utc::now() + chrono::Duration::seconds(5));

        assert_eq!(memory.history, before.history);
        assert_eq!(memory.report_memories, before.report_memories);
        assert_eq!(memory.run_count, before.run_count);
        assert_ne!(memory.shared_memory.updated_at, before.shared_memory.updated_at);
        assert!(memory.shared_memory.same_content(&before.shared_memory));
    }

    #[test]
    fn test_prior_context() {
        let mut memory = ThreadMemory::new("t1");
        assert!(!memory.has_prior_context());
        memory.history.push_back(HistoryEntry::user("hi"));
        assert!(memory.has_prior_context());
    }
}
