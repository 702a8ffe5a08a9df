//! Per-run search budget
//!
//! Shared by every sub-question of one research run. Tracks three limits:
//!
//! - paid provider calls (`max_calls`), after which the router serves the
//!   run from its reference provider
//! - providers whose quota ran out, skipped for the rest of the run
//! - accepted sources across all sub-questions (`max_sources`)

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
pub struct SearchBudget {
    max_calls: usize,
    calls: AtomicUsize,
    max_sources: usize,
    sources: AtomicUsize,
    exhausted: Mutex<HashSet<String>>,
    call_cap_noted: AtomicBool,
}

impl SearchBudget {
    pub fn new(max_calls: usize, max_sources: usize) -> Self {
        Self {
            max_calls: max_calls.max(1),
            calls: AtomicUsize::new(0),
            max_sources: max_sources.max(1),
            sources: AtomicUsize::new(0),
            exhausted: Mutex::new(HashSet::new()),
            call_cap_noted: AtomicBool::new(false),
        }
    }

    /// Reserve one paid provider call. `false` once the cap is reached.
    pub fn try_reserve_call(&self) -> bool {
        self.calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_calls).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn calls_made(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    /// `true` the first time the call cap is reported, so the run hears
    /// about it once.
    pub fn note_call_cap(&self) -> bool {
        !self.call_cap_noted.swap(true, Ordering::SeqCst)
    }

    /// Stop calling `provider` for this run. Returns `true` when the
    /// provider was not already marked.
    pub fn mark_quota_exhausted(&self, provider: &str) -> bool {
        self.exhausted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider.to_string())
    }

    pub fn quota_exhausted(&self, provider: &str) -> bool {
        self.exhausted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(provider)
    }

    /// Count one accepted source. `false` once the run's source budget is
    /// spent.
    pub fn try_accept_source(&self) -> bool {
        self.sources
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_sources).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn sources_accepted(&self) -> usize {
        self.sources.load(Ordering::SeqCst)
    }

    pub fn sources_exhausted(&self) -> bool {
        self.sources_accepted() >= self.max_sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_call_cap() {
        let budget = SearchBudget::new(2, 15);
        assert!(budget.try_reserve_call());
        assert!(budget.try_reserve_call());
        assert!(!budget.try_reserve_call());
        assert_eq!(budget.calls_made(), 2);

        assert!(budget.note_call_cap());
        assert!(!budget.note_call_cap());
    }

    #[test]
    fn test_quota_marks_once_per_provider() {
        let budget = SearchBudget::new(40, 15);
        assert!(!budget.quota_exhausted("tavily"));
        assert!(budget.mark_quota_exhausted("tavily"));
        assert!(!budget.mark_quota_exhausted("tavily"));
        assert!(budget.quota_exhausted("tavily"));
        assert!(!budget.quota_exhausted("exa"));
    }

    #[tokio::test]
    async fn test_source_budget_shared_across_tasks() {
        let budget = Arc::new(SearchBudget::new(40, 15));
        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let budget = budget.clone();
                tokio::spawn(async move { (0..4).filter(|_| budget.try_accept_source()).count() })
            })
            .collect();

        let mut accepted = 0;
        for task in tasks {
            accepted += task.await.unwrap();
        }
        assert_eq!(accepted, 15);
        assert!(budget.sources_exhausted());
    }
}
