//! Multi-provider search router
//!
//! Fans a query out to every primary provider concurrently, interleaves
//! their results, deduplicates by normalized URL, scores and caps. The
//! fallback provider is called exactly once, and only when the primaries
//! produced nothing usable. Items without text are item-level failures and
//! never count as usable.
//!
//! With a [`SearchBudget`] attached, paid calls are counted against the
//! run's cap and providers that report an exhausted quota are skipped. When
//! those limits leave a search empty, the reference provider answers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Datelike;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::SearchError;
use crate::search::budget::SearchBudget;
use crate::search::provider::{
    EvidenceItem, FetchStatus, ProviderResult, SearchParams, SearchProvider, TimeRange,
};
use crate::search::scoring::{score_result, DIVERSITY_BONUS};
use crate::search::url::{normalize_url, sanitize_query, source_name, truncate_chars};

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Results requested from each provider per call
    pub max_results_per_query: usize,

    /// Evidence items kept per router call
    pub max_evidence: usize,

    /// Items kept per source domain
    pub max_per_domain: usize,

    /// Timeout for a single provider call
    pub provider_timeout: Duration,

    /// Provider calls allowed in flight across the whole router
    pub max_outbound_calls: usize,

    /// Paid provider calls allowed per research run
    pub max_calls_per_run: usize,

    /// Sources accepted per research run, across all sub-questions
    pub max_sources_per_run: usize,

    /// Skip a provider for the rest of the run after it reports an
    /// exhausted quota
    pub fail_fast_on_quota: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_results_per_query: 3,
            max_evidence: 4,
            max_per_domain: 2,
            provider_timeout: Duration::from_secs(20),
            max_outbound_calls: 6,
            max_calls_per_run: 40,
            max_sources_per_run: 15,
            fail_fast_on_quota: true,
        }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_results_per_query(mut self, max: usize) -> Self {
        self.max_results_per_query = max.max(1);
        self
    }

    pub fn with_max_evidence(mut self, max: usize) -> Self {
        self.max_evidence = max.max(1);
        self
    }

    pub fn with_max_per_domain(mut self, max: usize) -> Self {
        self.max_per_domain = max.max(1);
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn with_max_outbound_calls(mut self, max: usize) -> Self {
        self.max_outbound_calls = max.max(1);
        self
    }

    pub fn with_max_calls_per_run(mut self, max: usize) -> Self {
        self.max_calls_per_run = max.max(1);
        self
    }

    pub fn with_max_sources_per_run(mut self, max: usize) -> Self {
        self.max_sources_per_run = max.max(1);
        self
    }

    pub fn with_fail_fast_on_quota(mut self, enabled: bool) -> Self {
        self.fail_fast_on_quota = enabled;
        self
    }
}

/// Per-call search constraints supplied by the research stage.
#[derive(Debug, Clone, Default)]
pub struct SearchConstraints {
    pub include_domains: Vec<String>,
    pub time_range: Option<TimeRange>,
    /// Overrides [`RouterConfig::max_results_per_query`]
    pub max_results: Option<usize>,
    /// Run budget to charge; `None` searches without limits
    pub budget: Option<Arc<SearchBudget>>,
}

/// A provider call that failed or timed out.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: SearchError,
}

/// Result of one router call.
#[derive(Debug, Clone, Default)]
pub struct RouterOutcome {
    /// Deduplicated, scored, capped evidence in rank order
    pub evidence: Vec<EvidenceItem>,
    /// Items collapsed into an earlier item with the same normalized URL
    pub duplicates: Vec<EvidenceItem>,
    /// Items dropped for having no text, marked [`FetchStatus::Failed`]
    pub rejected: Vec<EvidenceItem>,
    pub failures: Vec<ProviderFailure>,
    pub fallback_used: bool,
    /// The reference provider answered because of the run budget
    pub reference_used: bool,
    /// A paid call was refused by the run's call cap
    pub call_cap_reached: bool,
    /// Providers whose quota ran out during this call
    pub quota_exhausted: Vec<String>,
}

/// Multi-provider search router
pub struct SearchRouter {
    primaries: Vec<Arc<dyn SearchProvider>>,
    fallback: Option<Arc<dyn SearchProvider>>,
    reference: Option<Arc<dyn SearchProvider>>,
    permits: Arc<Semaphore>,
    config: RouterConfig,
}

impl SearchRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            primaries: Vec::new(),
            fallback: None,
            reference: None,
            permits: Arc::new(Semaphore::new(config.max_outbound_calls.max(1))),
            config,
        }
    }

    /// Add a primary provider. Primaries are queried in registration order.
    pub fn with_primary(mut self, provider: Arc<dyn SearchProvider>) -> Self {
        self.primaries.push(provider);
        self
    }

    pub fn with_fallback(mut self, provider: Arc<dyn SearchProvider>) -> Self {
        self.fallback = Some(provider);
        self
    }

    /// Keyless provider for reference lookups and for searches the run
    /// budget would otherwise leave empty.
    pub fn with_reference(mut self, provider: Arc<dyn SearchProvider>) -> Self {
        self.reference = Some(provider);
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn primary_names(&self) -> Vec<String> {
        self.primaries.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Fresh budget for one research run.
    pub fn run_budget(&self) -> Arc<SearchBudget> {
        Arc::new(SearchBudget::new(
            self.config.max_calls_per_run,
            self.config.max_sources_per_run,
        ))
    }

    /// Search every primary, merge and rank. Provider errors never escape;
    /// they come back as [`ProviderFailure`] records.
    pub async fn search(&self, query: &str, constraints: &SearchConstraints) -> RouterOutcome {
        let mut outcome = RouterOutcome::default();
        let query = sanitize_query(query);
        if query.is_empty() {
            return outcome;
        }

        let params = SearchParams {
            max_results: constraints
                .max_results
                .unwrap_or(self.config.max_results_per_query)
                .max(1),
            include_domains: constraints.include_domains.clone(),
            time_range: constraints.time_range,
            ..Default::default()
        };

        info!(
            query = %truncate_chars(&query, 120),
            max_results = params.max_results,
            include_domains = !params.include_domains.is_empty(),
            primaries = ?self.primary_names(),
            "search.start"
        );

        let budget = constraints.budget.as_deref();
        let admitted: Vec<&Arc<dyn SearchProvider>> = self
            .primaries
            .iter()
            .filter(|provider| self.admit(provider, budget, &mut outcome))
            .collect();
        let calls = admitted
            .iter()
            .map(|provider| self.call_provider(provider, &query, &params));
        let results = join_all(calls).await;

        let mut batches = Vec::with_capacity(results.len());
        for (provider, result) in admitted.into_iter().zip(results) {
            match result {
                Ok(items) => {
                    info!(provider = provider.name(), results = items.len(), "search.provider_ok");
                    batches.push(items);
                }
                Err(error) => self.record_failure(provider, error, budget, &mut outcome),
            }
        }

        let (mut unique, mut duplicates) = dedupe(interleave(batches));
        unique = self.reject_empty(unique, &mut outcome);

        if unique.is_empty() {
            if let Some(fallback) = &self.fallback {
                if self.admit(fallback, budget, &mut outcome) {
                    info!(
                        provider = fallback.name(),
                        failed_primaries = outcome.failures.len(),
                        "search.fallback"
                    );
                    outcome.fallback_used = true;
                    match self.call_provider(fallback, &query, &params).await {
                        Ok(items) => {
                            info!(provider = fallback.name(), results = items.len(), "search.provider_ok");
                            (unique, duplicates) = dedupe(items);
                            unique = self.reject_empty(unique, &mut outcome);
                        }
                        Err(error) => self.record_failure(fallback, error, budget, &mut outcome),
                    }
                }
            }
        }

        let limited = outcome.call_cap_reached || !outcome.quota_exhausted.is_empty() || self.any_exhausted(budget);
        if unique.is_empty() && limited {
            if let Some(reference) = &self.reference {
                info!(
                    provider = reference.name(),
                    call_cap_reached = outcome.call_cap_reached,
                    "search.reference_fallback"
                );
                outcome.reference_used = true;
                match self.call_provider(reference, &query, &params).await {
                    Ok(items) => {
                        info!(provider = reference.name(), results = items.len(), "search.provider_ok");
                        (unique, duplicates) = dedupe(items);
                        unique = self.reject_empty(unique, &mut outcome);
                    }
                    Err(error) => self.record_failure(reference, error, None, &mut outcome),
                }
            }
        }

        outcome.evidence = self.rank(&query, unique);
        outcome.duplicates = duplicates
            .into_iter()
            .map(|r| EvidenceItem::from_result(r, FetchStatus::Deduped, 0.0))
            .collect();

        if outcome.evidence.is_empty() {
            warn!(
                query = %truncate_chars(&query, 120),
                failures = outcome.failures.len(),
                "search.failed"
            );
        } else {
            info!(
                results = outcome.evidence.len(),
                deduped = outcome.duplicates.len(),
                fallback = outcome.fallback_used,
                "search.complete"
            );
        }
        outcome
    }

    /// Look something up in the reference provider only. Never charged to
    /// a run budget.
    pub async fn search_reference(&self, query: &str, max_results: usize) -> RouterOutcome {
        let mut outcome = RouterOutcome::default();
        let query = sanitize_query(query);
        let Some(reference) = &self.reference else {
            return outcome;
        };
        if query.is_empty() {
            return outcome;
        }

        let params = SearchParams {
            max_results: max_results.max(1),
            ..Default::default()
        };
        info!(
            query = %truncate_chars(&query, 120),
            provider = reference.name(),
            max_results = params.max_results,
            "search.reference"
        );

        let (unique, duplicates) = match self.call_provider(reference, &query, &params).await {
            Ok(items) => dedupe(items),
            Err(error) => {
                self.record_failure(reference, error, None, &mut outcome);
                (Vec::new(), Vec::new())
            }
        };
        let unique = self.reject_empty(unique, &mut outcome);
        outcome.evidence = self.rank(&query, unique);
        outcome.duplicates = duplicates
            .into_iter()
            .map(|r| EvidenceItem::from_result(r, FetchStatus::Deduped, 0.0))
            .collect();
        outcome
    }

    /// Charge a paid call to the run budget. Refused when the provider's
    /// quota is gone or the call cap is reached.
    fn admit(
        &self,
        provider: &Arc<dyn SearchProvider>,
        budget: Option<&SearchBudget>,
        outcome: &mut RouterOutcome,
    ) -> bool {
        let Some(budget) = budget else {
            return true;
        };
        if budget.quota_exhausted(provider.name()) {
            debug!(provider = provider.name(), "search.skip_exhausted");
            return false;
        }
        if !budget.try_reserve_call() {
            warn!(
                provider = provider.name(),
                calls = budget.calls_made(),
                max_calls = budget.max_calls(),
                "search.call_cap"
            );
            outcome.call_cap_reached = true;
            return false;
        }
        true
    }

    fn any_exhausted(&self, budget: Option<&SearchBudget>) -> bool {
        budget.is_some_and(|b| {
            self.primaries
                .iter()
                .chain(self.fallback.iter())
                .any(|p| b.quota_exhausted(p.name()))
        })
    }

    fn record_failure(
        &self,
        provider: &Arc<dyn SearchProvider>,
        error: SearchError,
        budget: Option<&SearchBudget>,
        outcome: &mut RouterOutcome,
    ) {
        warn!(provider = provider.name(), error = %error, "search.provider_error");
        if let (SearchError::QuotaExceeded(_), Some(budget)) = (&error, budget) {
            if self.config.fail_fast_on_quota && budget.mark_quota_exhausted(provider.name()) {
                warn!(provider = provider.name(), "search.quota_exhausted");
                outcome.quota_exhausted.push(provider.name().to_string());
            }
        }
        outcome.failures.push(ProviderFailure {
            provider: provider.name().to_string(),
            error,
        });
    }

    /// Move items without text into the outcome's rejected list.
    fn reject_empty(&self, items: Vec<ProviderResult>, outcome: &mut RouterOutcome) -> Vec<ProviderResult> {
        let (usable, empty): (Vec<_>, Vec<_>) = items.into_iter().partition(ProviderResult::has_text);
        for item in empty {
            debug!(provider = %item.provider, url = %item.url, "search.empty_content");
            outcome
                .rejected
                .push(EvidenceItem::from_result(item, FetchStatus::Failed, 0.0));
        }
        usable
    }

    /// One provider call under an outbound permit and the per-call timeout.
    async fn call_provider(
        &self,
        provider: &Arc<dyn SearchProvider>,
        query: &str,
        params: &SearchParams,
    ) -> Result<Vec<ProviderResult>, SearchError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SearchError::Network("outbound permit pool closed".to_string()))?;

        match tokio::time::timeout(self.config.provider_timeout, provider.search(query, params))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SearchError::Timeout(self.config.provider_timeout)),
        }
    }

    /// Score, apply the per-domain cap and the diversity bonus, then cap.
    fn rank(&self, query: &str, items: Vec<ProviderResult>) -> Vec<EvidenceItem> {
        let current_year = chrono::Utc::now().year();
        let mut scored: Vec<(f64, ProviderResult)> = items
            .into_iter()
            .map(|r| (score_result(query, &r, current_year), r))
            .collect();
        sort_by_score(&mut scored);

        let mut per_domain: HashMap<String, usize> = HashMap::new();
        let mut kept: Vec<(f64, ProviderResult)> = Vec::new();
        for (score, result) in scored {
            let count = per_domain.entry(source_name(&result.url)).or_insert(0);
            if *count >= self.config.max_per_domain {
                continue;
            }
            let bonus = if *count == 0 { DIVERSITY_BONUS } else { 0.0 };
            *count += 1;
            kept.push((score + bonus, result));
        }
        sort_by_score(&mut kept);

        kept.into_iter()
            .take(self.config.max_evidence)
            .map(|(score, r)| EvidenceItem::from_result(r, FetchStatus::Fetched, round3(score)))
            .collect()
    }
}

/// Round-robin across provider batches so no single provider dominates.
fn interleave(batches: Vec<Vec<ProviderResult>>) -> Vec<ProviderResult> {
    let longest = batches.iter().map(Vec::len).max().unwrap_or(0);
    let mut iters: Vec<_> = batches.into_iter().map(Vec::into_iter).collect();
    let mut merged = Vec::new();
    for _ in 0..longest {
        for iter in iters.iter_mut() {
            if let Some(item) = iter.next() {
                merged.push(item);
            }
        }
    }
    merged
}

/// Deduplicate by normalized URL. Items whose URL does not normalize are
/// dropped. A later duplicate replaces the kept item only when it has text
/// and the kept one has none.
pub(crate) fn dedupe(items: Vec<ProviderResult>) -> (Vec<ProviderResult>, Vec<ProviderResult>) {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<ProviderResult> = Vec::new();
    let mut duplicates = Vec::new();

    for item in items {
        let Some(key) = normalize_url(&item.url) else {
            continue;
        };
        match index.get(&key) {
            Some(&pos) => {
                if !unique[pos].has_text() && item.has_text() {
                    let replaced = std::mem::replace(&mut unique[pos], item);
                    duplicates.push(replaced);
                } else {
                    duplicates.push(item);
                }
            }
            None => {
                index.insert(key, unique.len());
                unique.push(item);
            }
        }
    }
    (unique, duplicates)
}

fn sort_by_score(items: &mut [(f64, ProviderResult)]) {
    items.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
