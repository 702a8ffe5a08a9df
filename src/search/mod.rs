//! Web search: provider clients, the multi-provider router and the per-run
//! search budget

pub mod budget;
pub mod exa;
pub mod firecrawl;
pub mod policy;
pub mod provider;
pub mod router;
pub mod scoring;
pub mod tavily;
pub mod url;
pub mod wikipedia;

pub use budget::SearchBudget;
pub use exa::ExaSearchProvider;
pub use firecrawl::FirecrawlSearchProvider;
pub use policy::{query_intent, QueryIntent, SearchPhase, SourcePolicy};
pub use provider::{
    Citation, EvidenceItem, FetchStatus, ProviderResult, SearchDepth, SearchParams, SearchProvider,
    TimeRange,
};
pub use router::{ProviderFailure, RouterConfig, RouterOutcome, SearchConstraints, SearchRouter};
pub use scoring::credibility_score_for_domain;
pub use tavily::TavilySearchProvider;
pub use url::normalize_url;
pub use wikipedia::WikipediaSearchProvider;
