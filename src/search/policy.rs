//! Source policy: which search phases a sub-question query goes through
//!
//! ```text
//!   hybrid_trusted_first, business:   reference ─▶ trusted ─▶ broad
//!   hybrid_trusted_first, historical: reference ─▶ broad
//!   broad:                            broad
//! ```
//!
//! The reference phase asks the keyless reference provider. The trusted phase
//! restricts paid providers to tier A and B domains. The broad phase is
//! the open web.

use std::fmt;
use std::str::FromStr;

use crate::search::scoring::tokenize;

/// Results asked from the reference provider per query
pub const REFERENCE_RESULTS: usize = 3;

/// Results asked per broad query when the overall question is historical
pub const HISTORICAL_RESULTS_PER_QUERY: usize = 5;

/// Accepted sources after which a sub-question skips its remaining phases
pub const ENOUGH_SOURCES: usize = 3;

const HISTORICAL_TERMS: [&str; 11] = [
    "history",
    "historical",
    "origin",
    "community",
    "culture",
    "linguistic",
    "ethnographic",
    "biography",
    "who are",
    "background",
    "tradition",
];

const BUSINESS_TERMS: [&str; 11] = [
    "market",
    "expand",
    "investment",
    "competitor",
    "regulatory",
    "infrastructure",
    "strategy",
    "risk",
    "gdp",
    "inflation",
    "central bank",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourcePolicy {
    /// One open-web search per query
    #[default]
    Broad,
    /// Reference lookup, then trusted domains, then the open web
    HybridTrustedFirst,
}

impl SourcePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourcePolicy::Broad => "broad",
            SourcePolicy::HybridTrustedFirst => "hybrid_trusted_first",
        }
    }

    /// Phases for one query, in order.
    pub fn phases(&self, intent: QueryIntent) -> Vec<SearchPhase> {
        match (self, intent) {
            (SourcePolicy::Broad, _) => vec![SearchPhase::Broad],
            (SourcePolicy::HybridTrustedFirst, QueryIntent::Historical) => {
                vec![SearchPhase::Reference, SearchPhase::Broad]
            }
            (SourcePolicy::HybridTrustedFirst, QueryIntent::Business) => {
                vec![SearchPhase::Reference, SearchPhase::Trusted, SearchPhase::Broad]
            }
        }
    }
}

impl fmt::Display for SourcePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourcePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "broad" | "open" => Ok(SourcePolicy::Broad),
            "hybrid_trusted_first" | "trusted_first" => Ok(SourcePolicy::HybridTrustedFirst),
            other => Err(format!(
                "unknown source policy '{}' (expected broad or hybrid_trusted_first)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPhase {
    Reference,
    Trusted,
    Broad,
}

impl SearchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchPhase::Reference => "reference",
            SearchPhase::Trusted => "trusted",
            SearchPhase::Broad => "broad",
        }
    }
}

/// Rough kind of question, from keyword counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    Historical,
    Business,
}

fn term_hits(text: &str, tokens: &std::collections::HashSet<String>, terms: &[&str]) -> usize {
    terms
        .iter()
        .filter(|term| {
            if term.contains(' ') {
                text.contains(*term)
            } else {
                tokens.contains(**term)
            }
        })
        .count()
}

/// Historical when historical terms outnumber business terms.
pub fn query_intent(query: &str) -> QueryIntent {
    let text = query.to_lowercase();
    let tokens = tokenize(&text);
    let historical = term_hits(&text, &tokens, &HISTORICAL_TERMS);
    let business = term_hits(&text, &tokens, &BUSINESS_TERMS);
    if historical > business {
        QueryIntent::Historical
    } else {
        QueryIntent::Business
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_intent() {
        assert_eq!(
            query_intent("History and culture of the Basque community"),
            QueryIntent::Historical
        );
        assert_eq!(query_intent("Who are the Sorbs?"), QueryIntent::Historical);
        assert_eq!(
            query_intent("Market entry risk and regulatory history in Vietnam"),
            QueryIntent::Business
        );
        assert_eq!(query_intent("capital of France"), QueryIntent::Business);
    }

    #[test]
    fn test_phases() {
        use SearchPhase::*;
        assert_eq!(SourcePolicy::Broad.phases(QueryIntent::Historical), vec![Broad]);
        assert_eq!(
            SourcePolicy::HybridTrustedFirst.phases(QueryIntent::Business),
            vec![Reference, Trusted, Broad]
        );
        assert_eq!(
            SourcePolicy::HybridTrustedFirst.phases(QueryIntent::Historical),
            vec![Reference, Broad]
        );
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!("hybrid_trusted_first".parse::<SourcePolicy>().unwrap(), SourcePolicy::HybridTrustedFirst);
        assert_eq!(" Broad ".parse::<SourcePolicy>().unwrap(), SourcePolicy::Broad);
        assert!("wikipedia_only".parse::<SourcePolicy>().is_err());
        assert_eq!(SourcePolicy::HybridTrustedFirst.to_string(), "hybrid_trusted_first");
    }
}
