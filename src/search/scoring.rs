//! Evidence scoring
//!
//! A score in `0.0..=1.1` built from query-term relevance, source
//! credibility, content length and a recency proxy. The router adds
//! [`DIVERSITY_BONUS`] to the best item of each domain.
//!
//! Credibility comes in tiers: institutional sources (tier A, plus any
//! `.gov`/`.edu` host), established press and reference works (tier B), and
//! everything else.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::search::provider::ProviderResult;
use crate::search::url::source_name;

static WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-zA-Z0-9]{3,}\b").expect("valid word regex"));

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(20\d{2})\b").expect("valid year regex"));

const RELEVANCE_WEIGHT: f64 = 0.4;
const CREDIBILITY_WEIGHT: f64 = 0.25;
const CONTENT_WEIGHT: f64 = 0.2;
const RECENCY_WEIGHT: f64 = 0.15;

/// Central banks and international institutions
pub const TIER_A_DOMAINS: [&str; 6] = [
    "imf.org",
    "worldbank.org",
    "bis.org",
    "oecd.org",
    "federalreserve.gov",
    "ecb.europa.eu",
];

/// Established press, consultancies and reference works
pub const TIER_B_DOMAINS: [&str; 7] = [
    "reuters.com",
    "bloomberg.com",
    "ft.com",
    "wsj.com",
    "mckinsey.com",
    "weforum.org",
    "wikipedia.org",
];

/// Host suffixes trusted as tier A
const TRUSTED_SUFFIXES: [&str; 2] = [".gov", ".edu"];

pub const REFERENCE_DOMAIN: &str = "wikipedia.org";

/// Content length at which the length component saturates
const FULL_CONTENT_CHARS: usize = 800;

/// Added to the highest-ranked item of each source domain
pub const DIVERSITY_BONUS: f64 = 0.1;

/// Lower-cased word tokens of three or more characters.
pub fn tokenize(text: &str) -> HashSet<String> {
    WORD_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Fraction of query tokens present in the title or content.
pub fn relevance(query: &str, title: &str, content: &str) -> f64 {
    let target = tokenize(query);
    if target.is_empty() {
        return 0.5;
    }
    let found = tokenize(&format!("{} {}", title, content));
    if found.is_empty() {
        return 0.0;
    }
    let overlap = target.intersection(&found).count();
    (overlap as f64 / target.len() as f64).min(1.0)
}

/// Years (2000-2099) mentioned in a piece of text.
pub fn years_in(text: &str) -> Vec<i32> {
    YEAR_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect()
}

/// Recency proxy from the published date, or years in the text when the
/// provider reported no date.
pub fn recency(published_date: Option<&str>, text: &str, current_year: i32) -> f64 {
    let years = published_date
        .map(years_in)
        .filter(|y| !y.is_empty())
        .unwrap_or_else(|| years_in(text));

    match years.iter().map(|y| (current_year - y).abs()).min() {
        None => 0.5,
        Some(delta) if delta <= 1 => 1.0,
        Some(delta) if delta <= 3 => 0.75,
        Some(_) => 0.45,
    }
}

pub fn content_weight(content: &str) -> f64 {
    (content.chars().count() as f64 / FULL_CONTENT_CHARS as f64).min(1.0)
}

fn normalize_domain(domain: &str) -> String {
    let lower = domain.trim().to_ascii_lowercase();
    lower.strip_prefix("www.").map(str::to_string).unwrap_or(lower)
}

/// `host` is `domain` or one of its subdomains.
fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn in_tier(host: &str, tier: &[&str]) -> bool {
    tier.iter().any(|d| host_matches(host, d))
}

pub fn is_tier_a(domain: &str) -> bool {
    let host = normalize_domain(domain);
    in_tier(&host, &TIER_A_DOMAINS) || TRUSTED_SUFFIXES.iter().any(|s| host.ends_with(s))
}

pub fn is_tier_b(domain: &str) -> bool {
    in_tier(&normalize_domain(domain), &TIER_B_DOMAINS)
}

pub fn is_trusted_domain(domain: &str) -> bool {
    is_tier_a(domain) || is_tier_b(domain)
}

/// Credibility of a source domain in `0.35..=1.0`.
pub fn credibility_score_for_domain(domain: &str) -> f64 {
    let host = normalize_domain(domain);
    if in_tier(&host, &TIER_A_DOMAINS) {
        1.0
    } else if host_matches(&host, REFERENCE_DOMAIN) {
        0.72
    } else if in_tier(&host, &TIER_B_DOMAINS) {
        0.78
    } else if TRUSTED_SUFFIXES.iter().any(|s| host.ends_with(s)) {
        0.9
    } else {
        0.35
    }
}

/// Tier A and B domains, sorted. Used as an include-domains filter for
/// the trusted search phase.
pub fn trusted_domain_seeds() -> Vec<String> {
    let mut seeds: Vec<String> = TIER_A_DOMAINS
        .iter()
        .chain(TIER_B_DOMAINS.iter())
        .map(|d| d.to_string())
        .collect();
    seeds.sort();
    seeds
}

/// Base score of a result for a query, before the diversity bonus.
pub fn score_result(query: &str, result: &ProviderResult, current_year: i32) -> f64 {
    let relevance = relevance(query, &result.title, &result.content);
    let credibility = credibility_score_for_domain(&source_name(&result.url));
    let content = content_weight(&result.content);
    let recency = recency(
        result.published_date.as_deref(),
        &format!("{} {}", result.title, result.content),
        current_year,
    );
    RELEVANCE_WEIGHT * relevance
        + CREDIBILITY_WEIGHT * credibility
        + CONTENT_WEIGHT * content
        + RECENCY_WEIGHT * recency
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        let tokens = tokenize("What is the capital of France? An EU state.");
        assert!(tokens.contains("capital"));
        assert!(tokens.contains("france"));
        assert!(!tokens.contains("is"));
        assert!(!tokens.contains("an"));
    }

    #[test]
    fn test_relevance() {
        assert_eq!(relevance("", "anything", ""), 0.5);
        assert_eq!(relevance("capital france", "", ""), 0.0);
        assert_eq!(relevance("capital france", "France", "its capital is Paris"), 1.0);
        assert_eq!(relevance("capital france", "France facts", ""), 0.5);
    }

    #[test]
    fn test_recency_buckets() {
        assert_eq!(recency(Some("2026-03-01"), "", 2026), 1.0);
        assert_eq!(recency(None, "report from 2024", 2026), 0.75);
        assert_eq!(recency(None, "published 2015", 2026), 0.45);
        assert_eq!(recency(None, "no dates", 2026), 0.5);
        // the provider date wins over years in the text
        assert_eq!(recency(Some("2010-01-01"), "2026", 2026), 0.45);
    }

    #[test]
    fn test_credibility_tiers() {
        assert_eq!(credibility_score_for_domain("imf.org"), 1.0);
        assert_eq!(credibility_score_for_domain("www.IMF.org"), 1.0);
        assert_eq!(credibility_score_for_domain("data.worldbank.org"), 1.0);
        assert_eq!(credibility_score_for_domain("reuters.com"), 0.78);
        assert_eq!(credibility_score_for_domain("en.wikipedia.org"), 0.72);
        assert_eq!(credibility_score_for_domain("census.gov"), 0.9);
        assert_eq!(credibility_score_for_domain("mit.edu"), 0.9);
        assert_eq!(credibility_score_for_domain("someblog.com"), 0.35);
        // suffix match is on whole labels only
        assert_eq!(credibility_score_for_domain("notreuters.com"), 0.35);
    }

    #[test]
    fn test_trusted_domains() {
        assert!(is_tier_a("stats.oecd.org"));
        assert!(is_tier_a("nasa.gov"));
        assert!(!is_tier_a("reuters.com"));
        assert!(is_tier_b("reuters.com"));
        assert!(is_trusted_domain("ft.com"));
        assert!(!is_trusted_domain("example.com"));

        let seeds = trusted_domain_seeds();
        assert_eq!(seeds.len(), TIER_A_DOMAINS.len() + TIER_B_DOMAINS.len());
        assert!(seeds.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_score_prefers_credible_source() {
        let text = "Inflation outlook for the euro area in 2026. ".repeat(10);
        let institution = ProviderResult::new("exa", "Inflation outlook", "https://www.ecb.europa.eu/pub", text.clone());
        let blog = ProviderResult::new("exa", "Inflation outlook", "https://someblog.com/post", text);
        assert!(
            score_result("inflation outlook", &institution, 2026)
                > score_result("inflation outlook", &blog, 2026)
        );
    }

    #[test]
    fn test_score_prefers_relevant_content() {
        let relevant = ProviderResult::new(
            "exa",
            "Paris is the capital of France",
            "https://a.com",
            "The capital of France is Paris. ".repeat(20),
        );
        let off_topic = ProviderResult::new("exa", "Cooking pasta", "https://b.com", "Boil water.");
        assert!(
            score_result("capital of France", &relevant, 2026)
                > score_result("capital of France", &off_topic, 2026)
        );
    }
}
