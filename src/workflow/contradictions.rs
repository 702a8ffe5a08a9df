//! Contradiction detection
//!
//! Detectors annotate a sub-question's evidence with suspected
//! disagreements. They never pick a winner.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::search::scoring::tokenize;
use crate::search::EvidenceItem;

/// Contradictions kept per sub-question
pub const MAX_CONTRADICTIONS: usize = 4;

static SENTENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]\s+|\n+").expect("valid sentence regex"));

static CLAIM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d[\d,]*(?:\.\d+)?)\s*(%|percent\b|million\b|billion\b)")
        .expect("valid numeric claim regex")
});

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "are", "was", "were", "has", "have",
    "its", "per", "percent", "million", "billion", "about", "than", "into", "over", "year",
    "while", "been", "will", "which", "their", "more", "less",
];

/// Pluggable heuristic that flags disagreement between evidence items.
pub trait ContradictionDetector: Send + Sync {
    fn detect(&self, evidence: &[EvidenceItem]) -> Vec<String>;
}

/// Flags numeric claims from different sources that share key terms but
/// differ by more than `tolerance` (relative).
#[derive(Debug, Clone)]
pub struct NumericClaimDetector {
    pub min_shared_terms: usize,
    pub tolerance: f64,
}

impl Default for NumericClaimDetector {
    fn default() -> Self {
        Self {
            min_shared_terms: 2,
            tolerance: 0.10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Percent,
    Count,
}

#[derive(Debug, Clone)]
struct NumericClaim<'a> {
    source: &'a str,
    raw: String,
    value: f64,
    unit: Unit,
    terms: HashSet<String>,
}

fn parse_claims(item: &EvidenceItem) -> Vec<NumericClaim<'_>> {
    let mut claims = Vec::new();
    for sentence in SENTENCE_RE.split(&item.extracted_text) {
        let terms: HashSet<String> = tokenize(sentence)
            .into_iter()
            .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
            .filter(|t| !STOPWORDS.contains(&t.as_str()))
            .collect();
        for caps in CLAIM_RE.captures_iter(sentence) {
            let Ok(number) = caps[1].replace(',', "").parse::<f64>() else {
                continue;
            };
            let (unit, value) = match caps[2].to_lowercase().as_str() {
                "%" | "percent" => (Unit::Percent, number),
                "million" => (Unit::Count, number * 1e6),
                _ => (Unit::Count, number * 1e9),
            };
            claims.push(NumericClaim {
                source: &item.source_name,
                raw: caps[0].trim().to_string(),
                value,
                unit,
                terms: terms.clone(),
            });
        }
    }
    claims
}

impl NumericClaimDetector {
    fn disagree(&self, a: &NumericClaim<'_>, b: &NumericClaim<'_>) -> bool {
        let largest = a.value.abs().max(b.value.abs());
        largest > 0.0 && (a.value - b.value).abs() / largest > self.tolerance
    }
}

impl ContradictionDetector for NumericClaimDetector {
    fn detect(&self, evidence: &[EvidenceItem]) -> Vec<String> {
        let claims: Vec<NumericClaim<'_>> = evidence.iter().flat_map(parse_claims).collect();
        let mut found: Vec<String> = Vec::new();

        for (i, a) in claims.iter().enumerate() {
            for b in &claims[i + 1..] {
                if a.source == b.source || a.unit != b.unit {
                    continue;
                }
                let mut shared: Vec<&String> = a.terms.intersection(&b.terms).collect();
                if shared.len() < self.min_shared_terms || !self.disagree(a, b) {
                    continue;
                }
                shared.sort();
                let topic = shared
                    .iter()
                    .take(3)
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                let line = format!(
                    "{} reports {} while {} reports {} ({})",
                    a.source, a.raw, b.source, b.raw, topic
                );
                if !found.contains(&line) {
                    found.push(line);
                }
                if found.len() >= MAX_CONTRADICTIONS {
                    return found;
                }
            }
        }
        found
    }
}
