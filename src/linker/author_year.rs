use once_cell::sync::Lazy;
use regex::Regex;

use super::{Candidate, LinkContext, LinkStrategy};
use crate::config::LinkerConfig;
use crate::names::{leading_surnames, surname_of, surname_similarity};
use crate::types::{AuthorYearKey, CitationTarget, DetectedSpan, LinkMethod, Reference};

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b((?:19|20)\d{2})([a-z])?\b").unwrap());

/// Weighted surname overlap plus year agreement against each reference.
pub struct AuthorYearFuzzy;

impl LinkStrategy for AuthorYearFuzzy {
    fn method(&self) -> LinkMethod {
        LinkMethod::AuthorYearFuzzy
    }

    fn candidates(&self, span: &DetectedSpan, ctx: &LinkContext<'_>) -> Vec<Candidate> {
        let CitationTarget::AuthorYear(key) = &span.target else {
            return Vec::new();
        };
        if key.surnames.is_empty() {
            return Vec::new();
        }
        ctx.references
            .iter()
            .enumerate()
            .map(|(idx, reference)| Candidate {
                reference: idx,
                confidence: score(key, reference, ctx.config),
            })
            // Author alone scores exactly the floor; the year has to agree too.
            .filter(|c| c.confidence > ctx.config.author_year_min_score)
            .collect()
    }
}

/// Combined score in `[0, 1]`.
pub(crate) fn score(key: &AuthorYearKey, reference: &Reference, config: &LinkerConfig) -> f64 {
    let total = config.author_weight + config.year_weight;
    if total <= 0.0 {
        return 0.0;
    }
    let authors = author_score(key, reference, config.surname_similarity_min);
    let year = year_score(key, reference);
    (config.author_weight * authors + config.year_weight * year) / total
}

fn reference_surnames(reference: &Reference) -> Vec<String> {
    if reference.authors.is_empty() {
        return leading_surnames(&reference.raw_text);
    }
    reference
        .authors
        .iter()
        .map(|a| surname_of(a))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Share of marker surnames found among the reference's authors. A
/// mismatched first author halves it.
fn author_score(key: &AuthorYearKey, reference: &Reference, min_similarity: f64) -> f64 {
    let theirs = reference_surnames(reference);
    let Some(first) = theirs.first() else {
        return 0.0;
    };
    let matches = |ours: &str, candidate: &str| surname_similarity(ours, candidate) >= min_similarity;
    let found = key
        .surnames
        .iter()
        .filter(|ours| theirs.iter().any(|t| matches(ours, t)))
        .count();
    let share = found as f64 / key.surnames.len() as f64;
    if matches(&key.surnames[0], first) { share } else { share * 0.5 }
}

/// 1.0 for an exact year (and suffix) match, less when the reference
/// carries no suffix or a different one, 0.0 otherwise.
fn year_score(key: &AuthorYearKey, reference: &Reference) -> f64 {
    let years: Vec<(i32, Option<char>)> = YEAR_RE
        .captures_iter(&reference.raw_text)
        .filter_map(|c| {
            let year = c[1].parse().ok()?;
            Some((year, c.get(2).and_then(|m| m.as_str().chars().next())))
        })
        .collect();
    let year_matches = reference.year == Some(key.year) || years.iter().any(|(y, _)| *y == key.year);
    if !year_matches {
        return 0.0;
    }
    let Some(suffix) = key.suffix else {
        return 1.0;
    };
    let suffixes: Vec<char> = years
        .iter()
        .filter(|(y, _)| *y == key.year)
        .filter_map(|(_, s)| *s)
        .collect();
    if suffixes.contains(&suffix) {
        1.0
    } else if suffixes.is_empty() {
        0.9
    } else {
        0.5
    }
}
