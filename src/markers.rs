use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::geometry::BBox;
use crate::names;
use crate::types::{AuthorYearKey, CitationStyle, CitationTarget, Line};

/// Bibliography entry markers at the start of a line: [1], (1), 1., 1).
/// Bare-number variants are limited to 1-3 digits to avoid matching years
/// like "2024." and require trailing whitespace/EOL to reject decimals.
pub(crate) static REFERENCE_ENTRY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:\[(\d{1,4})\]|\((\d{1,4})\)|(\d{1,3})[.\)](?:\s|$))").unwrap()
});

const NUM_ITEM: &str = r"\d{1,4}(?:\s*[-–—]\s*\d{1,4})?";

/// Bracketed or parenthesized integer lists and ranges: [12], [3, 4], (5-7).
static NUMERIC_CITE_RE: Lazy<Regex> = Lazy::new(|| {
    let list = format!(r"{NUM_ITEM}(?:\s*[,;]\s*{NUM_ITEM})*");
    Regex::new(&format!(r"\[\s*({list})\s*\]|\(\s*({list})\s*\)")).unwrap()
});

static NUM_ITEM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,4})(?:\s*[-–—]\s*(\d{1,4}))?").unwrap());

static SEPARATOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*([,;])\s*").unwrap());

/// Words that put a following number in a non-bibliographic namespace.
static NON_CITATION_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:eqs?\.?|equations?|figs?\.?|figures?|tables?|tab\.|sections?|sec\.|§|appendix|lines?|theorems?|lemmas?|steps?|chapters?|ch\.)\s*$",
    )
    .unwrap()
});

const NAME: &str = r"(?:(?:van|von|de|der|den|del|da|di|du|la|le)\s+)*\p{Lu}[\p{L}'’\-]+";
const YEAR: &str = r"(?:19|20)\d{2}[a-z]?";

fn authors_pattern() -> String {
    format!(
        r"{NAME}(?:\s+et\s+al\.?|(?:\s*,\s*{NAME})*\s*,?\s*(?:and|&)\s+{NAME})?"
    )
}

/// One author-year item inside a parenthetical group.
static AUTHOR_ITEM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^\s*(?:(?:see|e\.g\.|cf\.|i\.e\.)\s*,?\s+)?({authors})(\s*,)?\s*({YEAR}(?:\s*,\s*{YEAR})*)(?:\s*,\s*(?:p|pp)\.\s*[\d\-–]+)?\s*$",
        authors = authors_pattern()
    ))
    .unwrap()
});

/// Narrative form: "Smith and Jones (2019)", "Lee et al. (2020a, 2021)".
static NARRATIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"({authors})\s*\(\s*({YEAR}(?:\s*,\s*{YEAR})*)\s*\)",
        authors = authors_pattern()
    ))
    .unwrap()
});

static PAREN_GROUP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(([^()]{4,300})\)").unwrap());

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"((?:19|20)\d{2})([a-z])?").unwrap());

static AUTHOR_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*(?:,|\band\b|&|\bet\s+al\.?)\s*").unwrap());

static SUPERSCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,3}(?:\s*[,\-–]\s*\d{1,3})*$").unwrap());

/// A marker found by the pattern pass, before geometry is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerMatch {
    /// Byte range in the scanned text covering the part this span stands for.
    pub range: Range<usize>,
    /// The whole marker as printed, e.g. "[3, 4]".
    pub raw_text: String,
    pub style: CitationStyle,
    pub confidence: f64,
    pub target: CitationTarget,
}

/// Expand a numeric range. Reversed or over-wide ranges expand to nothing.
pub fn expand_range(start: u32, end: u32, max_span: u32) -> Vec<u32> {
    if start > end || end - start + 1 > max_span {
        return Vec::new();
    }
    (start..=end).collect()
}

/// Scan text for numeric markers, one match per expanded integer.
pub fn scan_numeric(text: &str, max_range_span: u32) -> Vec<MarkerMatch> {
    let mut out = Vec::new();
    for caps in NUMERIC_CITE_RE.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let (list, square) = match (caps.get(1), caps.get(2)) {
            (Some(list), _) => (list, true),
            (None, Some(list)) => (list, false),
            (None, None) => continue,
        };
        if NON_CITATION_PREFIX_RE.is_match(&text[..whole.start()]) {
            continue;
        }
        // "(2019)", "(2019, 2020)" and "(1990-1995)" are years, not reference numbers.
        if !square && all_years(list.as_str()) {
            continue;
        }

        let confidence = numeric_confidence(list.as_str(), square);
        let raw_text = whole.as_str().to_string();
        let mut seen = Vec::new();
        for item in NUM_ITEM_RE.captures_iter(list.as_str()) {
            let Some(item_match) = item.get(0) else { continue };
            let range = list.start() + item_match.start()..list.start() + item_match.end();
            let start: u32 = item[1].parse().unwrap_or(0);
            let numbers = match item.get(2) {
                Some(end) => expand_range(start, end.as_str().parse().unwrap_or(0), max_range_span),
                None => vec![start],
            };
            for n in numbers.into_iter().filter(|n| *n > 0) {
                if seen.contains(&n) {
                    continue;
                }
                seen.push(n);
                out.push(MarkerMatch {
                    range: range.clone(),
                    raw_text: raw_text.clone(),
                    style: CitationStyle::Numeric,
                    confidence,
                    target: CitationTarget::Number(n),
                });
            }
        }
    }
    out
}

fn all_years(list: &str) -> bool {
    let mut ends = NUM_ITEM_RE
        .captures_iter(list)
        .flat_map(|item| [item.get(1), item.get(2)])
        .flatten()
        .map(|m| m.as_str().parse::<u32>().unwrap_or(0))
        .peekable();
    ends.peek().is_some() && ends.all(|n| (1900..2100).contains(&n))
}

/// Square brackets are the conventional numeric form; parentheses collide
/// with equation numbers. Lists with one consistent separator score higher.
fn numeric_confidence(list: &str, square: bool) -> f64 {
    let mut confidence: f64 = if square { 0.85 } else { 0.6 };
    let separators: Vec<&str> = SEPARATOR_RE
        .captures_iter(list)
        .map(|c| c.get(1).map_or("", |m| m.as_str()))
        .collect();
    if let Some(first) = separators.first() {
        if separators.iter().all(|s| s == first) {
            confidence += 0.05;
        } else {
            confidence -= 0.1;
        }
    }
    confidence.clamp(0.0, 0.95)
}

/// Numbers named by a marker text like "[2, 5-7]" or a bare "12".
pub fn numbers_in(text: &str, max_range_span: u32) -> Vec<u32> {
    let trimmed = text.trim();
    let list = trimmed
        .strip_prefix(['[', '('])
        .and_then(|t| t.strip_suffix([']', ')']))
        .unwrap_or(trimmed);
    if !NUM_LIST_ONLY_RE.is_match(list.trim()) {
        return Vec::new();
    }
    let mut numbers = Vec::new();
    for item in NUM_ITEM_RE.captures_iter(list) {
        let start: u32 = item[1].parse().unwrap_or(0);
        let expanded = match item.get(2) {
            Some(end) => expand_range(start, end.as_str().parse().unwrap_or(0), max_range_span),
            None => vec![start],
        };
        for n in expanded {
            if n > 0 && !numbers.contains(&n) {
                numbers.push(n);
            }
        }
    }
    numbers
}

static NUM_LIST_ONLY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"^{NUM_ITEM}(?:\s*[,;]\s*{NUM_ITEM})*$")).unwrap()
});

/// Scan text for author-year markers, one match per (author set, year).
pub fn scan_author_year(text: &str) -> Vec<MarkerMatch> {
    let mut out = Vec::new();
    let mut covered: Vec<Range<usize>> = Vec::new();

    for group in PAREN_GROUP_RE.captures_iter(text) {
        let (Some(whole), Some(inner)) = (group.get(0), group.get(1)) else {
            continue;
        };
        let items = split_with_offsets(inner.as_str(), ';');
        let parsed: Vec<_> = items
            .iter()
            .map(|(offset, item)| (inner.start() + offset, *item, parse_author_item(item)))
            .collect();
        let ok = parsed.iter().filter(|(_, _, p)| p.is_some()).count();
        if ok == 0 {
            continue;
        }
        let consistency_penalty = if ok < parsed.len() { 0.1 } else { 0.0 };
        let chain_bonus = if parsed.len() > 1 && ok == parsed.len() { 0.05 } else { 0.0 };

        for (offset, item, parse) in parsed {
            let Some(item_parse) = parse else { continue };
            let trimmed_start = offset + (item.len() - item.trim_start().len());
            let range = trimmed_start..offset + item.trim_end().len();
            let mut confidence: f64 = 0.75 + chain_bonus - consistency_penalty;
            if item_parse.comma_before_year {
                confidence += 0.1;
            }
            if item_parse.et_al || item_parse.surnames.len() > 1 {
                confidence += 0.05;
            }
            for (year, suffix) in &item_parse.years {
                out.push(MarkerMatch {
                    range: range.clone(),
                    raw_text: whole.as_str().to_string(),
                    style: CitationStyle::AuthorYear,
                    confidence: confidence.clamp(0.0, 0.95),
                    target: CitationTarget::AuthorYear(AuthorYearKey {
                        surnames: item_parse.surnames.clone(),
                        et_al: item_parse.et_al,
                        year: *year,
                        suffix: *suffix,
                    }),
                });
            }
        }
        covered.push(whole.range());
    }

    for caps in NARRATIVE_RE.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        if covered.iter().any(|r| r.start < whole.end() && whole.start() < r.end) {
            continue;
        }
        let authors = &caps[1];
        let (surnames, et_al) = parse_surnames(authors);
        if surnames.is_empty() {
            continue;
        }
        let confidence = if et_al || surnames.len() > 1 { 0.75 } else { 0.7 };
        for (year, suffix) in parse_years(&caps[2]) {
            out.push(MarkerMatch {
                range: whole.range(),
                raw_text: whole.as_str().to_string(),
                style: CitationStyle::AuthorYear,
                confidence,
                target: CitationTarget::AuthorYear(AuthorYearKey {
                    surnames: surnames.clone(),
                    et_al,
                    year,
                    suffix,
                }),
            });
        }
    }

    out.sort_by_key(|m| m.range.start);
    out
}

struct AuthorItem {
    surnames: Vec<String>,
    et_al: bool,
    comma_before_year: bool,
    years: Vec<(i32, Option<char>)>,
}

fn parse_author_item(item: &str) -> Option<AuthorItem> {
    let caps = AUTHOR_ITEM_RE.captures(item)?;
    let (surnames, et_al) = parse_surnames(&caps[1]);
    if surnames.is_empty() {
        return None;
    }
    Some(AuthorItem {
        surnames,
        et_al,
        comma_before_year: caps.get(2).is_some(),
        years: parse_years(&caps[3]),
    })
}

fn parse_surnames(authors: &str) -> (Vec<String>, bool) {
    static ET_AL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bet\s+al\b").unwrap());
    let et_al = ET_AL_RE.is_match(authors);
    let surnames = AUTHOR_SPLIT_RE
        .split(authors)
        .map(names::compact)
        .filter(|s| !s.is_empty())
        .collect();
    (surnames, et_al)
}

fn parse_years(text: &str) -> Vec<(i32, Option<char>)> {
    YEAR_RE
        .captures_iter(text)
        .filter_map(|c| {
            let year = c[1].parse().ok()?;
            let suffix = c.get(2).and_then(|m| m.as_str().chars().next());
            Some((year, suffix))
        })
        .collect()
}

fn split_with_offsets(text: &str, sep: char) -> Vec<(usize, &str)> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (idx, ch) in text.char_indices() {
        if ch == sep {
            parts.push((start, &text[start..idx]));
            start = idx + ch.len_utf8();
        }
    }
    parts.push((start, &text[start..]));
    parts
}

/// Style and targets of a marker's visible text, used for link annotations
/// whose rectangle covers only part of the citation.
pub fn classify_marker_text(text: &str, max_range_span: u32) -> (CitationStyle, Vec<CitationTarget>) {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return (CitationStyle::Unknown, Vec::new());
    }
    // natbib often links only the year or only the names.
    static BARE_YEAR_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(&format!(r"^\(?{YEAR}\)?$")).unwrap());
    if BARE_YEAR_RE.is_match(trimmed) {
        return (CitationStyle::AuthorYear, Vec::new());
    }
    let numbers = numbers_in(trimmed, max_range_span);
    if !numbers.is_empty() {
        return (
            CitationStyle::Numeric,
            numbers.into_iter().map(CitationTarget::Number).collect(),
        );
    }
    let author_year = scan_author_year(trimmed);
    if !author_year.is_empty() {
        return (
            CitationStyle::AuthorYear,
            author_year.into_iter().map(|m| m.target).collect(),
        );
    }
    if let Some(caps) = AUTHOR_ITEM_RE.captures(trimmed) {
        let (surnames, et_al) = parse_surnames(&caps[1]);
        let targets = parse_years(&caps[3])
            .into_iter()
            .map(|(year, suffix)| {
                CitationTarget::AuthorYear(AuthorYearKey {
                    surnames: surnames.clone(),
                    et_al,
                    year,
                    suffix,
                })
            })
            .collect();
        return (CitationStyle::AuthorYear, targets);
    }
    static NAME_ONLY_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(&format!(r"^{}$", authors_pattern())).unwrap());
    if NAME_ONLY_RE.is_match(trimmed) {
        return (CitationStyle::AuthorYear, Vec::new());
    }
    (CitationStyle::Unknown, Vec::new())
}

/// A superscript numeric marker found on a line.
#[derive(Debug, Clone, PartialEq)]
pub struct SuperscriptMarker {
    pub bbox: BBox,
    pub raw_text: String,
    pub number: u32,
    pub confidence: f64,
}

/// Superscript digit groups following a body word ("models¹²", "shown³⁻⁵").
/// Groups after a digit are treated as exponents and skipped.
pub fn scan_superscripts(lines: &[&Line], max_range_span: u32) -> Vec<SuperscriptMarker> {
    let mut out = Vec::new();
    for line in lines {
        for (word_idx, word) in line.words.iter().enumerate().skip(1) {
            if !word.is_superscript || !SUPERSCRIPT_RE.is_match(&word.text) {
                continue;
            }
            let prev = &line.words[word_idx - 1];
            if prev.is_superscript
                || prev.text.ends_with(|c: char| c.is_ascii_digit() || c == '^')
            {
                continue;
            }
            for number in numbers_in(&word.text, max_range_span) {
                out.push(SuperscriptMarker {
                    bbox: word.bbox(),
                    raw_text: word.text.clone(),
                    number,
                    confidence: 0.6,
                });
            }
        }
    }
    out
}
