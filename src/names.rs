//! Author and title normalization shared by the linker strategies.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Common surname prefixes (case-insensitive).
static SURNAME_PREFIXES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "van", "von", "de", "der", "den", "del", "della", "di", "da", "du", "la", "le", "al",
        "el", "ben", "ibn", "mac", "mc",
    ]
    .into_iter()
    .collect()
});

/// Name suffixes to strip.
static NAME_SUFFIXES: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["jr", "sr", "ii", "iii", "iv"].into_iter().collect());

/// NFKD-fold to lowercase ASCII, keeping letters, digits and single spaces.
pub fn fold(text: &str) -> String {
    let ascii: String = text
        .nfkd()
        .filter(|c| c.is_ascii())
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect();
    ascii.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Folded form without spaces, used as a comparison key.
pub fn compact(text: &str) -> String {
    fold(text).replace(' ', "")
}

/// Surname of an author string in any of the usual layouts:
/// "Smith, J.", "John Smith", "Smith J", "Ludwig van Beethoven".
pub fn surname_of(author: &str) -> String {
    let author = author.trim();
    if author.is_empty() {
        return String::new();
    }

    if let Some((surname, _)) = author.split_once(',') {
        return compact(surname);
    }

    let mut parts: Vec<&str> = author.split_whitespace().collect();
    while parts.len() >= 2
        && parts
            .last()
            .is_some_and(|p| NAME_SUFFIXES.contains(p.to_lowercase().trim_end_matches('.')))
    {
        parts.pop();
    }

    // Springer "Surname Initial" layout: trailing 1-2 uppercase letters
    if parts.len() >= 2 {
        let last = parts[parts.len() - 1].trim_end_matches('.');
        if last.len() <= 2 && !last.is_empty() && last.chars().all(|c| c.is_uppercase()) {
            return compact(&parts[..parts.len() - 1].join(" "));
        }
    }

    let mut start = parts.len().saturating_sub(1);
    while start > 0 && SURNAME_PREFIXES.contains(parts[start - 1].to_lowercase().as_str()) {
        start -= 1;
    }
    compact(&parts[start..].join(" "))
}

/// Similarity of two surnames in `[0, 1]`.
///
/// Compound surnames match their final component ("vanderberg" vs "berg")
/// at 0.9.
pub fn surname_similarity(a: &str, b: &str) -> f64 {
    let a = compact(a);
    let b = compact(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let fuzzy = rapidfuzz::fuzz::ratio(a.chars(), b.chars());
    let (shorter, longer) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    if shorter.len() >= 3 && longer.ends_with(shorter.as_str()) {
        return fuzzy.max(0.9);
    }
    fuzzy
}

/// Normalized title similarity in `[0, 1]`.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a = compact(a);
    let b = compact(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    rapidfuzz::fuzz::ratio(a.chars(), b.chars())
}

/// Similarity of two short marker texts such as "[12]" and "12".
pub fn marker_similarity(a: &str, b: &str) -> f64 {
    let a = fold(a);
    let b = fold(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    rapidfuzz::fuzz::ratio(a.chars(), b.chars())
}

/// Normalize a DOI for equality checks: lowercase, no resolver prefix.
pub fn normalize_doi(doi: &str) -> String {
    static PREFIX_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)^(?:https?://(?:dx\.)?doi\.org/|doi:\s*)").unwrap());
    PREFIX_RE
        .replace(doi.trim(), "")
        .trim_end_matches(['.', ',', ';'])
        .to_lowercase()
}

/// Surnames at the start of a raw bibliography entry, for references that
/// arrive without parsed authors.
///
/// Reads up to the first year or the first sentence break after the
/// author list and keeps the surname of each comma/"and"-separated name.
pub fn leading_surnames(raw_text: &str) -> Vec<String> {
    static MARKER_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^\s*(?:\[[^\]]{1,12}\]|\(\d{1,4}\)|\d{1,3}[.\)])\s*").unwrap());
    static END_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r#"(?:\(?(?:19|20)\d{2}[a-z]?\)?|[“"]|\p{L}{2}\.\s+\p{Lu})"#).unwrap()
    });
    static SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*(?:,|;|\band\b|&)\s*").unwrap());

    let body = MARKER_RE.replace(raw_text, "");
    // A sentence break ("Stone. Graph") ends the list at its period; a
    // period after a lone initial ("J. Smith") does not match.
    let head = match END_RE.find(&body) {
        Some(m) if m.as_str().starts_with(char::is_alphabetic) => {
            let dot = m.as_str().find('.').unwrap_or(0);
            &body[..m.start() + dot]
        }
        Some(m) => &body[..m.start()],
        None => &body[..floor_char_boundary(&body, 120)],
    };

    let pieces: Vec<&str> = SPLIT_RE
        .split(head)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    let mut surnames = Vec::new();
    let mut i = 0;
    while i < pieces.len() {
        let piece = pieces[i].trim_end_matches('.');
        if is_initials(piece) || piece.eq_ignore_ascii_case("et al") {
            i += 1;
            continue;
        }
        // "Smith, J." arrives as ["Smith", "J."]: the piece is the surname.
        let surname = if pieces.get(i + 1).is_some_and(|next| is_initials(next.trim_end_matches('.')))
            && !piece.contains(' ')
        {
            compact(piece)
        } else {
            surname_of(piece)
        };
        if !surname.is_empty() && surname.chars().any(|c| c.is_ascii_alphabetic()) {
            surnames.push(surname);
        }
        i += 1;
    }
    surnames
}

fn floor_char_boundary(text: &str, max: usize) -> usize {
    let mut idx = max.min(text.len());
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn is_initials(piece: &str) -> bool {
    let tokens: Vec<&str> = piece.split([' ', '.', '-']).filter(|t| !t.is_empty()).collect();
    !tokens.is_empty()
        && tokens
            .iter()
            .all(|t| t.chars().count() == 1 && t.chars().all(char::is_uppercase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_strips_accents_and_punctuation() {
        assert_eq!(fold("Müller-Lüdenscheidt, Ä."), "muller ludenscheidt a");
    }

    #[test]
    fn surname_layouts() {
        assert_eq!(surname_of("Smith, J."), "smith");
        assert_eq!(surname_of("John Smith"), "smith");
        assert_eq!(surname_of("Smith J"), "smith");
        assert_eq!(surname_of("Ludwig van Beethoven"), "vanbeethoven");
        assert_eq!(surname_of("Martin Luther King Jr."), "king");
        assert_eq!(surname_of(""), "");
    }

    #[test]
    fn surname_similarity_tolerates_diacritics_and_prefixes() {
        assert_eq!(surname_similarity("Gödel", "Godel"), 1.0);
        assert!(surname_similarity("vanbeethoven", "Beethoven") >= 0.9);
        assert!(surname_similarity("Smith", "Jones") < 0.5);
    }

    #[test]
    fn doi_normalization() {
        assert_eq!(normalize_doi("https://doi.org/10.1145/ABC.123."), "10.1145/abc.123");
        assert_eq!(normalize_doi("doi: 10.1000/X"), "10.1000/x");
    }

    #[test]
    fn leading_surnames_from_raw_entry() {
        assert_eq!(
            leading_surnames("[4] Smith, J., Jones, A. and Brown, K. 2019. A study of things."),
            vec!["smith", "jones", "brown"]
        );
        assert_eq!(
            leading_surnames("Alice Walker and Bob Stone. Graph Things in practice. 2020."),
            vec!["walker", "stone"]
        );
    }

    #[test]
    fn title_similarity_ignores_case_and_punctuation() {
        assert_eq!(title_similarity("Attention Is All You Need", "attention is all you need."), 1.0);
        assert!(title_similarity("Attention is all you need", "Graph neural networks") < 0.6);
    }
}
