use crate::types::Line;

/// Zone classification for a line of page text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineZone {
    Header,
    PageNumber,
    ReferenceHeading,
    Body,
}

/// Classify a line by its position on the page and its text.
pub fn classify_line(line: &Line, page_height: f32) -> LineZone {
    let text = line.text();
    if is_reference_heading_line(&text) {
        return LineZone::ReferenceHeading;
    }
    if page_height <= 0.0 {
        return LineZone::Body;
    }
    let relative_y = line.y / page_height;

    // Running header: top ~5%
    if relative_y > 0.95 {
        return LineZone::Header;
    }
    // Page number: bottom ~5%, only digits
    if relative_y < 0.05 && is_page_number(&text) {
        return LineZone::PageNumber;
    }
    LineZone::Body
}

fn is_page_number(text: &str) -> bool {
    let trimmed = text.trim();
    !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit() || c == '-' || c == ' ')
}

/// Index of the last reference heading line on a page, if any.
pub fn find_reference_heading(lines: &[Line]) -> Option<usize> {
    lines
        .iter()
        .rposition(|line| is_reference_heading_line(&line.text()))
}

/// Check if a single line's text is a reference heading.
pub fn is_reference_heading_line(line_text: &str) -> bool {
    let trimmed = line_text.trim().to_uppercase();
    is_heading_text(&trimmed)
}

/// Detect dot-leader patterns used in Tables of Contents, e.g.
/// "References . . . . ." or "References.....".
fn has_dot_leaders(text: &str) -> bool {
    if text.contains("...") || text.contains("\u{2026}\u{2026}\u{2026}") {
        return true;
    }
    let chars: Vec<char> = text.chars().collect();
    let mut dot_run = 0usize;
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '.' || chars[i] == '\u{2026}' {
            dot_run += 1;
            if dot_run >= 3 {
                return true;
            }
        } else if !(chars[i] == ' '
            && i + 1 < chars.len()
            && (chars[i + 1] == '.' || chars[i + 1] == '\u{2026}'))
        {
            dot_run = 0;
        }
        i += 1;
    }
    false
}

const HEADINGS: [&str; 6] = [
    "REFERENCES",
    "BIBLIOGRAPHY",
    "REFERENCES AND NOTES",
    "LITERATURE CITED",
    "WORKS CITED",
    "CITED LITERATURE",
];

fn is_heading_text(text: &str) -> bool {
    if has_dot_leaders(text) {
        return false;
    }
    let text = text.trim_end_matches([':', '.']).trim();
    if HEADINGS.contains(&text) {
        return true;
    }
    if text.len() >= 30 {
        return false;
    }
    // Section-numbered headings: "IX. REFERENCES", "5 REFERENCES"
    if let Some((prefix, rest)) = text.split_once(' ') {
        let rest = rest.trim();
        let numbered = !prefix.is_empty()
            && prefix
                .trim_end_matches('.')
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, 'I' | 'V' | 'X' | 'L'));
        if numbered && HEADINGS.contains(&rest) {
            return prefix.trim_end_matches('.').len() <= 4;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::group_page;
    use crate::pdf::{TextRun, typeset_page};

    #[test]
    fn recognizes_common_headings() {
        assert!(is_reference_heading_line("References"));
        assert!(is_reference_heading_line("REFERENCES:"));
        assert!(is_reference_heading_line("7. References"));
        assert!(is_reference_heading_line("IX. REFERENCES"));
        assert!(is_reference_heading_line("Bibliography"));
    }

    #[test]
    fn rejects_toc_entries_and_prose() {
        assert!(!is_reference_heading_line("References . . . . . . 12"));
        assert!(!is_reference_heading_line("References......"));
        assert!(!is_reference_heading_line("References 835"));
        assert!(!is_reference_heading_line("We list references to prior work"));
    }

    #[test]
    fn classifies_header_and_page_number() {
        let page = typeset_page(
            1,
            &[
                TextRun::new(72.0, 770.0, "Journal of Things, Vol. 3"),
                TextRun::new(72.0, 400.0, "Body text sits here."),
                TextRun::new(300.0, 20.0, "12"),
            ],
            vec![],
        );
        let lines = group_page(&page.chars);
        let zones: Vec<LineZone> = lines.iter().map(|l| classify_line(l, 792.0)).collect();
        assert_eq!(zones, vec![LineZone::Header, LineZone::Body, LineZone::PageNumber]);
    }

    #[test]
    fn finds_last_heading_on_page() {
        let page = typeset_page(
            9,
            &[
                TextRun::new(72.0, 700.0, "conclusion text"),
                TextRun::new(72.0, 600.0, "References"),
                TextRun::new(72.0, 580.0, "[1] A. Author. 2001."),
            ],
            vec![],
        );
        let lines = group_page(&page.chars);
        assert_eq!(find_reference_heading(&lines), Some(1));
    }
}
