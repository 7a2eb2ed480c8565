//! Annotation pass: internal link annotations that land in the bibliography.

use std::collections::HashMap;

use tracing::debug;

use crate::config::DetectorConfig;
use crate::detector::ScannedPage;
use crate::layout::text_in_rect;
use crate::markers::{REFERENCE_ENTRY_RE, classify_marker_text};
use crate::pdf::LinkAnnotation;
use crate::types::{CitationTarget, DetectedSpan, Provenance};

/// How far below a destination point the entry line may start.
const DEST_LINE_DROP: f32 = 24.0;

/// Spans for every link annotation that plausibly targets a bibliography
/// entry. Destinations are checked against the whole document, so this
/// runs after all pages are scanned.
pub fn scan_annotations(
    pages: &[ScannedPage],
    bibliography_start: Option<u32>,
    config: &DetectorConfig,
) -> Vec<DetectedSpan> {
    let by_num: HashMap<u32, &ScannedPage> = pages.iter().map(|p| (p.page_num, p)).collect();
    let mut spans = Vec::new();

    for page in pages {
        for link in &page.links {
            if !targets_bibliography(link, bibliography_start, &by_num) {
                continue;
            }
            let visible = text_in_rect(&page.lines, &link.rect);
            let (style, mut targets) = classify_marker_text(&visible, config.max_range_span);
            if targets.is_empty() {
                targets.push(CitationTarget::Unresolved);
            }
            // One span per named target, all sharing the link's box and destination.
            for target in targets {
                spans.push(DetectedSpan {
                    page_num: page.page_num,
                    bbox: link.rect,
                    raw_text: visible.clone(),
                    style,
                    provenance: Provenance::Annotation,
                    confidence: config.annotation_confidence,
                    dest_page: link.dest_page,
                    dest_y: link.dest_y,
                    target,
                });
            }
        }
    }
    debug!(count = spans.len(), "annotation pass finished");
    spans
}

/// A link counts when it points at or past the bibliography start page or,
/// with no start page known, when the destination line reads like an entry.
fn targets_bibliography(
    link: &LinkAnnotation,
    bibliography_start: Option<u32>,
    pages: &HashMap<u32, &ScannedPage>,
) -> bool {
    let Some(dest_page) = link.dest_page else {
        return false;
    };
    if let Some(start) = bibliography_start {
        return dest_page >= start;
    }
    let (Some(dest), Some(y)) = (pages.get(&dest_page), link.dest_y) else {
        return false;
    };
    dest.text
        .line_below(y, DEST_LINE_DROP)
        .is_some_and(|line| REFERENCE_ENTRY_RE.is_match(line))
}
