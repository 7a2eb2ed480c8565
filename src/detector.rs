//! Two-pass citation detection over a whole document.

use std::ops::ControlFlow;
use std::path::Path;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::annotations::scan_annotations;
use crate::config::DetectorConfig;
use crate::error::ExtractError;
use crate::layout::{PageText, group_page};
use crate::markers::{
    REFERENCE_ENTRY_RE, scan_author_year, scan_numeric, scan_superscripts,
};
use crate::pdf::{LinkAnnotation, PageContent, PdfBackend};
use crate::types::{
    CitationStyle, CitationTarget, DetectedSpan, Line, PageWarning, Provenance,
};
use crate::zones::{LineZone, classify_line, find_reference_heading};

/// A page reduced to lines, flattened text and link annotations.
#[derive(Debug, Clone)]
pub struct ScannedPage {
    pub page_num: u32,
    pub height: f32,
    pub lines: Vec<Line>,
    pub text: PageText,
    pub links: Vec<LinkAnnotation>,
}

impl ScannedPage {
    pub fn new(content: PageContent) -> Self {
        let lines = group_page(&content.chars);
        let text = PageText::from_lines(&lines);
        Self {
            page_num: content.chars.page_num,
            height: content.chars.height,
            lines,
            text,
            links: content.links,
        }
    }
}

/// Where the bibliography body begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BibliographyStart {
    page: u32,
    /// First line index on `page` that belongs to the bibliography.
    first_line: Option<usize>,
}

/// Detector output for one document.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    /// Sorted by page, then top to bottom, then left to right.
    pub spans: Vec<DetectedSpan>,
    pub warnings: Vec<PageWarning>,
    pub page_count: u32,
    pub bibliography_start_page: Option<u32>,
}

impl Detection {
    pub fn annotation_count(&self) -> usize {
        self.spans
            .iter()
            .filter(|s| s.provenance == Provenance::Annotation)
            .count()
    }
}

pub struct CitationDetector {
    config: DetectorConfig,
}

impl CitationDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Read every page through `backend` and detect citation spans.
    ///
    /// Unreadable pages become warnings. `bibliography_start` overrides the
    /// configured start page, which overrides the inferred one.
    pub fn detect(
        &self,
        backend: &dyn PdfBackend,
        path: &Path,
        bibliography_start: Option<u32>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Detection, ExtractError> {
        let mut pages = Vec::new();
        let mut warnings = Vec::new();
        let mut cancelled = false;

        let page_count = backend.visit_pages(path, &mut |result| {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                cancelled = true;
                return ControlFlow::Break(());
            }
            match result {
                Ok(content) => pages.push(ScannedPage::new(content)),
                Err(failure) => {
                    warn!(page = failure.page_num, error = %failure.message, "skipping unreadable page");
                    warnings.push(PageWarning {
                        page_num: failure.page_num,
                        message: failure.message,
                    });
                }
            }
            ControlFlow::Continue(())
        })?;

        if cancelled {
            info!(path = %path.display(), "detection cancelled");
            return Err(ExtractError::Cancelled);
        }
        Ok(self.detect_scanned(pages, warnings, page_count, bibliography_start))
    }

    /// Detection over pages already laid out.
    pub fn detect_scanned(
        &self,
        pages: Vec<ScannedPage>,
        warnings: Vec<PageWarning>,
        page_count: u32,
        bibliography_start: Option<u32>,
    ) -> Detection {
        let start = self.bibliography_start(
            &pages,
            bibliography_start.or(self.config.bibliography_start_page),
        );
        debug!(?start, "bibliography start");

        let mut spans = scan_annotations(&pages, start.map(|s| s.page), &self.config);
        let annotation_count = spans.len();

        let mut pattern = Vec::new();
        for page in &pages {
            pattern.extend(self.pattern_spans(page, start));
        }
        let pattern_total = pattern.len();
        pattern.retain(|p| !self.shadowed_by_annotation(p, &spans));
        debug!(dropped = pattern_total - pattern.len(), "pattern spans covered by annotations");

        spans.extend(pattern);
        sort_reading_order(&mut spans);

        info!(
            spans = spans.len(),
            annotations = annotation_count,
            warnings = warnings.len(),
            "detection finished"
        );
        Detection {
            spans,
            warnings,
            page_count,
            bibliography_start_page: start.map(|s| s.page),
        }
    }

    fn bibliography_start(
        &self,
        pages: &[ScannedPage],
        explicit: Option<u32>,
    ) -> Option<BibliographyStart> {
        if let Some(page) = explicit {
            let first_line = pages
                .iter()
                .find(|p| p.page_num == page)
                .and_then(|p| first_bibliography_line(&p.lines));
            return Some(BibliographyStart { page, first_line });
        }
        pages.iter().rev().find_map(|p| {
            find_reference_heading(&p.lines).map(|idx| BibliographyStart {
                page: p.page_num,
                first_line: Some(idx),
            })
        })
    }

    fn in_bibliography(&self, page_num: u32, line_idx: usize, start: Option<BibliographyStart>) -> bool {
        let Some(start) = start.filter(|_| self.config.skip_bibliography_body) else {
            return false;
        };
        match page_num.cmp(&start.page) {
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => start.first_line.is_some_and(|first| line_idx >= first),
        }
    }

    fn pattern_spans(&self, page: &ScannedPage, start: Option<BibliographyStart>) -> Vec<DetectedSpan> {
        let body: Vec<&Line> = page
            .lines
            .iter()
            .enumerate()
            .filter(|(idx, line)| {
                classify_line(line, page.height) == LineZone::Body
                    && !self.in_bibliography(page.page_num, *idx, start)
            })
            .map(|(_, line)| line)
            .collect();
        if body.is_empty() {
            return Vec::new();
        }

        let text = PageText::from_lines(body.iter().copied());
        let author_year = scan_author_year(&text.text);
        let mut matches = scan_numeric(&text.text, self.config.max_range_span);
        // Digits inside an author-year marker are its years.
        matches.retain(|m| {
            !author_year
                .iter()
                .any(|a| a.range.start < m.range.end && m.range.start < a.range.end)
        });
        matches.extend(author_year);

        let mut spans: Vec<DetectedSpan> = matches
            .into_iter()
            .filter_map(|m| {
                let bbox = text.bbox_for(m.range.clone())?;
                Some(DetectedSpan {
                    page_num: page.page_num,
                    bbox,
                    raw_text: m.raw_text,
                    style: m.style,
                    provenance: Provenance::Pattern,
                    confidence: m.confidence,
                    dest_page: None,
                    dest_y: None,
                    target: m.target,
                })
            })
            .collect();

        if self.config.superscript_markers {
            spans.extend(scan_superscripts(&body, self.config.max_range_span).into_iter().map(
                |m| DetectedSpan {
                    page_num: page.page_num,
                    bbox: m.bbox,
                    raw_text: m.raw_text,
                    style: CitationStyle::Numeric,
                    provenance: Provenance::Pattern,
                    confidence: m.confidence,
                    dest_page: None,
                    dest_y: None,
                    target: CitationTarget::Number(m.number),
                },
            ));
        }
        spans
    }

    /// A pattern span is dropped when an annotation span on the same page
    /// overlaps it and names the same target.
    fn shadowed_by_annotation(&self, pattern: &DetectedSpan, annotations: &[DetectedSpan]) -> bool {
        annotations.iter().any(|a| {
            a.page_num == pattern.page_num
                && a.bbox.overlap_ratio(&pattern.bbox) > self.config.dedup_overlap
                && self.same_target(a, pattern)
        })
    }

    fn same_target(&self, annotation: &DetectedSpan, pattern: &DetectedSpan) -> bool {
        match (&annotation.target, &pattern.target) {
            (CitationTarget::Number(a), CitationTarget::Number(p)) => a == p,
            (CitationTarget::AuthorYear(a), CitationTarget::AuthorYear(p)) => {
                a.year == p.year && a.suffix == p.suffix
            }
            (CitationTarget::Number(_), CitationTarget::AuthorYear(_))
            | (CitationTarget::AuthorYear(_), CitationTarget::Number(_)) => false,
            _ => true,
        }
    }
}

/// First line of the bibliography on its start page: the heading if there
/// is one, otherwise the first line that opens like an entry.
fn first_bibliography_line(lines: &[Line]) -> Option<usize> {
    find_reference_heading(lines)
        .or_else(|| lines.iter().position(|l| REFERENCE_ENTRY_RE.is_match(&l.text())))
}

/// Page, then top to bottom in 4pt bands, then left to right. Stable, so
/// spans from one marker keep their expansion order.
fn sort_reading_order(spans: &mut [DetectedSpan]) {
    // Band on the vertical centre so raised markers stay on their line.
    let band = |s: &DetectedSpan| ((s.bbox.y1 + s.bbox.y2) / 8.0).floor() as i64;
    spans.sort_by(|a, b| {
        a.page_num
            .cmp(&b.page_num)
            .then_with(|| band(b).cmp(&band(a)))
            .then_with(|| a.bbox.x1.total_cmp(&b.bbox.x1))
    });
}
