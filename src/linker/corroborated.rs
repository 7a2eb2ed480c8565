use super::{Candidate, LinkContext, LinkStrategy};
use crate::names::{marker_similarity, normalize_doi, title_similarity};
use crate::signal::{CorroboratingSignal, SignalReference, SignalSpan};
use crate::types::{DetectedSpan, LinkMethod};

/// Marker texts this similar count as the same occurrence even without boxes.
const TEXT_MATCH_MIN: f64 = 0.5;

/// Borrows the reference an outside parser chose for the nearest matching
/// occurrence, after mapping it onto the local bibliography.
pub struct Corroborated;

impl LinkStrategy for Corroborated {
    fn method(&self) -> LinkMethod {
        LinkMethod::Corroborated
    }

    fn candidates(&self, span: &DetectedSpan, ctx: &LinkContext<'_>) -> Vec<Candidate> {
        let Some(signal) = ctx.signal else {
            return Vec::new();
        };
        let Some((nearest, text_sim)) = nearest_signal_span(span, signal) else {
            return Vec::new();
        };
        let Some(theirs) = signal.reference_of(nearest) else {
            return Vec::new();
        };
        let Some(reference) = reconcile(theirs, ctx) else {
            return Vec::new();
        };
        let (lo, hi) = (ctx.config.corroborated_min, ctx.config.corroborated_max);
        vec![Candidate { reference, confidence: lo + (hi - lo) * text_sim }]
    }
}

/// Closest signal span on the same page whose box overlaps the span or
/// whose text reads alike. Returns it with the text similarity.
fn nearest_signal_span<'s>(
    span: &DetectedSpan,
    signal: &'s CorroboratingSignal,
) -> Option<(&'s SignalSpan, f64)> {
    signal
        .spans_on_page(span.page_num)
        .filter_map(|theirs| {
            let sim = marker_similarity(&span.raw_text, &theirs.text);
            let overlaps = theirs.bbox.is_some_and(|b| b.intersection(&span.bbox).is_some());
            if !overlaps && sim < TEXT_MATCH_MIN {
                return None;
            }
            let distance = theirs.bbox.map_or(f32::MAX, |b| b.center_distance(&span.bbox));
            Some((theirs, sim, distance))
        })
        .min_by(|a, b| a.2.total_cmp(&b.2).then_with(|| b.1.total_cmp(&a.1)))
        .map(|(theirs, sim, _)| (theirs, sim))
}

/// Local reference index for a third-party reference: by number when the
/// titles do not disagree, then by DOI, then by title.
fn reconcile(theirs: &SignalReference, ctx: &LinkContext<'_>) -> Option<usize> {
    let title_min = ctx.config.corroborated_title_min;
    let their_title = theirs.title.as_deref().filter(|t| !t.trim().is_empty());

    if let Some(number) = theirs.number {
        let agreeing = ctx.numbered(number).find(|&idx| {
            match (their_title, ctx.references[idx].title.as_deref()) {
                (Some(a), Some(b)) => title_similarity(a, b) >= title_min,
                _ => true,
            }
        });
        if agreeing.is_some() {
            return agreeing;
        }
    }

    if let Some(doi) = theirs.doi.as_deref().map(normalize_doi).filter(|d| !d.is_empty()) {
        let by_doi = ctx.references.iter().position(|r| {
            r.doi.as_deref().is_some_and(|ours| normalize_doi(ours) == doi)
        });
        if by_doi.is_some() {
            return by_doi;
        }
    }

    let their_title = their_title.or(theirs.raw_text.as_deref())?;
    ctx.references
        .iter()
        .enumerate()
        .map(|(idx, r)| {
            let ours = r.title.clone().unwrap_or_else(|| r.search_query());
            (idx, title_similarity(their_title, &ours))
        })
        .filter(|(_, sim)| *sim >= title_min)
        .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(idx, _)| idx)
}
