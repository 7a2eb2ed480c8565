use super::{Candidate, LinkContext, LinkStrategy};
use crate::markers::numbers_in;
use crate::types::{DetectedSpan, LinkMethod, Provenance};

/// Destination points often sit a little above the entry's first line.
const REGION_SLACK: f32 = 6.0;

/// Follows an annotation's destination to the bibliography entry under it.
pub struct AnnotationDestination;

impl LinkStrategy for AnnotationDestination {
    fn method(&self) -> LinkMethod {
        LinkMethod::AnnotationDest
    }

    fn candidates(&self, span: &DetectedSpan, ctx: &LinkContext<'_>) -> Vec<Candidate> {
        if span.provenance != Provenance::Annotation {
            return Vec::new();
        }
        let Some(dest_page) = span.dest_page else {
            return Vec::new();
        };
        if ctx.bibliography_start_page.is_some_and(|start| dest_page < start) {
            return Vec::new();
        }
        let floor = ctx.config.annotation_min_confidence;
        let on_page = || {
            ctx.references
                .iter()
                .enumerate()
                .filter(move |(_, r)| r.page_num == Some(dest_page))
        };

        // A link over "[2, 3]" lands on one entry; each expanded span keeps
        // only the entry carrying its own number.
        let shared_link = numbers_in(&span.raw_text, u32::MAX).len() > 1;
        let own_number = span.target.number();

        let mut out = Vec::new();
        if let Some(y) = span.dest_y {
            for (idx, reference) in on_page() {
                if shared_link && own_number.is_some_and(|n| reference.number != n) {
                    continue;
                }
                let Some((lo, hi)) = reference.region() else { continue };
                if y < lo - REGION_SLACK || y > hi + REGION_SLACK {
                    continue;
                }
                let centre = (lo + hi) / 2.0;
                let reach = (hi - lo) / 2.0 + REGION_SLACK;
                let closeness = (1.0 - (y - centre).abs() / reach).clamp(0.0, 1.0);
                out.push(Candidate {
                    reference: idx,
                    confidence: floor + (1.0 - floor) * f64::from(closeness),
                });
            }
        }

        // Page known but no region hit: a number that agrees still counts.
        if out.is_empty()
            && let Some(number) = own_number
        {
            out.extend(
                on_page()
                    .filter(|(_, r)| r.number == number)
                    .map(|(idx, _)| Candidate { reference: idx, confidence: floor }),
            );
        }
        out
    }
}
