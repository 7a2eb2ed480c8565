//! Span → reference linking as an ordered cascade of strategies.
//!
//! Each strategy proposes candidate references with a confidence; the first
//! strategy with any candidate wins the span. Ties go to the reference
//! numbered closest to what neighbouring spans on the same page already
//! linked to, then to the lowest reference number.

mod annotation_dest;
mod author_year;
mod corroborated;
mod numeric;

use std::collections::HashMap;

use tracing::{debug, info, trace};

pub use annotation_dest::AnnotationDestination;
pub use author_year::AuthorYearFuzzy;
pub use corroborated::Corroborated;
pub use numeric::NumericMatch;

use crate::config::LinkerConfig;
use crate::signal::CorroboratingSignal;
use crate::types::{DetectedSpan, LinkDraft, LinkMethod, Reference, ReferenceId};

/// Everything a strategy may consult besides the span itself.
#[derive(Debug, Clone, Copy)]
pub struct LinkContext<'a> {
    pub references: &'a [Reference],
    pub bibliography_start_page: Option<u32>,
    pub signal: Option<&'a CorroboratingSignal>,
    pub config: &'a LinkerConfig,
}

impl<'a> LinkContext<'a> {
    pub fn new(references: &'a [Reference], config: &'a LinkerConfig) -> Self {
        Self { references, bibliography_start_page: None, signal: None, config }
    }

    pub fn with_bibliography_start(mut self, page: Option<u32>) -> Self {
        self.bibliography_start_page = page;
        self
    }

    pub fn with_signal(mut self, signal: Option<&'a CorroboratingSignal>) -> Self {
        self.signal = signal;
        self
    }

    /// Indices of references carrying `number`.
    pub fn numbered(&self, number: u32) -> impl Iterator<Item = usize> + '_ {
        self.references
            .iter()
            .enumerate()
            .filter(move |(_, r)| r.number == number)
            .map(|(idx, _)| idx)
    }
}

/// A reference a strategy would link a span to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Index into [`LinkContext::references`].
    pub reference: usize,
    pub confidence: f64,
}

/// A chosen link, before persistence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkResult {
    pub reference: usize,
    pub reference_id: ReferenceId,
    pub method: LinkMethod,
    pub confidence: f64,
}

pub trait LinkStrategy: Send + Sync {
    fn method(&self) -> LinkMethod;

    /// Every reference this strategy accepts for `span`. Empty means the
    /// cascade moves on.
    fn candidates(&self, span: &DetectedSpan, ctx: &LinkContext<'_>) -> Vec<Candidate>;

    /// Best candidate, ties broken by `neighbours` then reference number.
    fn try_link(
        &self,
        span: &DetectedSpan,
        ctx: &LinkContext<'_>,
        neighbours: &Neighbours,
    ) -> Option<LinkResult> {
        let best = choose(self.candidates(span, ctx), span.page_num, ctx.references, neighbours)?;
        Some(LinkResult {
            reference: best.reference,
            reference_id: ctx.references[best.reference].id,
            method: self.method(),
            confidence: best.confidence.clamp(0.0, 1.0),
        })
    }
}

/// Result of linking one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Linking {
    pub drafts: Vec<LinkDraft>,
    pub unlinked: usize,
}

pub struct Linker {
    strategies: Vec<Box<dyn LinkStrategy>>,
}

impl Linker {
    pub fn new(strategies: Vec<Box<dyn LinkStrategy>>) -> Self {
        Self { strategies }
    }

    /// The four-step cascade: annotation destination, numeric, corroborated,
    /// author-year.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(AnnotationDestination),
            Box::new(NumericMatch),
            Box::new(Corroborated),
            Box::new(AuthorYearFuzzy),
        ])
    }

    /// Link spans in order. Each span gets at most one link.
    pub fn link(&self, spans: &[DetectedSpan], ctx: &LinkContext<'_>) -> Linking {
        let mut linking = Linking::default();
        let mut neighbours = Neighbours::default();

        for (span_index, span) in spans.iter().enumerate() {
            let chosen = self
                .strategies
                .iter()
                .find_map(|strategy| strategy.try_link(span, ctx, &neighbours));
            match chosen {
                Some(result) => {
                    trace!(page = span.page_num, method = %result.method, reference = result.reference_id, "span linked");
                    neighbours.record(span.page_num, ctx.references[result.reference].number);
                    linking.drafts.push(LinkDraft {
                        span_index,
                        reference_id: result.reference_id,
                        method: result.method,
                        confidence: result.confidence,
                    });
                }
                None => {
                    debug!(page = span.page_num, text = %span.raw_text, "span left unlinked");
                    linking.unlinked += 1;
                }
            }
        }

        info!(
            links = linking.drafts.len(),
            unlinked = linking.unlinked,
            "linking finished"
        );
        linking
    }
}

impl Default for Linker {
    fn default() -> Self {
        Self::standard()
    }
}

const CONFIDENCE_EPSILON: f64 = 1e-9;

/// Reference numbers already linked on each page.
#[derive(Debug, Default)]
pub struct Neighbours {
    linked: HashMap<u32, Vec<u32>>,
}

impl Neighbours {
    pub fn record(&mut self, page: u32, number: u32) {
        self.linked.entry(page).or_default().push(number);
    }

    fn distance(&self, page: u32, number: u32) -> u32 {
        self.linked
            .get(&page)
            .and_then(|numbers| numbers.iter().map(|n| n.abs_diff(number)).min())
            .unwrap_or(u32::MAX)
    }
}

fn choose(
    candidates: Vec<Candidate>,
    page: u32,
    references: &[Reference],
    neighbours: &Neighbours,
) -> Option<Candidate> {
    let tie_key = |c: &Candidate| {
        let number = references[c.reference].number;
        (neighbours.distance(page, number), number, c.reference)
    };
    let mut iter = candidates
        .into_iter()
        .filter(|c| c.reference < references.len() && c.confidence > 0.0);
    let mut best = iter.next()?;
    for candidate in iter {
        let diff = candidate.confidence - best.confidence;
        if diff > CONFIDENCE_EPSILON
            || (diff.abs() <= CONFIDENCE_EPSILON && tie_key(&candidate) < tie_key(&best))
        {
            best = candidate;
        }
    }
    Some(best)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::types::{CitationStyle, CitationTarget};

    struct Fixed(Vec<Candidate>);

    impl LinkStrategy for Fixed {
        fn method(&self) -> LinkMethod {
            LinkMethod::Numeric
        }

        fn candidates(&self, _span: &DetectedSpan, _ctx: &LinkContext<'_>) -> Vec<Candidate> {
            self.0.clone()
        }
    }

    #[test]
    fn numeric_spans_link_through_cascade() {
        let refs = numbered_references(20);
        let config = LinkerConfig::default();
        let ctx = LinkContext::new(&refs, &config);
        let spans: Vec<DetectedSpan> = [1, 2, 3, 19, 20]
            .into_iter()
            .map(|n| span(2, "[n]", CitationStyle::Numeric, CitationTarget::Number(n)))
            .collect();
        let linking = Linker::standard().link(&spans, &ctx);
        assert_eq!(linking.unlinked, 0);
        let ids: Vec<i64> = linking.drafts.iter().map(|d| d.reference_id).collect();
        assert_eq!(ids, vec![101, 102, 103, 119, 120]);
        assert!(linking.drafts.iter().all(|d| d.method == LinkMethod::Numeric));
        assert!(linking.drafts.iter().all(|d| (d.confidence - 0.9).abs() < 1e-12));
    }

    #[test]
    fn unmatched_spans_are_counted_not_failed() {
        let refs = numbered_references(3);
        let config = LinkerConfig::default();
        let ctx = LinkContext::new(&refs, &config);
        let spans = vec![
            span(1, "[9]", CitationStyle::Numeric, CitationTarget::Number(9)),
            span(1, "??", CitationStyle::Unknown, CitationTarget::Unresolved),
        ];
        let linking = Linker::standard().link(&spans, &ctx);
        assert!(linking.drafts.is_empty());
        assert_eq!(linking.unlinked, 2);
    }

    #[test]
    fn ties_prefer_reference_near_linked_neighbours() {
        let refs = numbered_references(20);
        let config = LinkerConfig::default();
        let ctx = LinkContext::new(&refs, &config);
        let first = Fixed(vec![Candidate { reference: 14, confidence: 0.8 }]);
        let linker = Linker::new(vec![Box::new(first)]);
        let anchor = linker.link(&[span(4, "x", CitationStyle::Unknown, CitationTarget::Unresolved)], &ctx);
        assert_eq!(anchor.drafts[0].reference_id, 115);

        let mut neighbours = Neighbours::default();
        neighbours.record(4, 15);
        let tied = vec![
            Candidate { reference: 1, confidence: 0.8 },
            Candidate { reference: 15, confidence: 0.8 },
        ];
        let best = choose(tied.clone(), 4, &refs, &neighbours).unwrap();
        assert_eq!(best.reference, 15);

        let best = choose(tied, 5, &refs, &neighbours).unwrap();
        assert_eq!(best.reference, 1, "no neighbours on page 5: lowest number wins");
    }

    #[test]
    fn higher_confidence_beats_locality() {
        let refs = numbered_references(5);
        let mut neighbours = Neighbours::default();
        neighbours.record(1, 1);
        let best = choose(
            vec![
                Candidate { reference: 0, confidence: 0.7 },
                Candidate { reference: 4, confidence: 0.75 },
            ],
            1,
            &refs,
            &neighbours,
        )
        .unwrap();
        assert_eq!(best.reference, 4);
    }
}
