use super::{Candidate, LinkContext, LinkStrategy};
use crate::types::{CitationStyle, DetectedSpan, LinkMethod};

/// A numeric marker `n` names bibliography entry `n`.
pub struct NumericMatch;

impl LinkStrategy for NumericMatch {
    fn method(&self) -> LinkMethod {
        LinkMethod::Numeric
    }

    fn candidates(&self, span: &DetectedSpan, ctx: &LinkContext<'_>) -> Vec<Candidate> {
        if span.style != CitationStyle::Numeric {
            return Vec::new();
        }
        let Some(number) = span.target.number() else {
            return Vec::new();
        };
        ctx.numbered(number)
            .map(|reference| Candidate { reference, confidence: ctx.config.numeric_confidence })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkerConfig;
    use crate::linker::test_support::*;
    use crate::types::CitationTarget;

    #[test]
    fn matches_by_reference_number() {
        let refs = numbered_references(20);
        let config = LinkerConfig::default();
        let ctx = LinkContext::new(&refs, &config);
        let found = NumericMatch.candidates(
            &span(2, "[19-20]", CitationStyle::Numeric, CitationTarget::Number(19)),
            &ctx,
        );
        assert_eq!(found, vec![Candidate { reference: 18, confidence: 0.9 }]);
    }

    #[test]
    fn ignores_other_styles_and_missing_numbers() {
        let refs = numbered_references(3);
        let config = LinkerConfig::default();
        let ctx = LinkContext::new(&refs, &config);
        assert!(NumericMatch
            .candidates(&span(1, "[4]", CitationStyle::Numeric, CitationTarget::Number(4)), &ctx)
            .is_empty());
        assert!(NumericMatch
            .candidates(&span(1, "(3)", CitationStyle::AuthorYear, CitationTarget::Number(3)), &ctx)
            .is_empty());
    }
}
