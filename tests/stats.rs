use citelink::geometry::BBox;
use citelink::store::CitationStore;
use citelink::types::{
    CitationStyle, CitationTarget, DetectedSpan, LinkDraft, LinkMethod, NewPaper, NewReference,
    Provenance,
};
use proptest::prelude::*;

fn span(i: usize, confidence: f64, provenance: Provenance) -> DetectedSpan {
    let y = 700.0 - 12.0 * (i % 50) as f32;
    DetectedSpan {
        page_num: 1 + (i / 50) as u32,
        bbox: BBox::new(72.0, y, 90.0, y + 10.0),
        raw_text: format!("[{}]", i + 1),
        style: CitationStyle::Numeric,
        provenance,
        confidence,
        dest_page: None,
        dest_y: None,
        target: CitationTarget::Number(i as u32 + 1),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn average_confidence_is_mean_of_persisted_spans(
        confidences in prop::collection::vec(0.0f64..=1.0, 1..120),
        annotated in prop::collection::vec(any::<bool>(), 120),
    ) {
        let store = CitationStore::open_in_memory().unwrap();
        let paper_id = store.upsert_paper(&NewPaper::default()).unwrap();
        let spans: Vec<DetectedSpan> = confidences
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let provenance = if annotated[i] { Provenance::Annotation } else { Provenance::Pattern };
                span(i, c, provenance)
            })
            .collect();
        store.replace_generation(paper_id, None, &spans, &[]).unwrap();

        let stats = store.stats(paper_id).unwrap();
        let mean = confidences.iter().sum::<f64>() / confidences.len() as f64;
        prop_assert_eq!(stats.total_spans, confidences.len());
        prop_assert!((stats.average_confidence - mean).abs() < 1e-9);
        prop_assert_eq!(stats.annotation_spans + stats.pattern_spans, stats.total_spans);
        prop_assert_eq!(stats.unlinked_count, stats.total_spans);
    }
}

#[test]
fn linked_count_counts_spans_not_links() {
    let store = CitationStore::open_in_memory().unwrap();
    let paper_id = store.upsert_paper(&NewPaper::default()).unwrap();
    let refs = store
        .replace_references(
            paper_id,
            &[1, 2].map(|number| NewReference {
                number,
                raw_text: format!("[{number}] Someone. Something."),
                ..NewReference::default()
            }),
        )
        .unwrap();
    let spans = vec![span(0, 0.9, Provenance::Pattern), span(1, 0.5, Provenance::Annotation)];
    let links = vec![
        LinkDraft { span_index: 0, reference_id: refs[0].id, method: LinkMethod::Numeric, confidence: 0.9 },
        LinkDraft { span_index: 0, reference_id: refs[1].id, method: LinkMethod::Corroborated, confidence: 0.8 },
    ];
    store.replace_generation(paper_id, Some(1), &spans, &links).unwrap();

    let stats = store.stats(paper_id).unwrap();
    assert_eq!(stats.total_spans, 2);
    assert_eq!(stats.linked_count, 1);
    assert_eq!(stats.unlinked_count, 1);
    assert_eq!(stats.total_links, 2);
    assert_eq!(stats.links_by_method.get("numeric"), Some(&1));
    assert_eq!(stats.links_by_method.get("corroborated"), Some(&1));
    assert!((stats.average_confidence - 0.7).abs() < 1e-9);
}
