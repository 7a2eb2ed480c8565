mod common;

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use citelink::config::{ConcurrencyPolicy, EngineConfig};
use citelink::error::{BackendError, ExtractError, StoreError};
use citelink::orchestrator::{ExtractOptions, ExtractionPhase, Extractor, ProgressFn, ReferenceSupply};
use citelink::pdf::{
    LinkAnnotation, PageFailure, PageResult, PdfBackend, StaticPages, TextRun, run_char_box,
    typeset_page,
};
use citelink::store::CitationStore;
use citelink::types::{
    CitationStyle, LinkMethod, NewPaper, NewReference, Paper, PaperId, Provenance, Reference,
};
use tokio_util::sync::CancellationToken;

use common::{Fixture, numbered};

fn numeric_pages() -> Vec<PageResult> {
    vec![
        Ok(typeset_page(1, &[TextRun::new(72.0, 700.0, "Introduction without markers.")], vec![])),
        Ok(typeset_page(
            2,
            &[
                TextRun::new(72.0, 700.0, "Early work [1] matters."),
                TextRun::new(72.0, 680.0, "Later [2,3] and [19-20] too."),
            ],
            vec![],
        )),
    ]
}

#[test]
fn numeric_markers_link_to_numbered_references() {
    let fx = Fixture::new(None, &numbered(20));
    let report = fx
        .extractor(numeric_pages(), EngineConfig::default())
        .extract(fx.paper_id)
        .unwrap();

    assert_eq!(report.spans.len(), 5);
    assert!(report.spans.iter().all(|s| s.style == CitationStyle::Numeric));
    assert_eq!(report.links.len(), 5);
    assert!(report.links.iter().all(|l| l.link_method == LinkMethod::Numeric));
    assert!(report.links.iter().all(|l| (l.confidence - 0.9).abs() < 1e-9));

    let refs = fx.store.references(fx.paper_id).unwrap();
    let linked: Vec<u32> = report
        .links
        .iter()
        .map(|l| refs.iter().find(|r| r.id == l.reference_id).unwrap().number)
        .collect();
    assert_eq!(linked, vec![1, 2, 3, 19, 20]);
    assert_eq!(report.stats.linked_count, 5);
    assert_eq!(report.stats.unlinked_count, 0);
    assert_eq!(report.page_count, 2);
}

#[test]
fn annotation_destination_links_into_reference_region() {
    let mut refs = numbered(10);
    for (i, r) in refs.iter_mut().enumerate() {
        r.page_num = Some(18);
        r.y_max = Some(850.0 - 100.0 * i as f32);
        r.y_min = Some(750.0 - 100.0 * i as f32);
    }
    let fx = Fixture::new(Some(18), &refs);

    let run = TextRun::new(72.0, 500.0, "as shown in [7] before.");
    let link = LinkAnnotation {
        rect: run_char_box(&run, 12, 15),
        dest_page: Some(18),
        dest_y: Some(200.0),
    };
    let pages = vec![
        Ok(typeset_page(3, std::slice::from_ref(&run), vec![link])),
        Ok(typeset_page(18, &[TextRun::new(72.0, 740.0, "References")], vec![])),
    ];
    let report = fx.extractor(pages, EngineConfig::default()).extract(fx.paper_id).unwrap();

    assert_eq!(report.spans.len(), 1, "pattern span for [7] is shadowed");
    let span = &report.spans[0];
    assert_eq!(span.provenance, Provenance::Annotation);
    assert_eq!(span.dest_page, Some(18));
    assert_eq!(report.links.len(), 1);
    let link = &report.links[0];
    assert_eq!(link.link_method, LinkMethod::AnnotationDest);
    assert!(link.confidence >= 0.95);
    let stored = fx.store.references(fx.paper_id).unwrap();
    let seventh = stored.iter().find(|r| r.number == 7).unwrap();
    assert_eq!(link.reference_id, seventh.id);
}

#[test]
fn multi_number_annotation_links_each_number_once() {
    let mut refs = numbered(10);
    for (i, r) in refs.iter_mut().enumerate() {
        r.page_num = Some(18);
        r.y_max = Some(850.0 - 100.0 * i as f32);
        r.y_min = Some(750.0 - 100.0 * i as f32);
    }
    let fx = Fixture::new(Some(18), &refs);

    let run = TextRun::new(72.0, 500.0, "as shown in [7, 8] before.");
    let link = LinkAnnotation {
        rect: run_char_box(&run, 12, 18),
        dest_page: Some(18),
        dest_y: Some(200.0),
    };
    let pages = vec![
        Ok(typeset_page(3, std::slice::from_ref(&run), vec![link])),
        Ok(typeset_page(18, &[TextRun::new(72.0, 740.0, "References")], vec![])),
    ];
    let report = fx.extractor(pages, EngineConfig::default()).extract(fx.paper_id).unwrap();

    assert_eq!(report.spans.len(), 2);
    assert!(report.spans.iter().all(|s| s.provenance == Provenance::Annotation));
    assert_eq!(report.links.len(), 2);
    assert!(report.links.iter().all(|l| l.link_method == LinkMethod::AnnotationDest));
    let stored = fx.store.references(fx.paper_id).unwrap();
    let mut linked: Vec<u32> = report
        .links
        .iter()
        .filter_map(|l| stored.iter().find(|r| r.id == l.reference_id).map(|r| r.number))
        .collect();
    linked.sort_unstable();
    assert_eq!(linked, vec![7, 8]);
}

#[test]
fn failed_page_keeps_other_pages_and_reports_warning() {
    let fx = Fixture::new(None, &numbered(3));
    let pages: Vec<PageResult> = (1..=12)
        .map(|n| {
            if n == 10 {
                Err(PageFailure { page_num: 10, message: "corrupt content stream".into() })
            } else {
                Ok(typeset_page(n, &[TextRun::new(72.0, 500.0, "see [1] here")], vec![]))
            }
        })
        .collect();
    let report = fx.extractor(pages, EngineConfig::default()).extract(fx.paper_id).unwrap();

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].page_num, 10);
    assert_eq!(report.spans.len(), 11);
    assert!(report.spans.iter().all(|s| s.page_num != 10));
    assert_eq!(report.stats.total_spans, 11);
}

#[test]
fn author_year_markers_link_by_surname_and_year() {
    let refs = vec![
        NewReference {
            number: 1,
            raw_text: "J. Smith, K. Lee. Deep things. 2020.".into(),
            authors: vec!["J. Smith".into(), "K. Lee".into()],
            year: Some(2020),
            ..NewReference::default()
        },
        NewReference {
            number: 2,
            raw_text: "A. Brown. Older things. 2018.".into(),
            authors: vec!["A. Brown".into()],
            year: Some(2018),
            ..NewReference::default()
        },
    ];
    let fx = Fixture::new(None, &refs);
    let pages = vec![Ok(typeset_page(
        1,
        &[
            TextRun::new(72.0, 700.0, "As argued (Smith et al., 2020) before."),
            TextRun::new(72.0, 680.0, "Later Brown (2018) agreed."),
        ],
        vec![],
    ))];
    let report = fx.extractor(pages, EngineConfig::default()).extract(fx.paper_id).unwrap();

    assert_eq!(report.spans.len(), 2);
    assert!(report.spans.iter().all(|s| s.style == CitationStyle::AuthorYear));
    assert_eq!(report.links.len(), 2);
    assert!(report.links.iter().all(|l| l.link_method == LinkMethod::AuthorYearFuzzy));
    let stored = fx.store.references(fx.paper_id).unwrap();
    let numbers: Vec<u32> = report
        .links
        .iter()
        .map(|l| stored.iter().find(|r| r.id == l.reference_id).unwrap().number)
        .collect();
    assert_eq!(numbers, vec![1, 2]);
}

#[test]
fn rerun_replaces_previous_generation() {
    let fx = Fixture::new(None, &numbered(20));
    let extractor = fx.extractor(numeric_pages(), EngineConfig::default());
    let first = extractor.extract(fx.paper_id).unwrap();
    let second = extractor.extract(fx.paper_id).unwrap();

    assert_eq!(fx.store.count_spans(fx.paper_id).unwrap(), 5);
    assert_eq!(fx.store.links_for_paper(fx.paper_id).unwrap().len(), 5);
    let first_ids: Vec<_> = first.spans.iter().map(|s| s.id).collect();
    assert!(second.spans.iter().all(|s| !first_ids.contains(&s.id)));
}

#[test]
fn repeated_runs_are_deterministic() {
    let fx = Fixture::new(None, &numbered(20));
    let extractor = fx.extractor(numeric_pages(), EngineConfig::default());
    let key = |report: &citelink::ExtractionReport| {
        report
            .spans
            .iter()
            .map(|s| (s.page_num, s.bbox, s.raw_text.clone(), s.style, s.provenance))
            .collect::<Vec<_>>()
    };
    let links = |report: &citelink::ExtractionReport| {
        report
            .links
            .iter()
            .map(|l| (l.reference_id, l.link_method))
            .collect::<Vec<_>>()
    };
    let a = extractor.extract(fx.paper_id).unwrap();
    let b = extractor.extract(fx.paper_id).unwrap();
    assert_eq!(key(&a), key(&b));
    assert_eq!(links(&a), links(&b));
    assert_eq!(a.stats, b.stats);
}

#[test]
fn every_bibliography_annotation_is_reported() {
    let fx = Fixture::new(Some(5), &numbered(4));
    let mut links = Vec::new();
    let mut runs = Vec::new();
    for n in 1..=4u32 {
        let run = TextRun::new(72.0, 700.0 - 20.0 * n as f32, &format!("point [{n}] made"));
        links.push(LinkAnnotation {
            rect: run_char_box(&run, 6, 9),
            dest_page: Some(5),
            dest_y: None,
        });
        runs.push(run);
    }
    // An external link is not a citation.
    links.push(LinkAnnotation {
        rect: run_char_box(&runs[0], 0, 5),
        dest_page: None,
        dest_y: None,
    });
    let pages = vec![
        Ok(typeset_page(1, &runs, links)),
        Ok(typeset_page(5, &[TextRun::new(72.0, 740.0, "References")], vec![])),
    ];
    let report = fx.extractor(pages, EngineConfig::default()).extract(fx.paper_id).unwrap();

    assert!(report.stats.annotation_spans >= 4);
    assert_eq!(report.stats.total_spans, 4);
    assert_eq!(report.stats.linked_count, 4);
}

#[test]
fn missing_paper_is_reported() {
    let fx = Fixture::new(None, &[]);
    let err = fx
        .extractor(numeric_pages(), EngineConfig::default())
        .extract(fx.paper_id + 41)
        .unwrap_err();
    assert!(matches!(err, ExtractError::PaperNotFound(_)));
}

#[test]
fn missing_pdf_file_is_a_file_access_error() {
    let store = Arc::new(CitationStore::open_in_memory().unwrap());
    let dir = tempfile::tempdir().unwrap();
    let paper_id = store
        .upsert_paper(&NewPaper {
            pdf_path: Some(dir.path().join("gone.pdf")),
            ..NewPaper::default()
        })
        .unwrap();
    let extractor = Extractor::new(
        Arc::new(StaticPages::new(numeric_pages())),
        Arc::clone(&store),
        EngineConfig::default(),
    );
    let err = extractor.extract(paper_id).unwrap_err();
    assert!(matches!(err, ExtractError::FileAccess { .. }));
    assert_eq!(store.count_spans(paper_id).unwrap(), 0);
}

#[test]
fn paper_without_pdf_is_rejected() {
    let store = Arc::new(CitationStore::open_in_memory().unwrap());
    let paper_id = store.upsert_paper(&NewPaper::default()).unwrap();
    let extractor = Extractor::new(
        Arc::new(StaticPages::default()),
        Arc::clone(&store),
        EngineConfig::default(),
    );
    assert!(matches!(extractor.extract(paper_id), Err(ExtractError::MissingPdf(_))));
}

#[test]
fn progress_reports_each_phase() {
    let fx = Fixture::new(None, &numbered(20));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let progress: ProgressFn = Arc::new(move |event| {
        sink.lock().unwrap().push((event.phase, event.percent));
    });
    let options = ExtractOptions { progress: Some(progress), ..ExtractOptions::default() };
    fx.extractor(numeric_pages(), EngineConfig::default())
        .extract_with(fx.paper_id, &options)
        .unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (ExtractionPhase::Detecting, 10),
            (ExtractionPhase::Linking, 30),
            (ExtractionPhase::Persisting, 60),
            (ExtractionPhase::Done, 100),
        ]
    );
}

#[test]
fn cancelled_run_persists_nothing() {
    let fx = Fixture::new(None, &numbered(20));
    let extractor = fx.extractor(numeric_pages(), EngineConfig::default());
    extractor.extract(fx.paper_id).unwrap();
    let before = fx.store.spans_by_paper(fx.paper_id).unwrap();

    // Cancel while linking; the check before persisting must catch it.
    let token = CancellationToken::new();
    let trigger = token.clone();
    let phases = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&phases);
    let progress: ProgressFn = Arc::new(move |event| {
        if event.phase == ExtractionPhase::Linking {
            trigger.cancel();
        }
        sink.lock().unwrap().push(event.phase);
    });
    let options = ExtractOptions {
        cancel: Some(token),
        progress: Some(progress),
        ..ExtractOptions::default()
    };
    let err = extractor.extract_with(fx.paper_id, &options).unwrap_err();

    assert!(matches!(err, ExtractError::Cancelled));
    assert_eq!(phases.lock().unwrap().last(), Some(&ExtractionPhase::Failed));
    assert_eq!(fx.store.spans_by_paper(fx.paper_id).unwrap(), before);
}

#[test]
fn cancelled_before_start_never_detects() {
    let fx = Fixture::new(None, &numbered(20));
    let token = CancellationToken::new();
    token.cancel();
    let options = ExtractOptions { cancel: Some(token), ..ExtractOptions::default() };
    let err = fx
        .extractor(numeric_pages(), EngineConfig::default())
        .extract_with(fx.paper_id, &options)
        .unwrap_err();
    assert!(matches!(err, ExtractError::Cancelled));
    assert_eq!(fx.store.count_spans(fx.paper_id).unwrap(), 0);
}

/// Hands references of another paper to the linker.
struct ForeignReferences {
    store: Arc<CitationStore>,
    foreign: PaperId,
}

impl ReferenceSupply for ForeignReferences {
    fn paper(&self, paper_id: PaperId) -> Result<Option<Paper>, StoreError> {
        self.store.paper(paper_id)
    }

    fn references(&self, _paper_id: PaperId) -> Result<Vec<Reference>, StoreError> {
        self.store.references(self.foreign)
    }
}

#[test]
fn failed_persistence_keeps_previous_generation() {
    let fx = Fixture::new(None, &numbered(20));
    let extractor = fx.extractor(numeric_pages(), EngineConfig::default());
    extractor.extract(fx.paper_id).unwrap();
    let spans = fx.store.spans_by_paper(fx.paper_id).unwrap();
    let links = fx.store.links_for_paper(fx.paper_id).unwrap();

    let other = fx.store.upsert_paper(&NewPaper::default()).unwrap();
    fx.store.replace_references(other, &numbered(20)).unwrap();
    let supply = Arc::new(ForeignReferences { store: Arc::clone(&fx.store), foreign: other });
    let err = fx
        .extractor(numeric_pages(), EngineConfig::default())
        .with_supply(supply)
        .extract(fx.paper_id)
        .unwrap_err();

    assert!(matches!(err, ExtractError::Persistence(StoreError::Integrity(_))));
    assert_eq!(fx.store.spans_by_paper(fx.paper_id).unwrap(), spans);
    assert_eq!(fx.store.links_for_paper(fx.paper_id).unwrap(), links);
}

/// Blocks the first page walk until released.
struct GatedPages {
    inner: StaticPages,
    entered: Mutex<Option<mpsc::Sender<()>>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl PdfBackend for GatedPages {
    fn visit_pages(
        &self,
        path: &Path,
        visit: &mut dyn FnMut(PageResult) -> ControlFlow<()>,
    ) -> Result<u32, BackendError> {
        let entered = self.entered.lock().unwrap().take();
        if let Some(entered) = entered {
            entered.send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
        self.inner.visit_pages(path, visit)
    }
}

fn gated_extractor(fx: &Fixture, policy: ConcurrencyPolicy) -> (Arc<Extractor>, mpsc::Receiver<()>, mpsc::Sender<()>) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let backend = GatedPages {
        inner: StaticPages::new(numeric_pages()),
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(release_rx),
    };
    let config = EngineConfig { concurrency: policy, ..EngineConfig::default() };
    let extractor = Extractor::new(Arc::new(backend), Arc::clone(&fx.store), config);
    (Arc::new(extractor), entered_rx, release_tx)
}

#[test]
fn concurrent_run_is_rejected_under_reject_policy() {
    let fx = Fixture::new(None, &numbered(20));
    let (extractor, entered, release) = gated_extractor(&fx, ConcurrencyPolicy::Reject);

    let running = {
        let extractor = Arc::clone(&extractor);
        let paper_id = fx.paper_id;
        thread::spawn(move || extractor.extract(paper_id))
    };
    entered.recv().unwrap();
    let err = extractor.extract(fx.paper_id).unwrap_err();
    assert!(matches!(err, ExtractError::Busy(id) if id == fx.paper_id));

    release.send(()).unwrap();
    let report = running.join().unwrap().unwrap();
    assert_eq!(report.spans.len(), 5);
}

#[test]
fn concurrent_run_waits_under_queue_policy() {
    let fx = Fixture::new(None, &numbered(20));
    let (extractor, entered, release) = gated_extractor(&fx, ConcurrencyPolicy::Queue);

    let first = {
        let extractor = Arc::clone(&extractor);
        let paper_id = fx.paper_id;
        thread::spawn(move || extractor.extract(paper_id))
    };
    entered.recv().unwrap();
    let second = {
        let extractor = Arc::clone(&extractor);
        let paper_id = fx.paper_id;
        thread::spawn(move || extractor.extract(paper_id))
    };
    release.send(()).unwrap();

    first.join().unwrap().unwrap();
    second.join().unwrap().unwrap();
    assert_eq!(fx.store.count_spans(fx.paper_id).unwrap(), 5);
}

#[test]
fn extraction_uses_paper_bibliography_start() {
    // Page 2 holds the reference list; its entries must not be reported.
    let fx = Fixture::new(Some(2), &numbered(3));
    let pages = vec![
        Ok(typeset_page(1, &[TextRun::new(72.0, 700.0, "One claim [2].")], vec![])),
        Ok(typeset_page(
            2,
            &[
                TextRun::new(72.0, 700.0, "[1] A. Author. Thing (2001)."),
                TextRun::new(72.0, 680.0, "[2] B. Author. Other (2002)."),
            ],
            vec![],
        )),
    ];
    let report = fx.extractor(pages, EngineConfig::default()).extract(fx.paper_id).unwrap();
    assert_eq!(report.bibliography_start_page, Some(2));
    assert_eq!(report.spans.len(), 1);
    assert_eq!(report.spans[0].page_num, 1);
}

#[test]
fn corroborating_signal_links_what_local_matching_cannot() {
    let refs = vec![
        NewReference {
            number: 1,
            raw_text: "[1] P. Novak. Neural parsing of documents. 2011.".into(),
            title: Some("Neural parsing of documents".into()),
            ..NewReference::default()
        },
        NewReference {
            number: 2,
            raw_text: "[2] R. Okafor. Graph methods for layout. 2013.".into(),
            title: Some("Graph methods for layout".into()),
            ..NewReference::default()
        },
    ];
    let fx = Fixture::new(None, &refs);
    let pages = || vec![Ok(typeset_page(1, &[TextRun::new(72.0, 600.0, "Prior art (Garcia, 2015) shows.")], vec![]))];

    let plain = fx.extractor(pages(), EngineConfig::default()).extract(fx.paper_id).unwrap();
    assert_eq!(plain.spans.len(), 1);
    assert!(plain.links.is_empty());

    let signal = citelink::CorroboratingSignal::from_json(
        r#"{
            "source": "grobid",
            "spans": [{ "pageNum": 1, "text": "(Garcia, 2015)", "reference": 0 }],
            "references": [{ "number": 2, "title": "Graph methods for layout" }]
        }"#,
    )
    .unwrap();
    let options = ExtractOptions { signal: Some(signal), ..ExtractOptions::default() };
    let report = fx
        .extractor(pages(), EngineConfig::default())
        .extract_with(fx.paper_id, &options)
        .unwrap();

    assert_eq!(report.links.len(), 1);
    let link = &report.links[0];
    assert_eq!(link.link_method, LinkMethod::Corroborated);
    assert!((0.75..=0.85).contains(&link.confidence));
    let stored = fx.store.references(fx.paper_id).unwrap();
    assert_eq!(stored.iter().find(|r| r.id == link.reference_id).unwrap().number, 2);
}
