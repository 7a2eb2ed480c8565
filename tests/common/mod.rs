#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use citelink::config::EngineConfig;
use citelink::orchestrator::Extractor;
use citelink::pdf::{PageResult, StaticPages};
use citelink::store::CitationStore;
use citelink::types::{NewPaper, NewReference, PaperId};
use tempfile::NamedTempFile;

/// A registered paper whose PDF path exists on disk. The bytes are never
/// read; pages come from the static backend.
pub struct Fixture {
    pub store: Arc<CitationStore>,
    pub paper_id: PaperId,
    pub pdf: NamedTempFile,
}

impl Fixture {
    pub fn new(bibliography_start: Option<u32>, references: &[NewReference]) -> Self {
        let store = Arc::new(CitationStore::open_in_memory().unwrap());
        let pdf = NamedTempFile::new().unwrap();
        let paper_id = store
            .upsert_paper(&NewPaper {
                title: Some("Fixture paper".into()),
                pdf_path: Some(pdf.path().to_path_buf()),
                bibliography_start_page: bibliography_start,
                ..NewPaper::default()
            })
            .unwrap();
        store.replace_references(paper_id, references).unwrap();
        Self { store, paper_id, pdf }
    }

    pub fn pdf_path(&self) -> PathBuf {
        self.pdf.path().to_path_buf()
    }

    pub fn extractor(&self, pages: Vec<PageResult>, config: EngineConfig) -> Extractor {
        Extractor::new(Arc::new(StaticPages::new(pages)), Arc::clone(&self.store), config)
    }
}

pub fn numbered(count: u32) -> Vec<NewReference> {
    (1..=count)
        .map(|n| NewReference {
            number: n,
            raw_text: format!("[{n}] A. Author{n}. Title number {n}. Journal (20{n:02})."),
            ..NewReference::default()
        })
        .collect()
}
