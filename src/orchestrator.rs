//! One extraction run: detect, link, persist, report.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::detector::CitationDetector;
use crate::error::{ExtractError, StoreError};
use crate::linker::{LinkContext, Linker};
use crate::locks::PaperLocks;
use crate::pdf::PdfBackend;
use crate::signal::CorroboratingSignal;
use crate::store::CitationStore;
use crate::types::{
    CitationLink, CitationSpan, ExtractionStats, PageWarning, Paper, PaperId, Reference,
};

/// Where papers and their parsed references come from.
pub trait ReferenceSupply: Send + Sync {
    fn paper(&self, paper_id: PaperId) -> Result<Option<Paper>, StoreError>;
    fn references(&self, paper_id: PaperId) -> Result<Vec<Reference>, StoreError>;
}

impl ReferenceSupply for CitationStore {
    fn paper(&self, paper_id: PaperId) -> Result<Option<Paper>, StoreError> {
        CitationStore::paper(self, paper_id)
    }

    fn references(&self, paper_id: PaperId) -> Result<Vec<Reference>, StoreError> {
        CitationStore::references(self, paper_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionPhase {
    NotStarted,
    Detecting,
    Linking,
    Persisting,
    Done,
    Failed,
}

impl ExtractionPhase {
    /// Coarse progress for job schedulers.
    pub fn percent(self) -> u8 {
        match self {
            ExtractionPhase::NotStarted | ExtractionPhase::Failed => 0,
            ExtractionPhase::Detecting => 10,
            ExtractionPhase::Linking => 30,
            ExtractionPhase::Persisting => 60,
            ExtractionPhase::Done => 100,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExtractionPhase::Done | ExtractionPhase::Failed)
    }

    /// Phases only move forward, one step at a time; any live phase may fail.
    pub fn can_advance_to(self, next: ExtractionPhase) -> bool {
        use ExtractionPhase::*;
        matches!(
            (self, next),
            (NotStarted, Detecting)
                | (Detecting, Linking)
                | (Linking, Persisting)
                | (Persisting, Done)
        ) || (!self.is_terminal() && next == Failed)
    }
}

impl fmt::Display for ExtractionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExtractionPhase::NotStarted => "NOT_STARTED",
            ExtractionPhase::Detecting => "DETECTING",
            ExtractionPhase::Linking => "LINKING",
            ExtractionPhase::Persisting => "PERSISTING",
            ExtractionPhase::Done => "DONE",
            ExtractionPhase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub paper_id: PaperId,
    pub phase: ExtractionPhase,
    pub percent: u8,
    pub message: String,
}

pub type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Per-run inputs besides the paper id.
#[derive(Clone, Default)]
pub struct ExtractOptions {
    pub signal: Option<CorroboratingSignal>,
    pub cancel: Option<CancellationToken>,
    pub progress: Option<ProgressFn>,
}

/// What an extraction produced, with stats read back from the store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionReport {
    pub paper_id: PaperId,
    pub page_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bibliography_start_page: Option<u32>,
    pub spans: Vec<CitationSpan>,
    pub links: Vec<CitationLink>,
    pub stats: ExtractionStats,
    pub warnings: Vec<PageWarning>,
}

struct PhaseTracker<'a> {
    paper_id: PaperId,
    phase: ExtractionPhase,
    progress: Option<&'a ProgressFn>,
}

impl<'a> PhaseTracker<'a> {
    fn new(paper_id: PaperId, progress: Option<&'a ProgressFn>) -> Self {
        Self { paper_id, phase: ExtractionPhase::NotStarted, progress }
    }

    fn advance(&mut self, next: ExtractionPhase, message: impl Into<String>) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal phase transition {} -> {next}",
            self.phase
        );
        self.phase = next;
        if let Some(progress) = self.progress {
            progress(ProgressEvent {
                paper_id: self.paper_id,
                phase: next,
                percent: next.percent(),
                message: message.into(),
            });
        }
    }
}

/// Runs extractions. Cheap to share behind an `Arc`; runs for different
/// papers proceed in parallel, runs for one paper are serialized.
pub struct Extractor {
    backend: Arc<dyn PdfBackend>,
    supply: Arc<dyn ReferenceSupply>,
    store: Arc<CitationStore>,
    config: EngineConfig,
    linker: Linker,
    locks: PaperLocks,
}

impl Extractor {
    /// Papers and references are read from `store` unless
    /// [`with_supply`](Self::with_supply) says otherwise.
    pub fn new(backend: Arc<dyn PdfBackend>, store: Arc<CitationStore>, config: EngineConfig) -> Self {
        Self {
            backend,
            supply: store.clone(),
            store,
            config,
            linker: Linker::standard(),
            locks: PaperLocks::new(),
        }
    }

    pub fn with_supply(mut self, supply: Arc<dyn ReferenceSupply>) -> Self {
        self.supply = supply;
        self
    }

    pub fn with_linker(mut self, linker: Linker) -> Self {
        self.linker = linker;
        self
    }

    pub fn store(&self) -> &CitationStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn extract(&self, paper_id: PaperId) -> Result<ExtractionReport, ExtractError> {
        self.extract_with(paper_id, &ExtractOptions::default())
    }

    /// Detect, link and atomically replace the paper's spans and links.
    ///
    /// A failed or cancelled run leaves the previous generation in place.
    pub fn extract_with(
        &self,
        paper_id: PaperId,
        options: &ExtractOptions,
    ) -> Result<ExtractionReport, ExtractError> {
        let mut tracker = PhaseTracker::new(paper_id, options.progress.as_ref());
        info!(paper_id, "extraction started");
        let result = self.run(paper_id, options, &mut tracker);
        match &result {
            Ok(report) => {
                info!(
                    paper_id,
                    spans = report.stats.total_spans,
                    linked = report.stats.linked_count,
                    warnings = report.warnings.len(),
                    "extraction finished"
                );
                tracker.advance(
                    ExtractionPhase::Done,
                    format!(
                        "{} spans, {} linked",
                        report.stats.total_spans, report.stats.linked_count
                    ),
                );
            }
            Err(err) => {
                warn!(paper_id, error = %err, "extraction failed");
                tracker.advance(ExtractionPhase::Failed, err.to_string());
            }
        }
        result
    }

    fn run(
        &self,
        paper_id: PaperId,
        options: &ExtractOptions,
        tracker: &mut PhaseTracker<'_>,
    ) -> Result<ExtractionReport, ExtractError> {
        let _guard = self.locks.acquire(paper_id, self.config.concurrency)?;

        let paper = self
            .supply
            .paper(paper_id)?
            .ok_or(ExtractError::PaperNotFound(paper_id))?;
        let path = paper.pdf_path.clone().ok_or(ExtractError::MissingPdf(paper_id))?;
        if !path.is_file() {
            return Err(ExtractError::FileAccess {
                path,
                reason: "file does not exist or is not a regular file".into(),
            });
        }
        let references = self.supply.references(paper_id)?;
        let cancel = options.cancel.as_ref();

        check_cancelled(cancel)?;
        tracker.advance(ExtractionPhase::Detecting, format!("scanning {}", path.display()));
        let detector = CitationDetector::new(self.config.detector.clone());
        let detection = detector.detect(
            self.backend.as_ref(),
            &path,
            paper.bibliography_start_page,
            cancel,
        )?;

        check_cancelled(cancel)?;
        tracker.advance(
            ExtractionPhase::Linking,
            format!("linking {} spans to {} references", detection.spans.len(), references.len()),
        );
        let ctx = LinkContext::new(&references, &self.config.linker)
            .with_bibliography_start(detection.bibliography_start_page)
            .with_signal(options.signal.as_ref());
        let linking = self.linker.link(&detection.spans, &ctx);

        check_cancelled(cancel)?;
        tracker.advance(ExtractionPhase::Persisting, format!("writing {} links", linking.drafts.len()));
        let generation = self.store.replace_generation(
            paper_id,
            Some(detection.page_count),
            &detection.spans,
            &linking.drafts,
        )?;
        let stats = self.store.stats(paper_id)?;

        Ok(ExtractionReport {
            paper_id,
            page_count: detection.page_count,
            bibliography_start_page: detection.bibliography_start_page,
            spans: generation.spans,
            links: generation.links,
            stats,
            warnings: detection.warnings,
        })
    }
}

fn check_cancelled(cancel: Option<&CancellationToken>) -> Result<(), ExtractError> {
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        return Err(ExtractError::Cancelled);
    }
    Ok(())
}
