//! Find in-text citation markers in a PDF and link them to the paper's
//! parsed bibliography.

pub mod annotations;
pub mod config;
pub mod detector;
pub mod error;
pub mod geometry;
pub mod layout;
pub mod linker;
pub mod locks;
pub mod markers;
pub mod names;
pub mod orchestrator;
pub mod pdf;
pub mod signal;
pub mod store;
pub mod types;
pub mod zones;

pub use config::{ConcurrencyPolicy, DetectorConfig, EngineConfig, LinkerConfig};
pub use detector::{CitationDetector, Detection};
pub use error::{BackendError, ConfigError, ExtractError, SignalError, StoreError};
pub use geometry::BBox;
pub use linker::{LinkContext, LinkStrategy, Linker};
pub use orchestrator::{
    ExtractOptions, ExtractionPhase, ExtractionReport, Extractor, ProgressEvent, ProgressFn,
    ReferenceSupply,
};
pub use pdf::{PdfBackend, PdfiumBackend};
pub use signal::CorroboratingSignal;
pub use store::{CitationStore, SpanQuery};
pub use types::{
    CitationLink, CitationSpan, CitationStyle, ExtractionStats, LinkMethod, NewPaper, NewReference,
    PageWarning, Paper, Provenance, Reference,
};
