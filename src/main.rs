use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use citelink::config::{self, ConcurrencyPolicy, EngineConfig};
use citelink::orchestrator::{ExtractOptions, Extractor, ProgressFn};
use citelink::store::{CitationStore, SpanQuery};
use citelink::types::{NewPaper, NewReference, PaperId, ReferenceId, SpanId};
use citelink::{CitationDetector, CorroboratingSignal, PdfiumBackend};

#[derive(Parser)]
#[command(name = "citelink", about = "Find in-text citations in PDFs and link them to references")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// SQLite database file
    #[arg(long, global = true, env = "CITELINK_DB")]
    db: Option<PathBuf>,

    /// Override pdfium library path
    #[arg(long, global = true, env = "PDFIUM_LIB_PATH")]
    pdfium_path: Option<PathBuf>,

    /// Extra TOML config file, applied after the default locations
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Register a paper and replace its references from a JSON file
    Import {
        /// `{ "id"?, "title"?, "pdfPath"?, "bibliographyStartPage"?, "references": [...] }`
        file: PathBuf,
    },
    /// Detect citation spans in a PDF without persisting anything
    Detect {
        pdf: PathBuf,
        /// First page of the reference list, if known
        #[arg(long)]
        bibliography_start: Option<u32>,
    },
    /// Detect, link and persist citations for a registered paper
    Extract {
        paper_id: PaperId,
        /// Corroborating signal JSON from a third-party extractor
        #[arg(long)]
        signal: Option<PathBuf>,
        /// Fail instead of waiting when the paper is already being extracted
        #[arg(long)]
        reject_busy: bool,
    },
    /// List persisted spans of a paper
    Spans {
        paper_id: PaperId,
        #[arg(long)]
        page: Option<u32>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one span with the references it links to
    Span { span_id: SpanId },
    /// Spans citing a reference
    CitedBy { reference_id: ReferenceId },
    /// Aggregate figures for a paper
    Stats { paper_id: PaperId },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportFile {
    #[serde(flatten)]
    paper: NewPaper,
    #[serde(default)]
    references: Vec<NewReference>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut engine = config::load_config(cli.config.as_deref()).context("Failed to load config")?;
    let backend = PdfiumBackend::new(cli.pdfium_path.clone());

    match cli.command {
        Command::Import { ref file } => {
            let store = open_store(cli.db.as_deref())?;
            run_import(&store, file, cli.pretty)
        }
        Command::Detect { ref pdf, bibliography_start } => {
            let detection = CitationDetector::new(engine.detector.clone())
                .detect(&backend, pdf, bibliography_start, None)?;
            print_json(&detection, cli.pretty)
        }
        Command::Extract { paper_id, ref signal, reject_busy } => {
            if reject_busy {
                engine.concurrency = ConcurrencyPolicy::Reject;
            }
            let store = Arc::new(open_store(cli.db.as_deref())?);
            run_extract(store, Arc::new(backend), engine, paper_id, signal.as_deref(), cli.pretty)
        }
        Command::Spans { paper_id, page, offset, limit } => {
            let store = open_store(cli.db.as_deref())?;
            let spans = store.spans(paper_id, SpanQuery { page_num: page, offset, limit })?;
            print_json(&spans, cli.pretty)
        }
        Command::Span { span_id } => {
            let store = open_store(cli.db.as_deref())?;
            let span = store
                .span(span_id)?
                .with_context(|| format!("No citation span with id {span_id}"))?;
            let references: Vec<_> = store
                .references_for_span(span_id)?
                .into_iter()
                .map(|(reference, link)| LinkedReference { reference, link })
                .collect();
            print_json(&serde_json::json!({ "span": span, "references": references }), cli.pretty)
        }
        Command::CitedBy { reference_id } => {
            let store = open_store(cli.db.as_deref())?;
            let spans: Vec<_> = store
                .spans_citing(reference_id)?
                .into_iter()
                .map(|(span, link)| CitingSpan { span, link })
                .collect();
            print_json(&spans, cli.pretty)
        }
        Command::Stats { paper_id } => {
            let store = open_store(cli.db.as_deref())?;
            store
                .paper(paper_id)?
                .with_context(|| format!("Paper {paper_id} not found"))?;
            print_json(&store.stats(paper_id)?, cli.pretty)
        }
    }
}

#[derive(Serialize)]
struct LinkedReference {
    reference: citelink::Reference,
    link: citelink::CitationLink,
}

#[derive(Serialize)]
struct CitingSpan {
    span: citelink::CitationSpan,
    link: citelink::CitationLink,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "citelink=info",
        1 => "citelink=debug",
        _ => "citelink=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(db: Option<&Path>) -> Result<CitationStore> {
    let path = match db {
        Some(path) => path.to_path_buf(),
        None => CitationStore::default_path()
            .context("Cannot determine a data directory; pass --db or set CITELINK_DB")?,
    };
    CitationStore::open(&path).with_context(|| format!("Failed to open database: {}", path.display()))
}

fn run_import(store: &CitationStore, file: &Path, pretty: bool) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read import file: {}", file.display()))?;
    let import: ImportFile = serde_json::from_str(&content)
        .with_context(|| format!("Malformed import file: {}", file.display()))?;
    let paper_id = store.upsert_paper(&import.paper)?;
    let references = store.replace_references(paper_id, &import.references)?;
    info!(paper_id, references = references.len(), "paper imported");
    print_json(
        &serde_json::json!({ "paperId": paper_id, "references": references }),
        pretty,
    )
}

fn run_extract(
    store: Arc<CitationStore>,
    backend: Arc<PdfiumBackend>,
    engine: EngineConfig,
    paper_id: PaperId,
    signal: Option<&Path>,
    pretty: bool,
) -> Result<()> {
    let signal = signal
        .map(|path| {
            CorroboratingSignal::from_json_file(path)
                .with_context(|| format!("Failed to load signal: {}", path.display()))
        })
        .transpose()?;
    let progress: ProgressFn = Arc::new(|event| {
        info!(paper_id = event.paper_id, phase = %event.phase, percent = event.percent, "{}", event.message);
    });
    let options = ExtractOptions { signal, cancel: None, progress: Some(progress) };
    let report = Extractor::new(backend, store, engine).extract_with(paper_id, &options)?;
    print_json(&report, pretty)
}

fn to_json<T: Serialize + ?Sized>(value: &T, pretty: bool) -> Result<String> {
    let json = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    Ok(json)
}

fn print_json<T: Serialize + ?Sized>(value: &T, pretty: bool) -> Result<()> {
    println!("{}", to_json(value, pretty)?);
    Ok(())
}
