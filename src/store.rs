//! SQLite persistence for papers, references, spans and links.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::geometry::BBox;
use crate::types::{
    CitationLink, CitationSpan, DetectedSpan, ExtractionStats, LinkDraft, NewPaper,
    NewReference, Paper, PaperId, Reference, ReferenceId, SpanId, StyleCounts,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS papers (
        id                      INTEGER PRIMARY KEY AUTOINCREMENT,
        title                   TEXT,
        pdf_path                TEXT,
        page_count              INTEGER,
        bibliography_start_page INTEGER
    );
    CREATE TABLE IF NOT EXISTS refs (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        paper_id   INTEGER NOT NULL REFERENCES papers(id) ON DELETE CASCADE,
        number     INTEGER NOT NULL,
        raw_text   TEXT NOT NULL,
        authors    TEXT NOT NULL DEFAULT '[]',
        title      TEXT,
        venue      TEXT,
        year       INTEGER,
        doi        TEXT,
        page_num   INTEGER,
        y_min      REAL,
        y_max      REAL
    );
    CREATE INDEX IF NOT EXISTS refs_by_paper ON refs(paper_id, number);
    CREATE TABLE IF NOT EXISTS citation_spans (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        paper_id   INTEGER NOT NULL REFERENCES papers(id) ON DELETE CASCADE,
        page_num   INTEGER NOT NULL,
        x1         REAL NOT NULL,
        y1         REAL NOT NULL,
        x2         REAL NOT NULL,
        y2         REAL NOT NULL,
        raw_text   TEXT NOT NULL,
        style      TEXT NOT NULL,
        provenance TEXT NOT NULL,
        confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
        dest_page  INTEGER,
        dest_y     REAL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS spans_by_page ON citation_spans(paper_id, page_num);
    CREATE TABLE IF NOT EXISTS citation_links (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        citation_span_id INTEGER NOT NULL REFERENCES citation_spans(id) ON DELETE CASCADE,
        reference_id     INTEGER NOT NULL REFERENCES refs(id) ON DELETE CASCADE,
        link_method      TEXT NOT NULL,
        confidence       REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
        created_at       INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS links_by_span ON citation_links(citation_span_id);
    CREATE INDEX IF NOT EXISTS links_by_reference ON citation_links(reference_id);
";

const SPAN_COLUMNS: &str = "s.id, s.paper_id, s.page_num, s.x1, s.y1, s.x2, s.y2, s.raw_text, \
     s.style, s.provenance, s.confidence, s.dest_page, s.dest_y, s.created_at";
const SPAN_WIDTH: usize = 14;
const REF_COLUMNS: &str = "r.id, r.paper_id, r.number, r.raw_text, r.authors, r.title, r.venue, \
     r.year, r.doi, r.page_num, r.y_min, r.y_max";
const LINK_COLUMNS: &str =
    "l.id, l.citation_span_id, l.reference_id, l.link_method, l.confidence, l.created_at";

/// Spans and links written by one [`CitationStore::replace_generation`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub spans: Vec<CitationSpan>,
    pub links: Vec<CitationLink>,
}

/// One page of a span listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanQuery {
    pub page_num: Option<u32>,
    pub offset: usize,
    pub limit: Option<usize>,
}

pub struct CitationStore {
    conn: Mutex<Connection>,
}

impl CitationStore {
    /// Open (creating if needed) a database file in WAL mode.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        debug!(path = %path.display(), "opened citation store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Default database location: `<data_dir>/citelink/citelink.db`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("citelink").join("citelink.db"))
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a paper, or update title/path/start page of an existing one.
    pub fn upsert_paper(&self, paper: &NewPaper) -> Result<PaperId, StoreError> {
        let conn = self.lock();
        let path = paper.pdf_path.as_ref().map(|p| p.to_string_lossy().into_owned());
        match paper.id {
            Some(id) => {
                conn.execute(
                    "INSERT INTO papers (id, title, pdf_path, bibliography_start_page)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                         title = COALESCE(excluded.title, title),
                         pdf_path = COALESCE(excluded.pdf_path, pdf_path),
                         bibliography_start_page =
                             COALESCE(excluded.bibliography_start_page, bibliography_start_page)",
                    params![id, paper.title, path, paper.bibliography_start_page],
                )?;
                Ok(id)
            }
            None => {
                conn.execute(
                    "INSERT INTO papers (title, pdf_path, bibliography_start_page) VALUES (?1, ?2, ?3)",
                    params![paper.title, path, paper.bibliography_start_page],
                )?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    pub fn paper(&self, id: PaperId) -> Result<Option<Paper>, StoreError> {
        let conn = self.lock();
        let paper = conn
            .query_row(
                "SELECT id, title, pdf_path, page_count, bibliography_start_page
                 FROM papers WHERE id = ?1",
                [id],
                |row| {
                    Ok(Paper {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        pdf_path: row.get::<_, Option<String>>(2)?.map(PathBuf::from),
                        page_count: row.get(3)?,
                        bibliography_start_page: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(paper)
    }

    /// Remove a paper and everything hanging off it.
    pub fn delete_paper(&self, id: PaperId) -> Result<bool, StoreError> {
        let conn = self.lock();
        Ok(conn.execute("DELETE FROM papers WHERE id = ?1", [id])? > 0)
    }

    /// Replace the paper's bibliography. Links to the old references go
    /// with them; spans stay.
    pub fn replace_references(
        &self,
        paper_id: PaperId,
        references: &[NewReference],
    ) -> Result<Vec<Reference>, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        ensure_paper(&tx, paper_id)?;
        tx.execute("DELETE FROM refs WHERE paper_id = ?1", [paper_id])?;

        let mut stored = Vec::with_capacity(references.len());
        {
            let mut insert = tx.prepare(
                "INSERT INTO refs (paper_id, number, raw_text, authors, title, venue, year, doi,
                                   page_num, y_min, y_max)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for r in references {
                if r.number == 0 {
                    return Err(StoreError::Integrity("reference numbers start at 1".into()));
                }
                insert.execute(params![
                    paper_id,
                    r.number,
                    r.raw_text,
                    serde_json::to_string(&r.authors)?,
                    r.title,
                    r.venue,
                    r.year,
                    r.doi,
                    r.page_num,
                    r.y_min.map(f64::from),
                    r.y_max.map(f64::from),
                ])?;
                stored.push(Reference {
                    id: tx.last_insert_rowid(),
                    paper_id,
                    number: r.number,
                    raw_text: r.raw_text.clone(),
                    authors: r.authors.clone(),
                    title: r.title.clone(),
                    venue: r.venue.clone(),
                    year: r.year,
                    doi: r.doi.clone(),
                    page_num: r.page_num,
                    y_min: r.y_min,
                    y_max: r.y_max,
                });
            }
        }
        tx.commit()?;
        info!(paper_id, count = stored.len(), "references replaced");
        Ok(stored)
    }

    /// References of a paper in bibliography order.
    pub fn references(&self, paper_id: PaperId) -> Result<Vec<Reference>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REF_COLUMNS} FROM refs r WHERE r.paper_id = ?1 ORDER BY r.number, r.id"
        ))?;
        let rows = stmt.query_map([paper_id], |row| reference_at(row, 0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Swap the paper's spans and links for a new generation in one
    /// transaction. Any failure leaves the previous generation untouched.
    ///
    /// `page_count`, when given, is recorded on the paper and bounds span
    /// page numbers.
    pub fn replace_generation(
        &self,
        paper_id: PaperId,
        page_count: Option<u32>,
        spans: &[DetectedSpan],
        links: &[LinkDraft],
    ) -> Result<Generation, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let stored_pages = ensure_paper(&tx, paper_id)?;
        if let Some(count) = page_count {
            tx.execute("UPDATE papers SET page_count = ?2 WHERE id = ?1", params![paper_id, count])?;
        }
        let page_limit = page_count.or(stored_pages);

        tx.execute(
            "DELETE FROM citation_links WHERE citation_span_id IN
                 (SELECT id FROM citation_spans WHERE paper_id = ?1)",
            [paper_id],
        )?;
        tx.execute("DELETE FROM citation_spans WHERE paper_id = ?1", [paper_id])?;

        let now = now_epoch();
        let mut generation = Generation::default();
        {
            let mut insert = tx.prepare(
                "INSERT INTO citation_spans (paper_id, page_num, x1, y1, x2, y2, raw_text, style,
                                             provenance, confidence, dest_page, dest_y, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            for span in spans {
                if span.page_num == 0 || page_limit.is_some_and(|limit| span.page_num > limit) {
                    return Err(StoreError::Integrity(format!(
                        "span on page {} outside document of {:?} pages",
                        span.page_num, page_limit
                    )));
                }
                insert.execute(params![
                    paper_id,
                    span.page_num,
                    f64::from(span.bbox.x1),
                    f64::from(span.bbox.y1),
                    f64::from(span.bbox.x2),
                    f64::from(span.bbox.y2),
                    span.raw_text,
                    span.style.as_str(),
                    span.provenance.as_str(),
                    span.confidence,
                    span.dest_page,
                    span.dest_y.map(f64::from),
                    now,
                ])?;
                generation.spans.push(CitationSpan {
                    id: tx.last_insert_rowid(),
                    paper_id,
                    page_num: span.page_num,
                    bbox: span.bbox,
                    raw_text: span.raw_text.clone(),
                    style: span.style,
                    provenance: span.provenance,
                    confidence: span.confidence,
                    dest_page: span.dest_page,
                    dest_y: span.dest_y,
                    created_at: now,
                });
            }
        }
        {
            let mut owner = tx.prepare("SELECT paper_id FROM refs WHERE id = ?1")?;
            let mut insert = tx.prepare(
                "INSERT INTO citation_links (citation_span_id, reference_id, link_method, confidence,
                                             created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for draft in links {
                let span_id = generation
                    .spans
                    .get(draft.span_index)
                    .map(|s| s.id)
                    .ok_or_else(|| {
                        StoreError::Integrity(format!("link names missing span #{}", draft.span_index))
                    })?;
                let reference_paper: Option<PaperId> = owner
                    .query_row([draft.reference_id], |row| row.get(0))
                    .optional()?;
                if reference_paper != Some(paper_id) {
                    return Err(StoreError::Integrity(format!(
                        "reference {} does not belong to paper {paper_id}",
                        draft.reference_id
                    )));
                }
                insert.execute(params![
                    span_id,
                    draft.reference_id,
                    draft.method.as_str(),
                    draft.confidence,
                    now,
                ])?;
                generation.links.push(CitationLink {
                    id: tx.last_insert_rowid(),
                    citation_span_id: span_id,
                    reference_id: draft.reference_id,
                    link_method: draft.method,
                    confidence: draft.confidence,
                    created_at: now,
                });
            }
        }
        tx.commit()?;
        debug!(
            paper_id,
            spans = generation.spans.len(),
            links = generation.links.len(),
            "generation committed"
        );
        Ok(generation)
    }

    /// Spans of a paper in reading order, optionally one page and one slice.
    pub fn spans(&self, paper_id: PaperId, query: SpanQuery) -> Result<Vec<CitationSpan>, StoreError> {
        let conn = self.lock();
        let limit = query.limit.map_or(-1, |l| l as i64);
        let mut stmt = conn.prepare(&format!(
            "SELECT {SPAN_COLUMNS} FROM citation_spans s
             WHERE s.paper_id = ?1 AND (?2 IS NULL OR s.page_num = ?2)
             ORDER BY s.id
             LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt.query_map(
            params![paper_id, query.page_num, limit, query.offset as i64],
            |row| span_at(row, 0),
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn spans_by_paper(&self, paper_id: PaperId) -> Result<Vec<CitationSpan>, StoreError> {
        self.spans(paper_id, SpanQuery::default())
    }

    pub fn spans_by_page(&self, paper_id: PaperId, page_num: u32) -> Result<Vec<CitationSpan>, StoreError> {
        self.spans(paper_id, SpanQuery { page_num: Some(page_num), ..SpanQuery::default() })
    }

    pub fn span(&self, id: SpanId) -> Result<Option<CitationSpan>, StoreError> {
        let conn = self.lock();
        let span = conn
            .query_row(
                &format!("SELECT {SPAN_COLUMNS} FROM citation_spans s WHERE s.id = ?1"),
                [id],
                |row| span_at(row, 0),
            )
            .optional()?;
        Ok(span)
    }

    pub fn count_spans(&self, paper_id: PaperId) -> Result<usize, StoreError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM citation_spans WHERE paper_id = ?1",
            [paper_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// References a span links to, with the link, most confident first.
    pub fn references_for_span(&self, span_id: SpanId) -> Result<Vec<(Reference, CitationLink)>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REF_COLUMNS}, {LINK_COLUMNS}
             FROM citation_links l JOIN refs r ON r.id = l.reference_id
             WHERE l.citation_span_id = ?1
             ORDER BY l.confidence DESC, l.id"
        ))?;
        let rows = stmt.query_map([span_id], |row| Ok((reference_at(row, 0)?, link_at(row, 12)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Every span citing a reference, in reading order.
    pub fn spans_citing(&self, reference_id: ReferenceId) -> Result<Vec<(CitationSpan, CitationLink)>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SPAN_COLUMNS}, {LINK_COLUMNS}
             FROM citation_links l JOIN citation_spans s ON s.id = l.citation_span_id
             WHERE l.reference_id = ?1
             ORDER BY s.id"
        ))?;
        let rows = stmt.query_map([reference_id], |row| {
            Ok((span_at(row, 0)?, link_at(row, SPAN_WIDTH)?))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn links_for_paper(&self, paper_id: PaperId) -> Result<Vec<CitationLink>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LINK_COLUMNS}
             FROM citation_links l JOIN citation_spans s ON s.id = l.citation_span_id
             WHERE s.paper_id = ?1
             ORDER BY s.id, l.id"
        ))?;
        let rows = stmt.query_map([paper_id], |row| link_at(row, 0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Aggregates over the persisted rows of one paper.
    pub fn stats(&self, paper_id: PaperId) -> Result<ExtractionStats, StoreError> {
        let conn = self.lock();
        let mut stats = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(provenance = 'ANNOTATION'), 0),
                    COALESCE(SUM(provenance = 'PATTERN'), 0),
                    COALESCE(SUM(style = 'NUMERIC'), 0),
                    COALESCE(SUM(style = 'AUTHOR_YEAR'), 0),
                    COALESCE(SUM(style = 'UNKNOWN'), 0),
                    COALESCE(AVG(confidence), 0.0)
             FROM citation_spans WHERE paper_id = ?1",
            [paper_id],
            |row| {
                Ok(ExtractionStats {
                    total_spans: row.get::<_, i64>(0)? as usize,
                    annotation_spans: row.get::<_, i64>(1)? as usize,
                    pattern_spans: row.get::<_, i64>(2)? as usize,
                    by_style: StyleCounts {
                        numeric: row.get::<_, i64>(3)? as usize,
                        author_year: row.get::<_, i64>(4)? as usize,
                        unknown: row.get::<_, i64>(5)? as usize,
                    },
                    average_confidence: row.get(6)?,
                    ..ExtractionStats::default()
                })
            },
        )?;

        let (linked, total_links): (i64, i64) = conn.query_row(
            "SELECT COUNT(DISTINCT l.citation_span_id), COUNT(l.id)
             FROM citation_links l JOIN citation_spans s ON s.id = l.citation_span_id
             WHERE s.paper_id = ?1",
            [paper_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        stats.linked_count = linked as usize;
        stats.total_links = total_links as usize;
        stats.unlinked_count = stats.total_spans.saturating_sub(stats.linked_count);

        let mut stmt = conn.prepare(
            "SELECT l.link_method, COUNT(*)
             FROM citation_links l JOIN citation_spans s ON s.id = l.citation_span_id
             WHERE s.paper_id = ?1
             GROUP BY l.link_method",
        )?;
        let rows = stmt.query_map([paper_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        for row in rows {
            let (method, count) = row?;
            stats.links_by_method.insert(method, count);
        }
        Ok(stats)
    }
}

/// Fails with `Integrity` unless the paper exists; returns its page count.
fn ensure_paper(tx: &Transaction<'_>, paper_id: PaperId) -> Result<Option<u32>, StoreError> {
    tx.query_row("SELECT page_count FROM papers WHERE id = ?1", [paper_id], |row| row.get(0))
        .optional()?
        .ok_or_else(|| StoreError::Integrity(format!("paper {paper_id} is not registered")))
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn get_f32(row: &Row<'_>, idx: usize) -> rusqlite::Result<f32> {
    Ok(row.get::<_, f64>(idx)? as f32)
}

fn get_opt_f32(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<f32>> {
    Ok(row.get::<_, Option<f64>>(idx)?.map(|v| v as f32))
}

fn span_at(row: &Row<'_>, base: usize) -> rusqlite::Result<CitationSpan> {
    Ok(CitationSpan {
        id: row.get(base)?,
        paper_id: row.get(base + 1)?,
        page_num: row.get(base + 2)?,
        bbox: BBox::new(
            get_f32(row, base + 3)?,
            get_f32(row, base + 4)?,
            get_f32(row, base + 5)?,
            get_f32(row, base + 6)?,
        ),
        raw_text: row.get(base + 7)?,
        style: parse_column(row, base + 8)?,
        provenance: parse_column(row, base + 9)?,
        confidence: row.get(base + 10)?,
        dest_page: row.get(base + 11)?,
        dest_y: get_opt_f32(row, base + 12)?,
        created_at: row.get(base + 13)?,
    })
}

fn reference_at(row: &Row<'_>, base: usize) -> rusqlite::Result<Reference> {
    let authors: String = row.get(base + 4)?;
    let authors = serde_json::from_str(&authors)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(base + 4, Type::Text, Box::new(e)))?;
    Ok(Reference {
        id: row.get(base)?,
        paper_id: row.get(base + 1)?,
        number: row.get(base + 2)?,
        raw_text: row.get(base + 3)?,
        authors,
        title: row.get(base + 5)?,
        venue: row.get(base + 6)?,
        year: row.get(base + 7)?,
        doi: row.get(base + 8)?,
        page_num: row.get(base + 9)?,
        y_min: get_opt_f32(row, base + 10)?,
        y_max: get_opt_f32(row, base + 11)?,
    })
}

fn link_at(row: &Row<'_>, base: usize) -> rusqlite::Result<CitationLink> {
    Ok(CitationLink {
        id: row.get(base)?,
        citation_span_id: row.get(base + 1)?,
        reference_id: row.get(base + 2)?,
        link_method: parse_column(row, base + 3)?,
        confidence: row.get(base + 4)?,
        created_at: row.get(base + 5)?,
    })
}
