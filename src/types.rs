use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::geometry::BBox;

pub type PaperId = i64;
pub type SpanId = i64;
pub type ReferenceId = i64;
pub type LinkId = i64;

/// A character extracted from a PDF page with position and font info.
#[derive(Debug, Clone)]
pub struct PdfChar {
    pub ch: char,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub font_size: f32,
}

/// All characters on a single PDF page.
#[derive(Debug, Clone)]
pub struct PageChars {
    pub page_num: u32,
    pub width: f32,
    pub height: f32,
    pub chars: Vec<PdfChar>,
}

/// A word: sequence of characters forming a unit.
///
/// `glyphs` holds one box per `char` of `text`, in order.
#[derive(Debug, Clone)]
pub struct Word {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub font_size: f32,
    pub is_superscript: bool,
    pub glyphs: Vec<BBox>,
}

impl Word {
    pub fn bbox(&self) -> BBox {
        BBox::from_origin(self.x, self.y, self.width, self.height)
    }
}

/// A line of text: sequence of words on the same baseline.
#[derive(Debug, Clone)]
pub struct Line {
    pub words: Vec<Word>,
    pub y: f32,
    pub x_start: f32,
    pub x_end: f32,
    pub font_size: f32,
}

impl Line {
    pub fn text(&self) -> String {
        self.words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} value: {other}", stringify!($name))),
                }
            }
        }
    };
}

/// Visual family of an in-text citation marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CitationStyle {
    Numeric,
    AuthorYear,
    Unknown,
}

string_enum!(CitationStyle {
    Numeric => "NUMERIC",
    AuthorYear => "AUTHOR_YEAR",
    Unknown => "UNKNOWN",
});

/// Where a span came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Provenance {
    Annotation,
    Pattern,
}

string_enum!(Provenance {
    Annotation => "ANNOTATION",
    Pattern => "PATTERN",
});

/// Cascade step that produced a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMethod {
    AnnotationDest,
    Numeric,
    Corroborated,
    AuthorYearFuzzy,
}

string_enum!(LinkMethod {
    AnnotationDest => "annotation_dest",
    Numeric => "numeric",
    Corroborated => "corroborated",
    AuthorYearFuzzy => "author_year_fuzzy",
});

/// Normalized author-year key parsed from a marker like "Smith et al., 2020a".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorYearKey {
    /// Lowercased surnames in the order they appear in the marker.
    pub surnames: Vec<String>,
    pub et_al: bool,
    pub year: i32,
    pub suffix: Option<char>,
}

/// What a detected span points at, as far as the marker text tells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CitationTarget {
    Number(u32),
    AuthorYear(AuthorYearKey),
    Unresolved,
}

impl CitationTarget {
    pub fn number(&self) -> Option<u32> {
        match self {
            CitationTarget::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// Candidate citation occurrence produced by the detector, before persistence.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedSpan {
    pub page_num: u32,
    pub bbox: BBox,
    pub raw_text: String,
    pub style: CitationStyle,
    pub provenance: Provenance,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_y: Option<f32>,
    pub target: CitationTarget,
}

/// A persisted citation span.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationSpan {
    pub id: SpanId,
    pub paper_id: PaperId,
    pub page_num: u32,
    pub bbox: BBox,
    pub raw_text: String,
    pub style: CitationStyle,
    pub provenance: Provenance,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_y: Option<f32>,
    pub created_at: i64,
}

/// A persisted span → reference edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationLink {
    pub id: LinkId,
    pub citation_span_id: SpanId,
    pub reference_id: ReferenceId,
    pub link_method: LinkMethod,
    pub confidence: f64,
    pub created_at: i64,
}

/// A link produced by the linker, addressing its span by position in the
/// detector output. Ids are assigned at persistence time.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkDraft {
    pub span_index: usize,
    pub reference_id: ReferenceId,
    pub method: LinkMethod,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Paper {
    pub id: PaperId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdf_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bibliography_start_page: Option<u32>,
}

/// Paper registration. `id: None` lets the store assign one.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPaper {
    pub id: Option<PaperId>,
    pub title: Option<String>,
    pub pdf_path: Option<PathBuf>,
    pub bibliography_start_page: Option<u32>,
}

/// A parsed bibliography entry, supplied upstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub id: ReferenceId,
    pub paper_id: PaperId,
    /// 1-based position in the bibliography.
    pub number: u32,
    pub raw_text: String,
    pub authors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_num: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y_min: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y_max: Option<f32>,
}

static LEADING_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:\[\d{1,4}\]|\(\d{1,4}\)|\d{1,3}[.\)])\s*").unwrap());

static DOI_OR_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:https?://\S+|doi:\s*\S+|\b10\.\d{4,9}/\S+)").unwrap()
});

impl Reference {
    /// Vertical extent of the entry on its page, when known.
    pub fn region(&self) -> Option<(f32, f32)> {
        match (self.y_min, self.y_max) {
            (Some(a), Some(b)) => Some((a.min(b), a.max(b))),
            _ => None,
        }
    }

    /// Free-text query for metadata lookups.
    pub fn search_query(&self) -> String {
        if let Some(title) = self.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            return title.to_string();
        }
        let text = LEADING_MARKER_RE.replace(&self.raw_text, "");
        let text = DOI_OR_URL_RE.replace_all(&text, " ");
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.chars().take(200).collect()
    }
}

/// Reference as supplied by an import file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReference {
    pub number: u32,
    pub raw_text: String,
    #[serde(default)]
    pub authors: Vec<String>,
    pub title: Option<String>,
    pub venue: Option<String>,
    pub year: Option<i32>,
    pub doi: Option<String>,
    pub page_num: Option<u32>,
    pub y_min: Option<f32>,
    pub y_max: Option<f32>,
}

/// A page that could not be scanned. Coverage drops, the run goes on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageWarning {
    pub page_num: u32,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleCounts {
    pub numeric: usize,
    pub author_year: usize,
    pub unknown: usize,
}

/// Aggregate figures for one paper, always computed from persisted rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionStats {
    pub total_spans: usize,
    pub annotation_spans: usize,
    pub pattern_spans: usize,
    pub by_style: StyleCounts,
    /// Spans with at least one link.
    pub linked_count: usize,
    pub unlinked_count: usize,
    pub total_links: usize,
    pub links_by_method: BTreeMap<String, usize>,
    pub average_confidence: f64,
}
