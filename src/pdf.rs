use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use pdfium_render::prelude::*;

use crate::error::BackendError;
use crate::geometry::BBox;
use crate::types::{PageChars, PdfChar};

/// A link annotation on a page, reduced to what citation detection needs.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkAnnotation {
    pub rect: BBox,
    /// 1-indexed destination page for internal links; `None` for external
    /// (URI) links and links whose destination could not be read.
    pub dest_page: Option<u32>,
    pub dest_y: Option<f32>,
}

/// Everything the detector reads from one page.
#[derive(Debug, Clone)]
pub struct PageContent {
    pub chars: PageChars,
    pub links: Vec<LinkAnnotation>,
}

impl PageContent {
    pub fn page_num(&self) -> u32 {
        self.chars.page_num
    }
}

/// A page that could not be read.
#[derive(Debug, Clone, PartialEq)]
pub struct PageFailure {
    pub page_num: u32,
    pub message: String,
}

pub type PageResult = Result<PageContent, PageFailure>;

/// Source of page content for one PDF.
///
/// Implementations open the document, hand each page to `visit` in page
/// order and release every handle before returning, on all paths. `visit`
/// returning `Break` stops the walk early. Returns the document page count.
pub trait PdfBackend: Send + Sync {
    fn visit_pages(
        &self,
        path: &Path,
        visit: &mut dyn FnMut(PageResult) -> ControlFlow<()>,
    ) -> Result<u32, BackendError>;
}

/// pdfium-backed reader. The library is bound per call so no pdfium state
/// outlives an extraction.
#[derive(Debug, Clone, Default)]
pub struct PdfiumBackend {
    library_path: Option<PathBuf>,
}

impl PdfiumBackend {
    pub fn new(library_path: Option<PathBuf>) -> Self {
        Self { library_path }
    }

    fn bind(&self) -> Result<Pdfium, BackendError> {
        let bindings = match &self.library_path {
            Some(path) => Pdfium::bind_to_library(path).map_err(|e| {
                BackendError::Library(format!("failed to load pdfium from {}: {e}", path.display()))
            })?,
            None => Pdfium::bind_to_system_library().map_err(|e| {
                BackendError::Library(format!(
                    "failed to find pdfium ({e}); install pdfium-binaries or pass --pdfium-path"
                ))
            })?,
        };
        Ok(Pdfium::new(bindings))
    }
}

impl PdfBackend for PdfiumBackend {
    fn visit_pages(
        &self,
        path: &Path,
        visit: &mut dyn FnMut(PageResult) -> ControlFlow<()>,
    ) -> Result<u32, BackendError> {
        if !path.is_file() {
            return Err(BackendError::Open {
                path: path.to_path_buf(),
                reason: "file does not exist".into(),
            });
        }
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| BackendError::Open {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let pages = document.pages();
        let count = pages.len();
        for idx in 0..count {
            let page_num = idx as u32 + 1;
            let result = pages
                .get(idx)
                .map_err(|e| PageFailure {
                    page_num,
                    message: format!("failed to load page: {e}"),
                })
                .and_then(|page| read_page(page_num, &page));
            if visit(result).is_break() {
                break;
            }
        }
        Ok(count as u32)
    }
}

fn read_page(page_num: u32, page: &PdfPage) -> PageResult {
    let text_page = page.text().map_err(|e| PageFailure {
        page_num,
        message: format!("failed to load text layer: {e}"),
    })?;

    let chars: Vec<PdfChar> = text_page
        .chars()
        .iter()
        .filter_map(|ch| convert_text_char(&ch))
        .collect();

    let links = page.links().iter().filter_map(|link| convert_link(&link)).collect();

    Ok(PageContent {
        chars: PageChars {
            page_num,
            width: page.width().value,
            height: page.height().value,
            chars,
        },
        links,
    })
}

fn convert_text_char(ch: &PdfPageTextChar) -> Option<PdfChar> {
    let unicode = ch.unicode_char()?;
    if unicode.is_control() && unicode != ' ' {
        return None;
    }

    // Skip zero-size font characters (watermarks, hidden text)
    let font_size = ch.scaled_font_size().value;
    if font_size < 0.5 {
        return None;
    }

    let rect = ch.loose_bounds().or_else(|_| ch.tight_bounds()).ok()?;
    Some(PdfChar {
        ch: unicode,
        x: rect.left().value,
        y: rect.bottom().value,
        width: (rect.right().value - rect.left().value).abs(),
        height: (rect.top().value - rect.bottom().value).abs(),
        font_size,
    })
}

fn convert_link(link: &PdfLink) -> Option<LinkAnnotation> {
    let rect = link.rect().ok()?;
    let rect = BBox::new(
        rect.left().value,
        rect.bottom().value,
        rect.right().value,
        rect.top().value,
    );
    let (dest_page, dest_y) = match link.destination() {
        Some(dest) => {
            let page = dest.page_index().ok().map(|idx| idx as u32 + 1);
            let y = dest.view_settings().ok().and_then(|view| match view {
                PdfDestinationViewSettings::SpecificCoordinatesAndZoom(_, y, _) => y.map(|p| p.value),
                PdfDestinationViewSettings::FitPageHorizontallyToWindow(y) => y.map(|p| p.value),
                PdfDestinationViewSettings::FitBoundsHorizontallyToWindow(y) => y.map(|p| p.value),
                _ => None,
            });
            (page, y)
        }
        None => (None, None),
    };
    Some(LinkAnnotation { rect, dest_page, dest_y })
}

/// Pages already held in memory. Ignores the path it is given and reports
/// the highest page number seen as the page count.
#[derive(Debug, Clone, Default)]
pub struct StaticPages {
    pages: Vec<PageResult>,
}

impl StaticPages {
    pub fn new(pages: Vec<PageResult>) -> Self {
        Self { pages }
    }

    pub fn from_pages(pages: Vec<PageContent>) -> Self {
        Self::new(pages.into_iter().map(Ok).collect())
    }
}

impl PdfBackend for StaticPages {
    fn visit_pages(
        &self,
        _path: &Path,
        visit: &mut dyn FnMut(PageResult) -> ControlFlow<()>,
    ) -> Result<u32, BackendError> {
        for page in &self.pages {
            if visit(page.clone()).is_break() {
                break;
            }
        }
        let last = self.pages.iter().map(|page| match page {
            Ok(content) => content.page_num(),
            Err(failure) => failure.page_num,
        });
        Ok(last.max().unwrap_or(0))
    }
}

/// A run of text laid out left to right from `(x, y)`.
#[derive(Debug, Clone)]
pub struct TextRun {
    pub x: f32,
    pub y: f32,
    pub text: String,
    pub font_size: f32,
}

impl TextRun {
    pub fn new(x: f32, y: f32, text: &str) -> Self {
        Self { x, y, text: text.to_string(), font_size: 10.0 }
    }

    pub fn sized(mut self, font_size: f32) -> Self {
        self.font_size = font_size;
        self
    }
}

/// Build a US-letter page from text runs using a fixed-pitch advance of half
/// the font size per character.
pub fn typeset_page(page_num: u32, runs: &[TextRun], links: Vec<LinkAnnotation>) -> PageContent {
    let mut chars = Vec::new();
    for run in runs {
        let advance = run.font_size * 0.5;
        for (i, ch) in run.text.chars().enumerate() {
            chars.push(PdfChar {
                ch,
                x: run.x + advance * i as f32,
                y: run.y,
                width: advance,
                height: run.font_size,
                font_size: run.font_size,
            });
        }
        chars.push(PdfChar {
            ch: ' ',
            x: run.x + advance * run.text.chars().count() as f32,
            y: run.y,
            width: advance,
            height: run.font_size,
            font_size: run.font_size,
        });
    }
    PageContent {
        chars: PageChars { page_num, width: 612.0, height: 792.0, chars },
        links,
    }
}

/// Box covering characters `start..end` of `run` as laid out by [`typeset_page`].
pub fn run_char_box(run: &TextRun, start: usize, end: usize) -> BBox {
    let advance = run.font_size * 0.5;
    BBox::new(
        run.x + advance * start as f32,
        run.y,
        run.x + advance * end as f32,
        run.y + run.font_size,
    )
}
