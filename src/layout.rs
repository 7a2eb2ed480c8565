use std::ops::Range;

use crate::geometry::{BBox, union_all};
use crate::types::{Line, PageChars, PdfChar, Word};

/// Group characters into words and lines in reading order for a single page.
///
/// Two-column pages come back as the left column (top to bottom) followed
/// by the right column.
pub fn group_page(page: &PageChars) -> Vec<Line> {
    if page.chars.is_empty() {
        return Vec::new();
    }

    let avg_char_width = compute_avg_char_width(page);
    let dominant_font_size = compute_dominant_font_size(page);

    let words = group_chars_into_words(page, avg_char_width, dominant_font_size);
    let lines = group_words_into_lines(&words);
    split_columns(lines, page.width)
}

fn compute_avg_char_width(page: &PageChars) -> f32 {
    let widths: Vec<f32> = page
        .chars
        .iter()
        .filter(|c| c.width > 0.0)
        .map(|c| c.width)
        .collect();
    if widths.is_empty() {
        return 5.0;
    }
    widths.iter().sum::<f32>() / widths.len() as f32
}

fn compute_dominant_font_size(page: &PageChars) -> f32 {
    let mut size_counts: Vec<(i32, usize)> = Vec::new();
    for ch in page.chars.iter().filter(|c| !c.ch.is_whitespace()) {
        let key = (ch.font_size * 10.0) as i32;
        if let Some(entry) = size_counts.iter_mut().find(|(k, _)| *k == key) {
            entry.1 += 1;
        } else {
            size_counts.push((key, 1));
        }
    }
    size_counts
        .iter()
        .max_by_key(|(_, count)| *count)
        .map(|(key, _)| *key as f32 / 10.0)
        .unwrap_or(10.0)
}

fn is_superscript(ch_size: f32, dominant_size: f32) -> bool {
    ch_size < dominant_size * 0.75
}

struct WordAccum {
    text: String,
    glyphs: Vec<BBox>,
    x: f32,
    y: f32,
    max_x: f32,
    max_y: f32,
    font_size: f32,
    prev_right: f32,
}

impl WordAccum {
    fn new() -> Self {
        Self {
            text: String::new(),
            glyphs: Vec::new(),
            x: 0.0,
            y: 0.0,
            max_x: 0.0,
            max_y: 0.0,
            font_size: 0.0,
            prev_right: 0.0,
        }
    }

    fn start_char(&mut self, ch: &PdfChar) {
        self.x = ch.x;
        self.y = ch.y;
        self.max_x = ch.x + ch.width;
        self.max_y = ch.y + ch.height;
        self.font_size = ch.font_size;
    }

    fn extend_char(&mut self, ch: &PdfChar) {
        self.x = self.x.min(ch.x);
        self.y = self.y.min(ch.y);
        self.max_x = self.max_x.max(ch.x + ch.width);
        self.max_y = self.max_y.max(ch.y + ch.height);
    }

    fn push(&mut self, ch: &PdfChar) {
        if self.text.is_empty() {
            self.start_char(ch);
        } else {
            self.extend_char(ch);
        }
        self.text.push(ch.ch);
        self.glyphs.push(BBox::from_origin(ch.x, ch.y, ch.width, ch.height));
        self.prev_right = ch.x + ch.width;
    }

    fn flush(&mut self, words: &mut Vec<Word>, dominant_font_size: f32) {
        if self.text.is_empty() {
            return;
        }
        words.push(Word {
            text: std::mem::take(&mut self.text),
            x: self.x,
            y: self.y,
            width: self.max_x - self.x,
            height: self.max_y - self.y,
            font_size: self.font_size,
            is_superscript: is_superscript(self.font_size, dominant_font_size),
            glyphs: std::mem::take(&mut self.glyphs),
        });
    }
}

fn group_chars_into_words(
    page: &PageChars,
    avg_char_width: f32,
    dominant_font_size: f32,
) -> Vec<Word> {
    let mut words = Vec::new();
    let gap_threshold = avg_char_width * 0.3;
    let mut acc = WordAccum::new();

    for ch in &page.chars {
        if ch.ch.is_whitespace() {
            acc.flush(&mut words, dominant_font_size);
            acc.prev_right = ch.x + ch.width;
            continue;
        }
        // A change between body and superscript size starts a new word so
        // "models¹²" yields a separate "12".
        let size_class_changed = !acc.text.is_empty()
            && is_superscript(ch.font_size, dominant_font_size)
                != is_superscript(acc.font_size, dominant_font_size);
        let is_break = (ch.x - acc.prev_right) > gap_threshold
            || (ch.y - acc.y).abs() > dominant_font_size * 0.5
            || size_class_changed;
        if is_break {
            acc.flush(&mut words, dominant_font_size);
        }
        acc.push(ch);
    }
    acc.flush(&mut words, dominant_font_size);
    words
}

fn group_words_into_lines(words: &[Word]) -> Vec<Line> {
    let mut lines: Vec<Line> = Vec::new();

    for word in words {
        let merged = lines.iter_mut().rev().take(5).find(|line| {
            (word.y - line.y).abs() < word.font_size.max(line.font_size) * 0.5
        });

        if let Some(line) = merged {
            line.words.push(word.clone());
            line.x_start = line.x_start.min(word.x);
            line.x_end = line.x_end.max(word.x + word.width);
        } else {
            lines.push(Line {
                words: vec![word.clone()],
                y: word.y,
                x_start: word.x,
                x_end: word.x + word.width,
                font_size: word.font_size,
            });
        }
    }

    for line in &mut lines {
        line.words.sort_by(|a, b| a.x.total_cmp(&b.x));
    }
    // Top to bottom = high y to low y in PDF coords
    lines.sort_by(|a, b| b.y.total_cmp(&a.y));
    lines
}

/// Detect two-column layout and split lines into reading order.
fn split_columns(lines: Vec<Line>, page_width: f32) -> Vec<Line> {
    let Some(boundary) = detect_column_boundary(&lines, page_width) else {
        return lines;
    };

    let mut left_lines = Vec::new();
    let mut right_lines = Vec::new();

    for line in &lines {
        let (left_words, right_words) = partition_words(&line.words, boundary);
        if let Some(l) = make_line(left_words, line.y, line.font_size) {
            left_lines.push(l);
        }
        if let Some(l) = make_line(right_words, line.y, line.font_size) {
            right_lines.push(l);
        }
    }

    left_lines.extend(right_lines);
    left_lines
}

/// Find the x-coordinate of a column gap, if the page is two-column.
///
/// Looks for a vertical strip in the middle 30-70% of the page where
/// no words exist, but words exist on both sides.
fn detect_column_boundary(lines: &[Line], page_width: f32) -> Option<f32> {
    if page_width <= 0.0 || lines.len() < 4 {
        return None;
    }
    let n_buckets = 200;
    let bucket_width = page_width / n_buckets as f32;
    let mut coverage = vec![0u32; n_buckets];

    for line in lines {
        for word in &line.words {
            let start = ((word.x / page_width).max(0.0) * n_buckets as f32) as usize;
            let end = (((word.x + word.width) / page_width).max(0.0) * n_buckets as f32) as usize;
            for bucket in &mut coverage[start.min(n_buckets - 1)..=end.min(n_buckets - 1)] {
                *bucket += 1;
            }
        }
    }

    let boundary = find_gap_in_coverage(&coverage, bucket_width, lines.len())?;
    let both_sides = |line: &Line| {
        line.words.iter().any(|w| w.x + w.width < boundary)
            && line.words.iter().any(|w| w.x > boundary)
    };
    // A gap only counts when text sits on both sides of it on several lines.
    if lines.iter().filter(|l| both_sides(l)).count() * 4 < lines.len() {
        return None;
    }
    Some(boundary)
}

fn find_gap_in_coverage(coverage: &[u32], bucket_width: f32, num_lines: usize) -> Option<f32> {
    let n_buckets = coverage.len();
    let search_start = n_buckets * 30 / 100;
    let search_end = n_buckets * 70 / 100;
    let threshold = (num_lines as u32) / 10;

    let mut best_gap_start = 0;
    let mut best_gap_len = 0;
    let mut gap_start = 0;
    let mut in_gap = false;

    for (i, &val) in coverage[search_start..search_end].iter().enumerate() {
        let i = i + search_start;
        if val <= threshold {
            if !in_gap {
                gap_start = i;
                in_gap = true;
            }
            let gap_len = i - gap_start + 1;
            if gap_len > best_gap_len {
                best_gap_len = gap_len;
                best_gap_start = gap_start;
            }
        } else {
            in_gap = false;
        }
    }

    if best_gap_len < 1 {
        return None;
    }

    let gap_center = (best_gap_start as f32 + best_gap_len as f32 / 2.0) * bucket_width;
    Some(gap_center)
}

fn partition_words(words: &[Word], boundary: f32) -> (Vec<Word>, Vec<Word>) {
    words
        .iter()
        .cloned()
        .partition(|word| word.x + word.width / 2.0 < boundary)
}

fn make_line(words: Vec<Word>, y: f32, font_size: f32) -> Option<Line> {
    let x_start = words.iter().map(|w| w.x).reduce(f32::min)?;
    let x_end = words.iter().map(|w| w.x + w.width).reduce(f32::max)?;
    Some(Line { words, y, x_start, x_end, font_size })
}

/// Flattened page text with a box for every glyph, so regex matches over
/// the text can be mapped back to page geometry.
#[derive(Debug, Clone, Default)]
pub struct PageText {
    pub text: String,
    /// Byte offset of each glyph in `text`, ascending, with its box.
    glyphs: Vec<(usize, BBox)>,
    /// Byte range of each line in `text`, with the source line's baseline.
    lines: Vec<(Range<usize>, f32)>,
}

impl PageText {
    /// Lines are joined with `'\n'`, words with a single space.
    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a Line>) -> Self {
        let mut page = PageText::default();
        for line in lines {
            if !page.text.is_empty() {
                page.text.push('\n');
            }
            let start = page.text.len();
            for (w_idx, word) in line.words.iter().enumerate() {
                if w_idx > 0 {
                    page.text.push(' ');
                }
                for (ch, glyph) in word.text.chars().zip(word.glyphs.iter()) {
                    page.glyphs.push((page.text.len(), *glyph));
                    page.text.push(ch);
                }
            }
            page.lines.push((start..page.text.len(), line.y));
        }
        page
    }

    /// Union of glyph boxes whose byte offset falls inside `range`.
    pub fn bbox_for(&self, range: Range<usize>) -> Option<BBox> {
        let first = self.glyphs.partition_point(|(offset, _)| *offset < range.start);
        let boxes: Vec<BBox> = self.glyphs[first..]
            .iter()
            .take_while(|(offset, _)| *offset < range.end)
            .map(|(_, b)| *b)
            .collect();
        union_all(&boxes)
    }

    /// Text of the highest line starting at or below `y`, at most `max_drop`
    /// points down. Link destinations point at the top of their target.
    pub fn line_below(&self, y: f32, max_drop: f32) -> Option<&str> {
        self.lines
            .iter()
            .filter(|(_, line_y)| *line_y <= y + 1.0 && y - *line_y <= max_drop)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(range, _)| &self.text[range.clone()])
    }
}

/// Characters whose glyph centre lies inside `rect`, words separated by spaces.
pub fn text_in_rect(lines: &[Line], rect: &BBox) -> String {
    let padded = BBox::new(rect.x1 - 1.0, rect.y1 - 1.0, rect.x2 + 1.0, rect.y2 + 1.0);
    let mut parts: Vec<String> = Vec::new();
    for line in lines {
        for word in &line.words {
            let inside: String = word
                .text
                .chars()
                .zip(word.glyphs.iter())
                .filter(|(_, g)| {
                    let (cx, cy) = g.center();
                    padded.contains_point(cx, cy)
                })
                .map(|(c, _)| c)
                .collect();
            if !inside.is_empty() {
                parts.push(inside);
            }
        }
    }
    parts.join(" ")
}
