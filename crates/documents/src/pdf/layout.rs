use std::ops::Range;

use lopdf::content::Operation;
use lopdf::{Object, StringFormat};

use crate::charset::encode_legacy;

pub(crate) const PAGE_WIDTH: f32 = 595.0;
pub(crate) const PAGE_HEIGHT: f32 = 842.0;
const MARGIN: f32 = 50.0;
const BOTTOM_LIMIT: f32 = 60.0;
const CONTENT_WIDTH: f32 = PAGE_WIDTH - 2.0 * MARGIN;

pub(crate) const REGULAR_FONT: &str = "F1";
pub(crate) const BOLD_FONT: &str = "F2";

const HEADER_SIZE: f32 = 20.0;
const INFO_SIZE: f32 = 13.0;
const REASON_SIZE: f32 = 12.0;
const TABLE_HEADER_SIZE: f32 = 11.0;
const CELL_SIZE: f32 = 10.0;
const CELL_LEADING: f32 = 13.0;
const CELL_PADDING: f32 = 6.0;
const TABLE_HEADER_HEIGHT: f32 = 24.0;

/// Column widths as fractions of the content width: date, description, reference, price.
const COLUMN_FRACTIONS: [f32; 4] = [0.15, 0.45, 0.20, 0.20];

pub(crate) struct Summary {
    pub header: String,
    pub info: Vec<String>,
    pub status: Vec<String>,
    pub reason: String,
    pub columns: [String; 4],
    pub rows: Vec<SummaryRow>,
    pub total: String,
}

pub(crate) struct SummaryRow {
    pub date: String,
    pub description: String,
    pub reference: String,
    pub price: String,
}

pub(crate) fn real(value: f32) -> Object {
    Object::Real(value.into())
}

fn name(value: &str) -> Object {
    Object::Name(value.as_bytes().to_vec())
}

pub(crate) fn text(font: &str, size: f32, x: f32, y: f32, value: &str) -> Vec<Operation> {
    vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec![name(font), real(size)]),
        Operation::new("Td", vec![real(x), real(y)]),
        Operation::new("Tj", vec![Object::String(encode_legacy(value), StringFormat::Literal)]),
        Operation::new("ET", vec![]),
    ]
}

fn fill_rect(x: f32, y: f32, width: f32, height: f32, gray: f32) -> Vec<Operation> {
    vec![
        Operation::new("q", vec![]),
        Operation::new("g", vec![real(gray)]),
        Operation::new("re", vec![real(x), real(y), real(width), real(height)]),
        Operation::new("f", vec![]),
        Operation::new("Q", vec![]),
    ]
}

fn rule(x: f32, y: f32, width: f32, gray: f32) -> Vec<Operation> {
    vec![
        Operation::new("q", vec![]),
        Operation::new("G", vec![real(gray)]),
        Operation::new("w", vec![real(0.6)]),
        Operation::new("m", vec![real(x), real(y)]),
        Operation::new("l", vec![real(x + width), real(y)]),
        Operation::new("S", vec![]),
        Operation::new("Q", vec![]),
    ]
}

/// Rough Helvetica advance; good enough for wrapping and right alignment.
pub(crate) fn approx_width(value: &str, size: f32) -> f32 {
    value.chars().count() as f32 * size * 0.52
}

/// Greedy word wrap. Explicit newlines are kept and words longer than a line are split.
pub(crate) fn wrap(value: &str, max_width: f32, size: f32) -> Vec<String> {
    let max_chars = ((max_width / (size * 0.52)).floor() as usize).max(1);
    let mut lines = Vec::new();

    for paragraph in value.lines() {
        let mut line = String::new();
        for word in paragraph.split_whitespace() {
            let mut word: Vec<char> = word.chars().collect();
            while word.len() > max_chars {
                if !line.is_empty() {
                    lines.push(std::mem::take(&mut line));
                }
                lines.push(word.drain(..max_chars).collect());
            }
            let word: String = word.into_iter().collect();
            if word.is_empty() {
                continue;
            }
            let needed = line.chars().count() + usize::from(!line.is_empty()) + word.chars().count();
            if needed > max_chars && !line.is_empty() {
                lines.push(std::mem::take(&mut line));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(&word);
        }
        lines.push(line);
    }

    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

struct Canvas {
    pages: Vec<Vec<Operation>>,
    current: Vec<Operation>,
    cursor: f32,
}

impl Canvas {
    fn new() -> Self {
        Self { pages: Vec::new(), current: Vec::new(), cursor: PAGE_HEIGHT - MARGIN }
    }

    fn fits(&self, height: f32) -> bool {
        self.cursor - height >= BOTTOM_LIMIT
    }

    fn break_page(&mut self) {
        self.pages.push(std::mem::take(&mut self.current));
        self.cursor = PAGE_HEIGHT - MARGIN;
    }

    fn line(&mut self, font: &str, size: f32, value: &str) {
        let leading = size * 1.4;
        if !self.fits(leading) {
            self.break_page();
        }
        self.cursor -= leading;
        self.current.extend(text(font, size, MARGIN, self.cursor, value));
    }

    fn gap(&mut self, height: f32) {
        self.cursor -= height;
    }

    fn finish(mut self) -> Vec<Vec<Operation>> {
        if !self.current.is_empty() || self.pages.is_empty() {
            self.pages.push(self.current);
        }
        self.pages
    }
}

fn column_offsets() -> [(f32, f32); 4] {
    let mut x = MARGIN;
    let mut offsets = [(0.0, 0.0); 4];
    for (slot, fraction) in offsets.iter_mut().zip(COLUMN_FRACTIONS) {
        let width = CONTENT_WIDTH * fraction;
        *slot = (x, width);
        x += width;
    }
    offsets
}

fn table_header(canvas: &mut Canvas, columns: &[String; 4]) {
    let height = TABLE_HEADER_HEIGHT;
    if !canvas.fits(height) {
        canvas.break_page();
    }
    let top = canvas.cursor;
    canvas.current.extend(fill_rect(MARGIN, top - height, CONTENT_WIDTH, height, 0.95));
    for (index, ((x, width), label)) in column_offsets().iter().zip(columns).enumerate() {
        let baseline = top - 16.0;
        let left = if index == 3 {
            x + width - CELL_PADDING - approx_width(label, TABLE_HEADER_SIZE)
        } else {
            x + CELL_PADDING
        };
        canvas.current.extend(text(BOLD_FONT, TABLE_HEADER_SIZE, left, baseline, label));
    }
    canvas.current.extend(rule(MARGIN, top - height, CONTENT_WIDTH, 0.7));
    canvas.cursor = top - height;
}

fn table_row(canvas: &mut Canvas, row: &SummaryRow, shaded: bool, columns: &[String; 4]) {
    let offsets = column_offsets();
    let cells = [
        wrap(&row.date, offsets[0].1 - 2.0 * CELL_PADDING, CELL_SIZE),
        wrap(&row.description, offsets[1].1 - 2.0 * CELL_PADDING, CELL_SIZE),
        wrap(&row.reference, offsets[2].1 - 2.0 * CELL_PADDING, CELL_SIZE),
        vec![row.price.clone()],
    ];
    let line_count = cells.iter().map(Vec::len).max().unwrap_or(1);

    // Rows that fit on a page are kept together; taller rows are split across pages.
    let page_room = rows_that_fit(PAGE_HEIGHT - MARGIN - TABLE_HEADER_HEIGHT);
    if line_count <= page_room && rows_that_fit(canvas.cursor) < line_count {
        canvas.break_page();
        table_header(canvas, columns);
    }

    let mut start = 0;
    while start < line_count {
        let room = rows_that_fit(canvas.cursor);
        if room == 0 {
            canvas.break_page();
            table_header(canvas, columns);
            continue;
        }
        let end = line_count.min(start + room);
        draw_row_lines(canvas, &offsets, &cells, start..end, shaded);
        start = end;
        if start < line_count {
            canvas.break_page();
            table_header(canvas, columns);
        }
    }
}

/// Cell lines that fit between `cursor` and the bottom margin.
fn rows_that_fit(cursor: f32) -> usize {
    let available = cursor - BOTTOM_LIMIT - 2.0 * CELL_PADDING;
    if available < CELL_LEADING {
        0
    } else {
        (available / CELL_LEADING).floor() as usize
    }
}

fn draw_row_lines(
    canvas: &mut Canvas,
    offsets: &[(f32, f32); 4],
    cells: &[Vec<String>; 4],
    lines: Range<usize>,
    shaded: bool,
) {
    let height = lines.len() as f32 * CELL_LEADING + 2.0 * CELL_PADDING;
    let top = canvas.cursor;
    if shaded {
        canvas.current.extend(fill_rect(MARGIN, top - height, CONTENT_WIDTH, height, 0.98));
    }
    for (index, ((x, width), cell)) in offsets.iter().zip(cells).enumerate() {
        let visible = cell.iter().skip(lines.start).take(lines.len());
        for (line_index, line) in visible.enumerate() {
            let baseline = top - CELL_PADDING - CELL_SIZE - line_index as f32 * CELL_LEADING;
            let left = if index == 3 {
                x + width - CELL_PADDING - approx_width(line, CELL_SIZE)
            } else {
                x + CELL_PADDING
            };
            canvas.current.extend(text(REGULAR_FONT, CELL_SIZE, left, baseline, line));
        }
    }
    canvas.current.extend(rule(MARGIN, top - height, CONTENT_WIDTH, 0.88));
    canvas.cursor = top - height;
}

fn total_row(canvas: &mut Canvas, total: &str) {
    let height = 26.0;
    if !canvas.fits(height) {
        canvas.break_page();
    }
    let top = canvas.cursor;
    canvas.current.extend(fill_rect(MARGIN, top - height, CONTENT_WIDTH, height, 0.91));
    canvas.current.extend(text(BOLD_FONT, TABLE_HEADER_SIZE, MARGIN + CELL_PADDING, top - 17.0, "Total"));
    let right = MARGIN + CONTENT_WIDTH - CELL_PADDING - approx_width(total, TABLE_HEADER_SIZE);
    canvas.current.extend(text(BOLD_FONT, TABLE_HEADER_SIZE, right, top - 17.0, total));
    canvas.cursor = top - height;
}

/// Lays out the form and returns the content operations of each summary page.
pub(crate) fn summary_pages(summary: &Summary) -> Vec<Vec<Operation>> {
    let mut canvas = Canvas::new();

    for line in wrap(&summary.header, CONTENT_WIDTH, HEADER_SIZE) {
        canvas.line(BOLD_FONT, HEADER_SIZE, &line);
    }
    canvas.gap(12.0);

    for info in summary.info.iter().chain(&summary.status) {
        for line in wrap(info, CONTENT_WIDTH, INFO_SIZE) {
            canvas.line(REGULAR_FONT, INFO_SIZE, &line);
        }
    }
    canvas.gap(8.0);

    for line in wrap(&summary.reason, CONTENT_WIDTH, REASON_SIZE) {
        canvas.line(REGULAR_FONT, REASON_SIZE, &line);
    }
    canvas.gap(20.0);

    table_header(&mut canvas, &summary.columns);
    for (index, row) in summary.rows.iter().enumerate() {
        table_row(&mut canvas, row, index % 2 == 1, &summary.columns);
    }
    total_row(&mut canvas, &summary.total);

    canvas.finish()
}
