//! A4 report with a branded header and an image/analysis table.

use super::layout::{self, ReportBranding, TABLE_HEADERS};
use super::{RenderSummary, ReportError, ReportRenderer};
use crate::models::{ArtifactKind, ResultRecord};
use image::ImageFormat;
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, dictionary};
use std::io::Cursor;
use std::path::Path;
use tracing::warn;

const PAGE_WIDTH: i64 = 595;
const PAGE_HEIGHT: i64 = 842;
const MARGIN_X: i64 = 50;
const MARGIN_TOP: i64 = 42;
const MARGIN_BOTTOM: i64 = 42;
const IMAGE_COL_WIDTH: i64 = 170;
const TEXT_COL_WIDTH: i64 = PAGE_WIDTH - 2 * MARGIN_X - IMAGE_COL_WIDTH;
const HEADER_ROW_HEIGHT: i64 = 22;
const CELL_PAD: i64 = 6;
const IMAGE_BOX: i64 = 150;
const BODY_SIZE: i64 = 9;
const LINE_HEIGHT: i64 = 12;
const WRAP_COLUMNS: usize = 68;
const THUMBNAIL_PX: u32 = 300;
/// Space taken on the first page by the title, taglines and contact block.
const BRAND_BLOCK_HEIGHT: i64 = 120;

pub struct PdfRenderer {
    branding: ReportBranding,
}

impl PdfRenderer {
    pub fn new(branding: ReportBranding) -> Self {
        Self { branding }
    }
}

impl ReportRenderer for PdfRenderer {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::TabularDocument
    }

    fn render(&self, records: &[ResultRecord], output: &Path) -> Result<RenderSummary, ReportError> {
        let images: Vec<Option<Thumbnail>> = records
            .iter()
            .map(|record| Thumbnail::load(&record.local_image_path))
            .collect();
        let cells: Vec<CellText> = records
            .iter()
            .zip(&images)
            .map(|(record, image)| CellText {
                lines: layout::wrap_text(&layout::normalize_text(&record.analysis_text), WRAP_COLUMNS),
                image_height: image.as_ref().map(|thumb| thumb.display.1),
            })
            .collect();

        let body = PAGE_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM - HEADER_ROW_HEIGHT;
        let pages = paginate(&cells, body - BRAND_BLOCK_HEIGHT, body);

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let regular = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });
        let bold = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica-Bold",
            "Encoding" => "WinAnsiEncoding",
        });

        let mut xobjects = Dictionary::new();
        let mut embedded = 0;
        for (idx, image) in images.iter().enumerate() {
            if let Some(thumb) = image {
                let id = doc.add_object(thumb.to_stream());
                xobjects.set(image_name(idx), id);
                embedded += 1;
            }
        }
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => regular, "F2" => bold },
            "XObject" => xobjects,
        });

        let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
        for (page_no, page) in pages.iter().enumerate() {
            let mut ops = Vec::new();
            let mut top = PAGE_HEIGHT - MARGIN_TOP;
            if page_no == 0 {
                brand_block(&mut ops, &self.branding, top);
                top -= BRAND_BLOCK_HEIGHT;
            }
            header_row(&mut ops, top);
            top -= HEADER_ROW_HEIGHT;
            for row in &page.rows {
                let thumb = if row.with_image {
                    images[row.record].as_ref()
                } else {
                    None
                };
                body_row(&mut ops, row, thumb, &cells[row.record].lines, top);
                top -= row.height;
            }
            let content = Content { operations: ops }
                .encode()
                .map_err(|err| ReportError::Pdf(err.to_string()))?;
            let content_id = doc.add_object(Stream::new(dictionary! {}, content));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }

        let page_count = kids.len();
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => page_count as i64,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
            }),
        );
        let catalog_id: ObjectId = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.save(output)
            .map_err(|err| ReportError::Pdf(err.to_string()))?;

        Ok(RenderSummary {
            rows: records.len(),
            images_embedded: embedded,
            pages: page_count,
        })
    }
}

struct Thumbnail {
    jpeg: Vec<u8>,
    pixels: (u32, u32),
    display: (i64, i64),
}

impl Thumbnail {
    fn load(path: &Path) -> Option<Self> {
        let loaded = image::open(path)
            .map(|img| img.thumbnail(THUMBNAIL_PX, THUMBNAIL_PX).to_rgb8())
            .map_err(|err| {
                warn!(
                    target = "appraisal.report",
                    path = %path.display(),
                    error = %err,
                    "pdf_image_skipped"
                );
            })
            .ok()?;
        let (w, h) = loaded.dimensions();
        let mut jpeg = Vec::new();
        image::DynamicImage::ImageRgb8(loaded)
            .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .ok()?;
        let scale = (IMAGE_BOX as f64 / w.max(1) as f64).min(IMAGE_BOX as f64 / h.max(1) as f64);
        let display = (
            ((w as f64 * scale).round() as i64).max(1),
            ((h as f64 * scale).round() as i64).max(1),
        );
        Some(Self {
            jpeg,
            pixels: (w, h),
            display,
        })
    }

    fn to_stream(&self) -> Stream {
        Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => self.pixels.0 as i64,
                "Height" => self.pixels.1 as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            self.jpeg.clone(),
        )
    }
}

fn image_name(record: usize) -> String {
    format!("Im{record}")
}

struct CellText {
    lines: Vec<String>,
    image_height: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
struct PlannedRow {
    record: usize,
    first_line: usize,
    line_count: usize,
    with_image: bool,
    height: i64,
}

#[derive(Debug, Default)]
struct PlannedPage {
    rows: Vec<PlannedRow>,
}

fn text_height(lines: usize) -> i64 {
    lines.max(1) as i64 * LINE_HEIGHT + 2 * CELL_PAD
}

/// Splits rows over pages. A record whose text does not fit continues on
/// the next page without its image; an image never splits.
fn paginate(cells: &[CellText], first_capacity: i64, capacity: i64) -> Vec<PlannedPage> {
    let mut pages = vec![PlannedPage::default()];
    let mut available = first_capacity;

    for (record, cell) in cells.iter().enumerate() {
        let total = cell.lines.len().max(1);
        let mut next_line = 0;
        let mut with_image = cell.image_height.is_some();
        loop {
            let image_floor = if with_image {
                cell.image_height.unwrap_or(0) + 2 * CELL_PAD
            } else {
                0
            };
            let fit_lines = ((available - 2 * CELL_PAD) / LINE_HEIGHT).max(0) as usize;
            let page_has_rows = pages.last().is_some_and(|page| !page.rows.is_empty());
            if (fit_lines == 0 || available < image_floor) && page_has_rows {
                pages.push(PlannedPage::default());
                available = capacity;
                continue;
            }

            let remaining = total - next_line;
            let take = remaining.min(fit_lines.max(1));
            let height = text_height(take).max(image_floor);
            if let Some(page) = pages.last_mut() {
                page.rows.push(PlannedRow {
                    record,
                    first_line: next_line,
                    line_count: take,
                    with_image,
                    height,
                });
            }
            available -= height;
            next_line += take;
            with_image = false;
            if next_line >= total {
                break;
            }
            pages.push(PlannedPage::default());
            available = capacity;
        }
    }
    pages
}

fn text(ops: &mut Vec<Operation>, font: &str, size: i64, x: i64, y: i64, value: &str) {
    ops.push(Operation::new("BT", vec![]));
    ops.push(Operation::new("Tf", vec![font.into(), size.into()]));
    ops.push(Operation::new("Td", vec![x.into(), y.into()]));
    ops.push(Operation::new("Tj", vec![Object::string_literal(win_ansi(value))]));
    ops.push(Operation::new("ET", vec![]));
}

fn centered(ops: &mut Vec<Operation>, font: &str, size: i64, y: i64, value: &str) {
    // Helvetica averages roughly half an em per glyph.
    let approx_width = value.chars().count() as i64 * size / 2;
    let x = ((PAGE_WIDTH - approx_width) / 2).max(MARGIN_X);
    text(ops, font, size, x, y, value);
}

fn brand_block(ops: &mut Vec<Operation>, branding: &ReportBranding, top: i64) {
    let mut y = top - 12;
    ops.push(Operation::new("g", vec![Object::Real(0.5)]));
    for line in &branding.contact_lines {
        text(ops, "F1", 9, MARGIN_X, y, line);
        y -= 11;
    }

    // #D97757
    ops.push(Operation::new(
        "rg",
        vec![Object::Real(0.851), Object::Real(0.467), Object::Real(0.341)],
    ));
    let mut y = top - 48;
    centered(ops, "F2", 20, y, &branding.title);
    ops.push(Operation::new("g", vec![0.into()]));
    y -= 20;
    for tagline in &branding.taglines {
        centered(ops, "F1", 11, y, tagline);
        y -= 14;
    }
}

fn header_row(ops: &mut Vec<Operation>, top: i64) {
    let y = top - HEADER_ROW_HEIGHT;
    let width = IMAGE_COL_WIDTH + TEXT_COL_WIDTH;
    ops.push(Operation::new("q", vec![]));
    ops.push(Operation::new("g", vec![Object::Real(0.8)]));
    ops.push(Operation::new(
        "re",
        vec![MARGIN_X.into(), y.into(), width.into(), HEADER_ROW_HEIGHT.into()],
    ));
    ops.push(Operation::new("f", vec![]));
    ops.push(Operation::new("Q", vec![]));
    grid(ops, y, HEADER_ROW_HEIGHT);
    text(ops, "F2", 10, MARGIN_X + CELL_PAD, y + 7, TABLE_HEADERS[0]);
    text(
        ops,
        "F2",
        10,
        MARGIN_X + IMAGE_COL_WIDTH + CELL_PAD,
        y + 7,
        TABLE_HEADERS[1],
    );
}

fn body_row(
    ops: &mut Vec<Operation>,
    row: &PlannedRow,
    thumb: Option<&Thumbnail>,
    lines: &[String],
    top: i64,
) {
    let y = top - row.height;
    grid(ops, y, row.height);

    if let Some(thumb) = thumb {
        let (w, h) = thumb.display;
        let x = MARGIN_X + (IMAGE_COL_WIDTH - w) / 2;
        let img_y = top - CELL_PAD - h;
        ops.push(Operation::new("q", vec![]));
        ops.push(Operation::new(
            "cm",
            vec![w.into(), 0.into(), 0.into(), h.into(), x.into(), img_y.into()],
        ));
        ops.push(Operation::new("Do", vec![Object::Name(image_name(row.record).into_bytes())]));
        ops.push(Operation::new("Q", vec![]));
    }

    let x = MARGIN_X + IMAGE_COL_WIDTH + CELL_PAD;
    let mut line_y = top - CELL_PAD - BODY_SIZE;
    for line in lines.iter().skip(row.first_line).take(row.line_count) {
        if !line.is_empty() {
            text(ops, "F1", BODY_SIZE, x, line_y, line);
        }
        line_y -= LINE_HEIGHT;
    }
}

fn grid(ops: &mut Vec<Operation>, y: i64, height: i64) {
    ops.push(Operation::new("w", vec![Object::Real(0.5)]));
    ops.push(Operation::new(
        "re",
        vec![MARGIN_X.into(), y.into(), IMAGE_COL_WIDTH.into(), height.into()],
    ));
    ops.push(Operation::new(
        "re",
        vec![
            (MARGIN_X + IMAGE_COL_WIDTH).into(),
            y.into(),
            TEXT_COL_WIDTH.into(),
            height.into(),
        ],
    ));
    ops.push(Operation::new("S", vec![]));
}

/// Standard fonts only cover WinAnsi; anything outside Latin-1 becomes `?`.
fn win_ansi(value: &str) -> Vec<u8> {
    value
        .chars()
        .map(|ch| if (ch as u32) < 0x100 { ch as u32 as u8 } else { b'?' })
        .collect()
}
