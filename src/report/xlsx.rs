use super::layout::{self, BRAND_COLOR_RGB, ReportBranding, TABLE_HEADERS};
use super::{RenderSummary, ReportError, ReportRenderer};
use crate::models::{ArtifactKind, ResultRecord};
use rust_xlsxwriter::{Color, Format, FormatAlign, FormatBorder, Image, Workbook};
use std::path::Path;
use tracing::warn;

const HEADER_BLOCK_ROWS: u32 = 4;
const HEADER_BLOCK_ROW_HEIGHT: f64 = 20.0;
const TABLE_HEADER_ROW: u32 = 5;
const IMAGE_COL_WIDTH: f64 = 30.0;
const TEXT_COL_WIDTH: f64 = 70.0;
const IMAGE_SIZE: u32 = 200;

pub struct XlsxRenderer {
    branding: ReportBranding,
}

impl XlsxRenderer {
    pub fn new(branding: ReportBranding) -> Self {
        Self { branding }
    }
}

impl ReportRenderer for XlsxRenderer {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Spreadsheet
    }

    fn render(&self, records: &[ResultRecord], output: &Path) -> Result<RenderSummary, ReportError> {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.set_name("Report")?;

        let contact = Format::new().set_font_size(9).set_font_color(Color::Gray);
        let title = Format::new()
            .set_bold()
            .set_font_size(16)
            .set_font_color(Color::RGB(BRAND_COLOR_RGB))
            .set_align(FormatAlign::Center);
        let tagline = Format::new().set_font_size(11).set_align(FormatAlign::Center);
        let header = Format::new()
            .set_bold()
            .set_background_color(Color::RGB(0xCCCCCC))
            .set_border(FormatBorder::Thin);
        let image_cell = Format::new().set_border(FormatBorder::Thin);
        let text_cell = Format::new()
            .set_text_wrap()
            .set_align(FormatAlign::Top)
            .set_border(FormatBorder::Thin);

        for (row, line) in self.branding.contact_lines.iter().take(3).enumerate() {
            sheet.write_string_with_format(row as u32, 0, line, &contact)?;
        }
        sheet.write_string_with_format(0, 1, &self.branding.title, &title)?;
        for (offset, line) in self.branding.taglines.iter().take(3).enumerate() {
            sheet.write_string_with_format(offset as u32 + 1, 1, line, &tagline)?;
        }
        for row in 0..HEADER_BLOCK_ROWS {
            sheet.set_row_height(row, HEADER_BLOCK_ROW_HEIGHT)?;
        }

        sheet.set_column_width(0, IMAGE_COL_WIDTH)?;
        sheet.set_column_width(1, TEXT_COL_WIDTH)?;
        for (col, label) in TABLE_HEADERS.iter().enumerate() {
            sheet.write_string_with_format(TABLE_HEADER_ROW, col as u16, *label, &header)?;
        }

        let mut embedded = 0;
        for (idx, record) in records.iter().enumerate() {
            let row = TABLE_HEADER_ROW + 1 + idx as u32;
            sheet.write_blank(row, 0, &image_cell)?;
            sheet.write_string_with_format(row, 1, &record.analysis_text, &text_cell)?;
            sheet.set_row_height(row, layout::analysis_row_height(&record.analysis_text))?;

            match Image::new(&record.local_image_path) {
                Ok(image) => {
                    let image = image.set_scale_to_size(IMAGE_SIZE, IMAGE_SIZE, true);
                    sheet.insert_image(row, 0, &image)?;
                    embedded += 1;
                }
                Err(err) => warn!(
                    target = "appraisal.report",
                    path = %record.local_image_path.display(),
                    error = %err,
                    "xlsx_image_skipped"
                ),
            }
        }

        workbook.save(output)?;
        Ok(RenderSummary {
            rows: records.len(),
            images_embedded: embedded,
            pages: 1,
        })
    }
}
