//! Report export — Excel workbook and CSV.

use crate::types::Report;
use rust_xlsxwriter::{Color, Format, FormatAlign, FormatBorder, Workbook, XlsxError};
use std::str::FromStr;
use thiserror::Error;

const HEADERS: [&str; 4] = ["Student ID", "Name", "Class", "Status"];
const HEADER_FILL: u32 = 0x4CAF50;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("xlsx: {0}")]
    Xlsx(#[from] XlsxError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Xlsx,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Xlsx => "xlsx",
            Self::Csv => "csv",
        }
    }

    /// Default file name, e.g. `Report_2025-10-08.xlsx`.
    pub fn file_name(&self, report: &Report) -> String {
        format!("{}.{}", report.sheet_name(), self.extension())
    }

    pub fn render(&self, report: &Report) -> Result<Vec<u8>, ExportError> {
        match self {
            Self::Xlsx => to_xlsx(report),
            Self::Csv => Ok(to_csv(report).into_bytes()),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "xlsx" | "excel" => Ok(Self::Xlsx),
            "csv" => Ok(Self::Csv),
            other => Err(format!("unknown export format {other:?} (expected \"xlsx\" or \"csv\")")),
        }
    }
}

fn row_cells(report: &Report) -> impl Iterator<Item = [String; 4]> + '_ {
    report.rows.iter().map(|r| {
        [
            r.student_id.clone(),
            r.name.clone(),
            r.class_name.clone(),
            r.status.to_string(),
        ]
    })
}

/// Render a report as CSV with a header line.
pub fn to_csv(report: &Report) -> String {
    let mut csv = HEADERS.join(",");
    csv.push('\n');
    for cells in row_cells(report) {
        let line: Vec<String> = cells.iter().map(|c| escape_csv_field(c)).collect();
        csv.push_str(&line.join(","));
        csv.push('\n');
    }
    csv
}

fn escape_csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Render a report as a single-sheet workbook named `Report_<date>`.
///
/// The header row is bold, wrapped, top-aligned, green with white text and a
/// thin border. Each column is as wide as its longest cell plus two.
pub fn to_xlsx(report: &Report) -> Result<Vec<u8>, ExportError> {
    let header_format = Format::new()
        .set_bold()
        .set_text_wrap()
        .set_align(FormatAlign::Top)
        .set_background_color(Color::RGB(HEADER_FILL))
        .set_font_color(Color::White)
        .set_border(FormatBorder::Thin);

    let mut workbook = Workbook::new();
    {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(report.sheet_name())?;

        let mut widths: Vec<usize> = HEADERS.iter().map(|h| h.chars().count()).collect();

        for (col, header) in HEADERS.iter().enumerate() {
            worksheet.write_string_with_format(0, col as u16, *header, &header_format)?;
        }

        for (row, cells) in row_cells(report).enumerate() {
            for (col, cell) in cells.iter().enumerate() {
                worksheet.write_string(row as u32 + 1, col as u16, cell)?;
                widths[col] = widths[col].max(cell.chars().count());
            }
        }

        for (col, width) in widths.iter().enumerate() {
            worksheet.set_column_width(col as u16, (*width + 2) as f64)?;
        }
    }

    Ok(workbook.save_to_buffer()?)
}
