//! Reads a spreadsheet or CSV export into raw, untyped rows.
//!
//! Format is chosen by file extension; calamine handles every workbook
//! flavour (xls, xlsx, xlsb, ods), the csv crate handles text exports.

use std::io::Cursor;
use std::path::Path;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::SourceError;

/// An untyped spreadsheet cell
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    DateTime(NaiveDateTime),
    Blank,
}

impl Cell {
    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Blank => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }
}

/// One source row: original header -> cell, in sheet column order
pub type RawRow = IndexMap<String, Cell>;

#[derive(Debug)]
pub struct Sheet {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
    /// Rows with no non-blank cell, dropped while reading
    pub blank_rows: usize,
}

/// `sha256:<hex>` of the file bytes, kept as provenance in the run summary
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

fn is_excel_path(path: &Path) -> bool {
    matches!(
        extension(path).as_str(),
        "xlsx" | "xlsm" | "xls" | "xlsb" | "xla" | "xlam" | "ods"
    )
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Parse the already loaded contents of `path`; the extension picks the
/// reader. `sheet` selects a worksheet by name; the first sheet is used
/// when absent. Ignored for CSV.
pub fn read_sheet(path: &Path, bytes: &[u8], sheet: Option<&str>) -> Result<Sheet, SourceError> {
    if is_excel_path(path) {
        read_workbook(path, bytes, sheet)
    } else if extension(path) == "csv" {
        read_csv(bytes)
    } else {
        Err(SourceError::UnsupportedFormat(extension(path)))
    }
}

fn read_workbook(path: &Path, bytes: &[u8], sheet: Option<&str>) -> Result<Sheet, SourceError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes)).map_err(|source| SourceError::Workbook {
        path: path.to_path_buf(),
        source,
    })?;

    let sheet_names = workbook.sheet_names().to_vec();
    let sheet_name = match sheet {
        Some(wanted) => sheet_names
            .iter()
            .find(|name| name.as_str() == wanted)
            .cloned()
            .ok_or_else(|| SourceError::SheetNotFound(wanted.to_string()))?,
        None => sheet_names.first().cloned().ok_or(SourceError::NoSheets)?,
    };
    info!(sheet = %sheet_name, sheets = sheet_names.len(), "reading worksheet");

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|source| SourceError::Workbook {
            path: path.to_path_buf(),
            source,
        })?;

    let (row_count, col_count) = range.get_size();
    debug!(rows = row_count, columns = col_count, "sheet size");

    let mut rows_iter = range.rows();
    let headers: Vec<String> = rows_iter
        .next()
        .ok_or_else(|| SourceError::NoHeader(sheet_name.clone()))?
        .iter()
        .map(header_text)
        .collect();

    let cells = rows_iter.map(|row| row.iter().map(cell_from_data).collect());
    Ok(assemble(sheet_name, headers, cells))
}

fn header_text(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

fn cell_from_data(cell: &Data) -> Cell {
    match cell {
        Data::String(s) => Cell::Text(s.clone()),
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Text(b.to_string()),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(value) => Cell::DateTime(value),
            None => Cell::Number(dt.as_f64()),
        },
        Data::DateTimeIso(s) => parse_iso_datetime(s)
            .map(Cell::DateTime)
            .unwrap_or_else(|| Cell::Text(s.clone())),
        Data::DurationIso(s) => Cell::Text(s.clone()),
        Data::Error(_) | Data::Empty => Cell::Blank,
    }
}

fn parse_iso_datetime(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Parse CSV bytes. Non-UTF-8 input is decoded as Windows-1252, which is
/// what legacy spreadsheet tools emit for "CSV (Comma delimited)".
pub fn read_csv(bytes: &[u8]) -> Result<Sheet, SourceError> {
    let decoded = match std::str::from_utf8(bytes) {
        Ok(s) => std::borrow::Cow::Borrowed(s),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            debug!("input is not UTF-8, decoded as windows-1252");
            decoded
        }
    };
    let text: &str = decoded.strip_prefix('\u{feff}').unwrap_or(&decoded);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(SourceError::NoHeader("csv".to_string()));
    }

    let mut records = Vec::new();
    for result in reader.records() {
        let record = result?;
        records.push(
            record
                .iter()
                .map(|field| {
                    if field.is_empty() {
                        Cell::Blank
                    } else {
                        Cell::Text(field.to_string())
                    }
                })
                .collect::<Vec<_>>(),
        );
    }

    Ok(assemble("csv".to_string(), headers, records.into_iter()))
}

fn assemble<I>(name: String, headers: Vec<String>, rows: I) -> Sheet
where
    I: Iterator<Item = Vec<Cell>>,
{
    let mut out = Vec::new();
    let mut blank_rows = 0;

    for cells in rows {
        if cells.iter().all(Cell::is_blank) {
            blank_rows += 1;
            continue;
        }
        let mut row = RawRow::with_capacity(headers.len());
        for (header, cell) in headers.iter().zip(cells) {
            if header.is_empty() {
                continue;
            }
            // First column wins when a header repeats
            row.entry(header.clone()).or_insert(cell);
        }
        out.push(row);
    }

    Sheet {
        name,
        headers,
        rows: out,
        blank_rows,
    }
}
