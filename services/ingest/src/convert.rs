//! Per-field coercion of raw cells into typed values.
//!
//! Conversion never fails: missing or invalid input becomes `None`. The
//! [`ConversionStats`] counters make that loss visible in the run summary.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tracing::{debug, warn};

use crate::columns::ColumnMapping;
use crate::record::{FieldKind, FuelRecord, Value};
use crate::source::{Cell, RawRow};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRules {
    pub max_string_len: usize,
    pub decimal_scale: u32,
    pub date_format: String,
    pub time_format: String,
}

impl Default for ConversionRules {
    fn default() -> Self {
        Self {
            max_string_len: 255,
            decimal_scale: 2,
            date_format: "%m/%d/%Y".to_string(),
            time_format: "%H:%M:%S".to_string(),
        }
    }
}

/// Convert a cell to the given kind. `None` for blank or invalid input.
pub fn convert(cell: &Cell, kind: FieldKind, rules: &ConversionRules) -> Option<Value> {
    match kind {
        FieldKind::Text => to_text(cell, rules.max_string_len).map(Value::Text),
        FieldKind::Decimal => to_decimal(cell, rules.decimal_scale).map(Value::Decimal),
        FieldKind::Date => to_date(cell, &rules.date_format).map(Value::Date),
        FieldKind::Time => to_time(cell, &rules.time_format).map(Value::Time),
    }
}

fn to_text(cell: &Cell, max_len: usize) -> Option<String> {
    let raw = match cell {
        Cell::Text(s) => s.trim().to_string(),
        Cell::Number(n) => format_number(*n)?,
        Cell::DateTime(dt) => dt.to_string(),
        Cell::Blank => return None,
    };
    if raw.is_empty() {
        return None;
    }
    Some(truncate(raw, max_len))
}

/// Whole numbers print without a fractional part so numeric-looking
/// registration or model codes survive as text.
fn format_number(n: f64) -> Option<String> {
    if !n.is_finite() {
        return None;
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        Some(format!("{}", n as i64))
    } else {
        Some(n.to_string())
    }
}

fn truncate(mut s: String, max_len: usize) -> String {
    if let Some((idx, _)) = s.char_indices().nth(max_len) {
        s.truncate(idx);
        // Truncation may leave trailing whitespace behind
        let trimmed_len = s.trim_end().len();
        s.truncate(trimmed_len);
    }
    s
}

fn to_decimal(cell: &Cell, scale: u32) -> Option<Decimal> {
    let value = match cell {
        Cell::Number(n) if n.is_finite() => {
            // Shortest round-trip form keeps 1234.565 as written, not as
            // its nearest binary approximation.
            Decimal::from_str(&n.to_string()).ok()?
        }
        Cell::Text(s) => parse_decimal_text(s)?,
        _ => return None,
    };
    let mut rounded = value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
    // Pad to a fixed scale: 12500.5 -> 12500.50
    rounded.rescale(scale);
    Some(rounded)
}

fn parse_decimal_text(s: &str) -> Option<Decimal> {
    let cleaned: String = s
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .ok()
}

fn to_date(cell: &Cell, format: &str) -> Option<NaiveDate> {
    match cell {
        Cell::DateTime(dt) => Some(dt.date()),
        Cell::Text(s) => NaiveDate::parse_from_str(s.trim(), format).ok(),
        _ => None,
    }
}

fn to_time(cell: &Cell, format: &str) -> Option<NaiveTime> {
    match cell {
        Cell::DateTime(dt) => Some(dt.time()),
        Cell::Text(s) => NaiveTime::parse_from_str(s.trim(), format).ok(),
        _ => None,
    }
}

/// Per-field counts of values lost or altered during conversion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversionStats {
    /// Non-blank cells that converted to null
    pub rejected: BTreeMap<&'static str, usize>,
    /// Text cells cut to the maximum length
    pub truncated: BTreeMap<&'static str, usize>,
}

impl ConversionStats {
    pub fn total_rejected(&self) -> usize {
        self.rejected.values().sum()
    }

    /// One warning per affected field
    pub fn report(&self) {
        for (field, count) in &self.rejected {
            warn!(field = *field, count, "values could not be converted and were stored as null");
        }
        for (field, count) in &self.truncated {
            warn!(field = *field, count, "values were truncated");
        }
    }
}

/// Build a [`FuelRecord`] from one raw row
pub fn convert_row(
    row: &RawRow,
    source_row: usize,
    mapping: &ColumnMapping,
    rules: &ConversionRules,
    stats: &mut ConversionStats,
) -> FuelRecord {
    let mut record = FuelRecord::new(source_row);

    for (field, cell) in mapping.apply(row) {
        match convert(cell, field.kind(), rules) {
            Some(value) => {
                if let (Value::Text(out), Cell::Text(input)) = (&value, cell) {
                    if out.chars().count() < input.trim().chars().count() {
                        *stats.truncated.entry(field.name()).or_default() += 1;
                    }
                }
                record.set(field, value);
            }
            None if !cell.is_blank() => {
                debug!(row = source_row, field = %field, cell = ?cell, "value rejected");
                *stats.rejected.entry(field.name()).or_default() += 1;
            }
            None => {}
        }
    }

    record
}

/// Convert every row; `source_row` numbering starts at 2 (header is line 1)
pub fn convert_rows(
    rows: &[RawRow],
    mapping: &ColumnMapping,
    rules: &ConversionRules,
) -> (Vec<FuelRecord>, ConversionStats) {
    let mut stats = ConversionStats::default();
    let records = rows
        .iter()
        .enumerate()
        .map(|(idx, row)| convert_row(row, idx + 2, mapping, rules, &mut stats))
        .collect();
    (records, stats)
}
