//! Decoding and shape analysis of upstream tables.
//!
//! Payloads are stored byte-for-byte, so decoding here is read-only: it
//! proves the bytes are valid in the declared encoding and extracts the
//! scalar summary used for anomaly baselines.

use std::mem::take;

use encoding_rs::Encoding;

use crate::models::PayloadStats;

/// Why a payload could not be read as a table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown encoding label: {0}")]
    UnknownEncoding(String),
    #[error("payload is not valid {0}")]
    Malformed(String),
}

/// Decode `bytes` strictly with the encoding named by `label`.
pub fn decode(bytes: &[u8], label: &str) -> Result<String, DecodeError> {
    let encoding = Encoding::for_label(label.as_bytes())
        .ok_or_else(|| DecodeError::UnknownEncoding(label.to_string()))?;
    let (text, had_errors) = encoding.decode_with_bom_removal(bytes);
    if had_errors {
        return Err(DecodeError::Malformed(encoding.name().to_string()));
    }
    Ok(text.into_owned())
}

/// Quote-aware CSV split. Blank lines are dropped; CRLF is tolerated.
pub fn parse_rows(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => row.push(take(&mut field)),
            '\n' | '\r' if !in_quotes => {
                if ch == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                row.push(take(&mut field));
                if row.len() == 1 && row[0].is_empty() {
                    row.clear();
                } else {
                    rows.push(take(&mut row));
                }
            }
            _ => field.push(ch),
        }
    }

    row.push(field);
    if !(row.len() == 1 && row[0].is_empty()) {
        rows.push(row);
    }
    rows
}

/// Shape of a parsed table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Shape {
    pub rows: u64,
    /// Widest row; the data block of these tables is the widest part.
    pub max_columns: usize,
    /// Distinct row widths seen, ascending.
    pub widths: Vec<usize>,
}

impl Shape {
    pub fn is_consistent(&self) -> bool {
        self.widths.len() <= 1
    }
}

pub fn shape(rows: &[Vec<String>]) -> Shape {
    let mut widths: Vec<usize> = rows.iter().map(Vec::len).collect();
    widths.sort_unstable();
    widths.dedup();
    Shape {
        rows: rows.len() as u64,
        max_columns: widths.last().copied().unwrap_or(0),
        widths,
    }
}

/// Parse a cell as a number, accepting thousands separators.
fn numeric(cell: &str) -> Option<f64> {
    let cleaned: String = cell.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Scalar summary for anomaly detection.
pub fn summarize(rows: &[Vec<String>]) -> PayloadStats {
    let s = shape(rows);
    let numeric_total = rows
        .iter()
        .flat_map(|r| r.iter())
        .filter_map(|c| numeric(c))
        .sum();
    PayloadStats {
        row_count: s.rows,
        column_count: s.max_columns as u32,
        numeric_total,
    }
}
