//! Panel reader: raw CSV bytes -> table of named columns.
//!
//! Period columns are recognised by a strict label pattern, never by a date
//! parser, so truncated or otherwise near-miss headers are rejected the same
//! way on every run.

use crate::dataset::DatasetSpec;
use crate::error::{IngestError, Result};
use std::borrow::Cow;
use std::collections::HashSet;
use tracing::debug;

/// Cell values providers use for "no observation".
const NULL_LITERALS: &[&str] = &["", "NA", "N/A", "NaN", "nan", "null", "NULL", "None"];

pub fn is_null_cell(cell: &str) -> bool {
    NULL_LITERALS.contains(&cell.trim())
}

/// UTF-8 (BOM stripped) when well formed, otherwise Windows-1252.
pub fn decode(bytes: &[u8]) -> Cow<'_, str> {
    let (text, malformed) = encoding_rs::UTF_8.decode_with_bom_removal(bytes);
    if !malformed {
        return text;
    }
    let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
    text
}

#[derive(Debug, Clone)]
pub struct PanelTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    period_columns: Vec<usize>,
}

impl PanelTable {
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// (column index, period label) in header order.
    pub fn period_columns(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        self.period_columns
            .iter()
            .map(move |&idx| (idx, self.headers[idx].as_str()))
    }

    pub fn period_column_count(&self) -> usize {
        self.period_columns.len()
    }

    /// Non-null cell text, trimmed.
    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(String::as_str)
            .filter(|c| !is_null_cell(c))
    }

    pub fn is_column_empty(&self, col: usize) -> bool {
        (0..self.rows.len()).all(|row| self.cell(row, col).is_none())
    }

    /// 1-based source line for a data row (header is line 1).
    pub fn line_of(row: usize) -> usize {
        row + 2
    }
}

/// Parse a raw panel for `spec`.
///
/// Fails with a format error if the header repeats a column, a required
/// identity column is missing, no column matches the period pattern, or a
/// row does not have the header's field count.
pub fn read_panel(bytes: &[u8], spec: &DatasetSpec) -> Result<PanelTable> {
    let content = decode(bytes);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(false)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| IngestError::format(format!("failed to read CSV header: {e}")))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut seen = HashSet::new();
    if let Some(dup) = headers.iter().find(|h| !seen.insert(h.as_str())) {
        return Err(IngestError::format(format!("duplicate column in header: {dup}")));
    }

    let mut required = spec.identity.required();
    if let Some(pivot) = spec.pivot {
        required.push(pivot.column);
    }
    let missing: Vec<&str> = required
        .into_iter()
        .filter(|col| !headers.iter().any(|h| h == col))
        .collect();
    if !missing.is_empty() {
        return Err(IngestError::format(format!(
            "missing required columns: {missing:?}"
        )));
    }

    let period_columns: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| spec.period_format.matches(h))
        .map(|(idx, _)| idx)
        .collect();
    if period_columns.is_empty() {
        return Err(IngestError::format(format!(
            "no period columns matching {} found",
            spec.period_format.describe()
        )));
    }

    let mut rows = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let record = result.map_err(|e| {
            IngestError::format(format!(
                "line {}: CSV parse error: {e}",
                PanelTable::line_of(idx)
            ))
        })?;
        rows.push(record.iter().map(|c| c.to_string()).collect());
    }

    debug!(
        dataset = %spec.kind,
        columns = headers.len(),
        period_columns = period_columns.len(),
        rows = rows.len(),
        "read panel"
    );

    Ok(PanelTable {
        headers,
        rows,
        period_columns,
    })
}
