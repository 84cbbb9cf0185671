//! Numeric validation of normalized row sets against their schema.

use crate::rowset::{CellValue, NormalizedRowSet};
use crate::schema::{ColumnSchema, LogicalType};
use serde::Serialize;
use tracing::{error, instrument};

/// Offending rows logged per column.
pub const MAX_INVALID_SAMPLES: usize = 10;

/// One value that failed numeric coercion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidCell {
    /// Row index in the row set
    pub row: usize,
    /// Identifier column value of that row, if the column exists
    pub id: Option<String>,
    /// The offending value as text
    pub raw: String,
}

/// Validation outcome for one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnIssues {
    /// Column name
    pub column: String,
    /// Schema type the column was checked against
    pub expected: LogicalType,
    /// Number of cells set to NULL
    pub invalid_count: usize,
    /// Up to [`MAX_INVALID_SAMPLES`] offending cells
    pub samples: Vec<InvalidCell>,
}

/// Validation outcome for a row set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    /// Columns that had invalid values
    pub columns: Vec<ColumnIssues>,
}

impl ValidationReport {
    /// Total number of cells set to NULL.
    pub fn nullified_cells(&self) -> usize {
        self.columns.iter().map(|c| c.invalid_count).sum()
    }

    /// Whether every value was valid.
    pub fn is_clean(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Coerce every numeric column to its schema type.
///
/// Values that cannot be coerced are logged with their row identifier and
/// replaced by NULL; rows are never dropped.
#[instrument(skip_all, fields(rows = rows.row_count()))]
pub fn validate(rows: &mut NormalizedRowSet, schema: &[ColumnSchema], id_column: &str) -> ValidationReport {
    let ids: Option<Vec<Option<String>>> = rows
        .column(id_column)
        .map(|c| c.values.iter().map(CellValue::to_text).collect());

    let mut report = ValidationReport::default();

    for column in rows.columns_mut() {
        let Some(col_schema) = schema.iter().find(|s| s.name == column.name) else {
            continue;
        };
        let expected = col_schema.logical_type;
        if !expected.is_numeric() {
            continue;
        }

        let mut invalid_count = 0;
        let mut samples = Vec::new();
        for (row, value) in column.values.iter_mut().enumerate() {
            if value.is_null() {
                continue;
            }
            match coerce_numeric(value, expected) {
                Some(coerced) => *value = coerced,
                None => {
                    invalid_count += 1;
                    if samples.len() < MAX_INVALID_SAMPLES {
                        samples.push(InvalidCell {
                            row,
                            id: ids.as_ref().and_then(|ids| ids[row].clone()),
                            raw: value.to_string(),
                        });
                    }
                    *value = CellValue::Null;
                }
            }
        }

        if invalid_count > 0 {
            error!(
                "Column {} ({}) has {} invalid values, set to NULL. Samples: {}",
                column.name,
                expected,
                invalid_count,
                format_samples(&samples, id_column)
            );
            metrics::counter!("ledger_sync_cells_nullified_total").increment(invalid_count as u64);
            report.columns.push(ColumnIssues {
                column: column.name.clone(),
                expected,
                invalid_count,
                samples,
            });
        }
    }

    report
}

fn coerce_numeric(value: &CellValue, expected: LogicalType) -> Option<CellValue> {
    let number = match value {
        CellValue::Integer(i) => Number::Int(*i),
        CellValue::Float(f) => Number::Float(*f),
        CellValue::Boolean(b) => Number::Int(i64::from(*b)),
        CellValue::Text(s) => parse_number(s)?,
        CellValue::Null | CellValue::Timestamp(_) => return None,
    };

    match (expected, number) {
        (LogicalType::Integer, Number::Int(i)) => Some(CellValue::Integer(i)),
        (LogicalType::Integer, Number::Float(f)) => {
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                Some(CellValue::Integer(f as i64))
            } else {
                None
            }
        }
        (_, Number::Int(i)) => Some(CellValue::Float(i as f64)),
        (_, Number::Float(f)) => Some(CellValue::Float(f)),
    }
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

fn parse_number(text: &str) -> Option<Number> {
    let trimmed = text.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(Number::Int(i));
    }
    match trimmed.parse::<f64>() {
        Ok(f) if f.is_finite() => Some(Number::Float(f)),
        _ => None,
    }
}

fn format_samples(samples: &[InvalidCell], id_column: &str) -> String {
    samples
        .iter()
        .map(|s| {
            format!(
                "[row {} {}={} value={:?}]",
                s.row,
                id_column,
                s.id.as_deref().unwrap_or("?"),
                s.raw
            )
        })
        .collect::<Vec<_>>()
        .join(" ")
}
