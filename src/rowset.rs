//! In-memory rectangular row sets, before and after normalization.

use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::ops::Range;
use uuid::Uuid;

/// Timestamp rendering used for text casts and warehouse parameters.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// A cell as delivered by the source driver.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceValue {
    /// SQL NULL
    Null,
    /// bit
    Bool(bool),
    /// tinyint / smallint / int / bigint
    Int(i64),
    /// real / float
    Float(f64),
    /// decimal / numeric / money
    Decimal(Decimal),
    /// Character data
    Text(String),
    /// binary / varbinary, GUIDs read through linked servers end up here
    Binary(Vec<u8>),
    /// uniqueidentifier decoded by the driver
    Guid(Uuid),
    /// date
    Date(NaiveDate),
    /// datetime / datetime2 / smalldatetime
    DateTime(NaiveDateTime),
    /// datetimeoffset
    DateTimeTz(DateTime<Utc>),
}

impl SourceValue {
    /// Whether this is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SourceValue::Null)
    }

    /// Whether this value has a numeric driver type.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            SourceValue::Int(_) | SourceValue::Float(_) | SourceValue::Decimal(_)
        )
    }

    /// Whether this is a temporal value.
    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            SourceValue::Date(_) | SourceValue::DateTime(_) | SourceValue::DateTimeTz(_)
        )
    }

    /// Short name of the value kind, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            SourceValue::Null => "null",
            SourceValue::Bool(_) => "bool",
            SourceValue::Int(_) => "int",
            SourceValue::Float(_) => "float",
            SourceValue::Decimal(_) => "decimal",
            SourceValue::Text(_) => "text",
            SourceValue::Binary(_) => "binary",
            SourceValue::Guid(_) => "guid",
            SourceValue::Date(_) => "date",
            SourceValue::DateTime(_) => "datetime",
            SourceValue::DateTimeTz(_) => "datetimeoffset",
        }
    }
}

/// One column of a fetched row set.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceColumn {
    /// Column name as returned by the source (may repeat)
    pub name: String,
    /// Driver type tag, e.g. `Decimaln` or `Guid`
    pub type_tag: String,
    /// Values, one per row
    pub values: Vec<SourceValue>,
}

impl SourceColumn {
    /// Create a column.
    pub fn new(name: impl Into<String>, type_tag: impl Into<String>, values: Vec<SourceValue>) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
            values,
        }
    }
}

/// A fetched result set, column-major.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    columns: Vec<SourceColumn>,
    row_count: usize,
}

impl RowSet {
    /// Build a row set, checking that every column has the same length.
    pub fn new(columns: Vec<SourceColumn>) -> Result<Self> {
        let row_count = columns.first().map(|c| c.values.len()).unwrap_or(0);
        if let Some(bad) = columns.iter().find(|c| c.values.len() != row_count) {
            return Err(Error::validation(format!(
                "column '{}' has {} values, expected {}",
                bad.name,
                bad.values.len(),
                row_count
            )));
        }
        Ok(Self { columns, row_count })
    }

    /// Columns in result order.
    pub fn columns(&self) -> &[SourceColumn] {
        &self.columns
    }

    /// Take ownership of the columns.
    pub fn into_columns(self) -> Vec<SourceColumn> {
        self.columns
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Whether the row set holds no rows.
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }
}

/// A warehouse-safe cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    /// NULL
    Null,
    /// STRING
    Text(String),
    /// INTEGER
    Integer(i64),
    /// FLOAT
    Float(f64),
    /// BOOLEAN
    Boolean(bool),
    /// TIMESTAMP, UTC without zone
    Timestamp(NaiveDateTime),
}

/// The kind of a non-null cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellKind {
    /// Text
    Text,
    /// Integer
    Integer,
    /// Float
    Float,
    /// Boolean
    Boolean,
    /// Timestamp
    Timestamp,
}

impl CellValue {
    /// Whether this is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Kind of the value, `None` for NULL.
    pub fn kind(&self) -> Option<CellKind> {
        match self {
            CellValue::Null => None,
            CellValue::Text(_) => Some(CellKind::Text),
            CellValue::Integer(_) => Some(CellKind::Integer),
            CellValue::Float(_) => Some(CellKind::Float),
            CellValue::Boolean(_) => Some(CellKind::Boolean),
            CellValue::Timestamp(_) => Some(CellKind::Timestamp),
        }
    }

    /// Text rendering, `None` for NULL.
    pub fn to_text(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Text(s) => Some(s.clone()),
            CellValue::Integer(v) => Some(v.to_string()),
            CellValue::Float(v) => Some(v.to_string()),
            CellValue::Boolean(v) => Some(v.to_string()),
            CellValue::Timestamp(v) => Some(v.format(TIMESTAMP_FORMAT).to_string()),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(s) => f.write_str(&s),
            None => f.write_str("NULL"),
        }
    }
}

/// One column of a normalized row set.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedColumn {
    /// Unique column name
    pub name: String,
    /// Values, one per row
    pub values: Vec<CellValue>,
}

impl NormalizedColumn {
    /// Create a column.
    pub fn new(name: impl Into<String>, values: Vec<CellValue>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// The kind shared by the non-null values, `None` if the column is all NULL.
    pub fn kind(&self) -> Option<CellKind> {
        self.values.iter().find_map(CellValue::kind)
    }
}

/// A row set with unique column names and one value kind per column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRowSet {
    columns: Vec<NormalizedColumn>,
    row_count: usize,
}

impl NormalizedRowSet {
    /// Build a normalized row set.
    pub fn new(columns: Vec<NormalizedColumn>) -> Result<Self> {
        let row_count = columns.first().map(|c| c.values.len()).unwrap_or(0);
        if let Some(bad) = columns.iter().find(|c| c.values.len() != row_count) {
            return Err(Error::validation(format!(
                "column '{}' has {} values, expected {}",
                bad.name,
                bad.values.len(),
                row_count
            )));
        }
        for (i, col) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == col.name) {
                return Err(Error::validation(format!("duplicate column '{}'", col.name)));
            }
        }
        Ok(Self { columns, row_count })
    }

    /// Columns in order.
    pub fn columns(&self) -> &[NormalizedColumn] {
        &self.columns
    }

    /// Mutable access to the columns; lengths must not change.
    pub(crate) fn columns_mut(&mut self) -> &mut [NormalizedColumn] {
        &mut self.columns
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&NormalizedColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column names in order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    /// Split into consecutive batches of at most `batch_size` rows.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = RowBatch<'_>> {
        let size = batch_size.max(1);
        (0..self.row_count).step_by(size).map(move |start| RowBatch {
            columns: &self.columns,
            rows: start..(start + size).min(self.row_count),
        })
    }

    /// Number of batches `batches(batch_size)` yields.
    pub fn batch_count(&self, batch_size: usize) -> usize {
        self.row_count.div_ceil(batch_size.max(1))
    }
}

/// A borrowed window of rows from a normalized row set.
#[derive(Debug, Clone)]
pub struct RowBatch<'a> {
    columns: &'a [NormalizedColumn],
    rows: Range<usize>,
}

impl<'a> RowBatch<'a> {
    /// Columns of the parent row set.
    pub fn columns(&self) -> &'a [NormalizedColumn] {
        self.columns
    }

    /// Row range covered by this batch.
    pub fn range(&self) -> Range<usize> {
        self.rows.clone()
    }

    /// Number of rows in the batch.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate rows as vectors of cell references, in column order.
    pub fn rows(&self) -> impl Iterator<Item = Vec<&'a CellValue>> + '_ {
        let columns = self.columns;
        self.rows
            .clone()
            .map(move |r| columns.iter().map(|c| &c.values[r]).collect())
    }
}
