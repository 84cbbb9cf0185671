//! Column schemas, schema inference and DDL generation.

use crate::rowset::{CellKind, NormalizedRowSet};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical column types understood by the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalType {
    /// Text
    String,
    /// 64-bit integer
    Integer,
    /// 64-bit float
    Float,
    /// Boolean
    Boolean,
    /// Timestamp without zone (UTC)
    Timestamp,
    /// Calendar date
    Date,
}

impl LogicalType {
    /// Convert to DuckDB type string.
    pub fn to_duckdb(&self) -> &'static str {
        match self {
            LogicalType::String => "VARCHAR",
            LogicalType::Integer => "BIGINT",
            LogicalType::Float => "DOUBLE",
            LogicalType::Boolean => "BOOLEAN",
            LogicalType::Timestamp => "TIMESTAMP",
            LogicalType::Date => "DATE",
        }
    }

    /// Whether values of this type are numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(self, LogicalType::Integer | LogicalType::Float)
    }

    /// Logical type for a realized cell kind.
    pub fn from_kind(kind: Option<CellKind>) -> Self {
        match kind {
            Some(CellKind::Timestamp) => LogicalType::Timestamp,
            Some(CellKind::Float) => LogicalType::Float,
            Some(CellKind::Integer) => LogicalType::Integer,
            Some(CellKind::Boolean) => LogicalType::Boolean,
            Some(CellKind::Text) | None => LogicalType::String,
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogicalType::String => "STRING",
            LogicalType::Integer => "INTEGER",
            LogicalType::Float => "FLOAT",
            LogicalType::Boolean => "BOOLEAN",
            LogicalType::Timestamp => "TIMESTAMP",
            LogicalType::Date => "DATE",
        };
        f.write_str(name)
    }
}

/// Column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name
    pub name: String,
    /// Logical type
    pub logical_type: LogicalType,
    /// Is nullable
    pub nullable: bool,
}

impl ColumnSchema {
    /// Create a new nullable column.
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            nullable: true,
        }
    }

    /// Set nullable.
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Column definition for DDL.
    pub fn to_duckdb_ddl(&self) -> String {
        let null = if self.nullable { "" } else { " NOT NULL" };
        format!(
            "{} {}{}",
            quote_ident(&self.name),
            self.logical_type.to_duckdb(),
            null
        )
    }
}

/// Derive the target schema from a normalized row set.
///
/// The identifier column is always STRING; every column is nullable.
pub fn infer_schema(rows: &NormalizedRowSet, id_column: &str) -> Vec<ColumnSchema> {
    rows.columns()
        .iter()
        .map(|column| {
            let logical_type = if column.name == id_column {
                LogicalType::String
            } else {
                LogicalType::from_kind(column.kind())
            };
            ColumnSchema::new(&column.name, logical_type)
        })
        .collect()
}

/// Schema of the sync metadata table.
pub fn metadata_table_schema() -> Vec<ColumnSchema> {
    vec![
        ColumnSchema::new("table_name", LogicalType::String).nullable(false),
        ColumnSchema::new("last_sync_timestamp", LogicalType::Timestamp),
        ColumnSchema::new("last_max_date", LogicalType::Date),
        ColumnSchema::new("records_synced", LogicalType::Integer),
        ColumnSchema::new("sync_mode", LogicalType::String),
        ColumnSchema::new("created_at", LogicalType::Timestamp),
        ColumnSchema::new("updated_at", LogicalType::Timestamp),
    ]
}

/// Generate CREATE TABLE DDL for DuckDB/MotherDuck.
pub fn create_table_ddl(qualified_name: &str, columns: &[ColumnSchema], replace: bool) -> String {
    let head = if replace {
        format!("CREATE OR REPLACE TABLE {} (\n", qualified_name)
    } else {
        format!("CREATE TABLE IF NOT EXISTS {} (\n", qualified_name)
    };

    let col_defs: Vec<String> = columns
        .iter()
        .map(|c| format!("    {}", c.to_duckdb_ddl()))
        .collect();

    let mut ddl = head;
    ddl.push_str(&col_defs.join(",\n"));
    ddl.push_str("\n)");
    ddl
}

/// Quote an identifier with double quotes, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rowset::{CellValue, NormalizedColumn};
    use chrono::NaiveDate;

    fn rows() -> NormalizedRowSet {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        NormalizedRowSet::new(vec![
            NormalizedColumn::new("ID", vec![CellValue::Integer(1), CellValue::Integer(2)]),
            NormalizedColumn::new("Datum", vec![CellValue::Timestamp(ts), CellValue::Null]),
            NormalizedColumn::new("Kc", vec![CellValue::Float(1.5), CellValue::Float(2.0)]),
            NormalizedColumn::new("Pocet", vec![CellValue::Integer(3), CellValue::Null]),
            NormalizedColumn::new("Storno", vec![CellValue::Boolean(false), CellValue::Null]),
            NormalizedColumn::new("Text", vec![CellValue::Text("a".into()), CellValue::Null]),
            NormalizedColumn::new("Empty", vec![CellValue::Null, CellValue::Null]),
        ])
        .unwrap()
    }

    #[test]
    fn test_infer_schema() {
        let schema = infer_schema(&rows(), "ID");
        let types: Vec<LogicalType> = schema.iter().map(|c| c.logical_type).collect();
        assert_eq!(
            types,
            vec![
                LogicalType::String,
                LogicalType::Timestamp,
                LogicalType::Float,
                LogicalType::Integer,
                LogicalType::Boolean,
                LogicalType::String,
                LogicalType::String,
            ]
        );
        assert!(schema.iter().all(|c| c.nullable));
    }

    #[test]
    fn test_infer_schema_without_id_column() {
        let schema = infer_schema(&rows(), "Guid");
        assert_eq!(schema[0].logical_type, LogicalType::Integer);
    }

    #[test]
    fn test_table_ddl() {
        let ddl = create_table_ddl("\"main\".\"_sync_metadata\"", &metadata_table_schema(), false);
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS \"main\".\"_sync_metadata\""));
        assert!(ddl.contains("\"table_name\" VARCHAR NOT NULL"));
        assert!(ddl.contains("\"last_max_date\" DATE"));

        let replace = create_table_ddl("t", &[ColumnSchema::new("a", LogicalType::Float)], true);
        assert!(replace.starts_with("CREATE OR REPLACE TABLE t"));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("ID"), "\"ID\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
