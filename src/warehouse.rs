//! Warehouse capabilities used by the load orchestrator.

use crate::error::Result;
use crate::rowset::{CellValue, RowBatch};
use crate::schema::{ColumnSchema, quote_ident};
use std::fmt;

/// Fully qualified warehouse table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableId {
    /// Project / catalog
    pub namespace: String,
    /// Dataset / schema
    pub dataset: String,
    /// Table name
    pub table: String,
}

impl TableId {
    /// Create a table id.
    pub fn new(
        namespace: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Sibling table in the same dataset.
    pub fn with_table(&self, table: impl Into<String>) -> Self {
        Self {
            namespace: self.namespace.clone(),
            dataset: self.dataset.clone(),
            table: table.into(),
        }
    }

    /// Quoted `"dataset"."table"` reference for SQL.
    pub fn sql_ref(&self) -> String {
        format!("{}.{}", quote_ident(&self.dataset), quote_ident(&self.table))
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.namespace, self.dataset, self.table)
    }
}

/// How a load call treats existing table contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the table (schema and rows) with the loaded rows
    Replace,
    /// Add rows to the table, creating it if needed
    Append,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::Replace => write!(f, "replace"),
            WriteMode::Append => write!(f, "append"),
        }
    }
}

/// A tabular warehouse.
///
/// Calls are blocking round trips; the orchestrator awaits each one before
/// issuing the next.
pub trait Warehouse {
    /// Test connectivity.
    fn ping(&self) -> Result<()>;

    /// Create the dataset if it does not exist.
    fn create_dataset_if_absent(&self, dataset: &str) -> Result<()>;

    /// Check whether a table exists.
    fn table_exists(&self, table: &TableId) -> Result<bool>;

    /// Create a table if it does not exist.
    fn create_table(&self, table: &TableId, schema: &[ColumnSchema]) -> Result<()>;

    /// Drop a table if it exists.
    fn delete_table(&self, table: &TableId) -> Result<()>;

    /// Load one batch of rows with an explicit schema.
    fn load_rows(
        &self,
        table: &TableId,
        rows: &RowBatch<'_>,
        schema: &[ColumnSchema],
        mode: WriteMode,
    ) -> Result<usize>;

    /// Run a parameterized query and return its rows.
    fn run_query(&self, sql: &str, params: &[CellValue]) -> Result<Vec<Vec<CellValue>>>;

    /// Run a parameterized statement and return the affected row count.
    fn execute(&self, sql: &str, params: &[CellValue]) -> Result<usize>;

    /// Run a multi-statement script without parameters.
    fn execute_script(&self, sql: &str) -> Result<()>;

    /// Release the connection.
    fn close(self) -> Result<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_id_rendering() {
        let id = TableId::new("analytics", "pohoda", "faktury");
        assert_eq!(id.to_string(), "analytics.pohoda.faktury");
        assert_eq!(id.sql_ref(), "\"pohoda\".\"faktury\"");
        assert_eq!(id.with_table("x").table, "x");
        assert_eq!(WriteMode::Replace.to_string(), "replace");
    }
}
