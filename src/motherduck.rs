//! MotherDuck / DuckDB warehouse client for ledger-sync.

use crate::config::WarehouseConfig;
use crate::error::{Error, Result};
use crate::rowset::{CellValue, RowBatch, TIMESTAMP_FORMAT};
use crate::schema::{ColumnSchema, create_table_ddl, quote_ident};
use crate::warehouse::{TableId, Warehouse, WriteMode};
use duckdb::types::Value;
use duckdb::{Connection, params_from_iter};
use tracing::{debug, info, instrument, warn};

/// MotherDuck client wrapper.
pub struct MotherDuckClient {
    conn: Connection,
    config: WarehouseConfig,
}

impl MotherDuckClient {
    /// Connect to MotherDuck, or to a local DuckDB file when `path` is set.
    #[instrument(skip(config), fields(database = %config.database))]
    pub fn connect(config: WarehouseConfig) -> Result<Self> {
        if let Some(ref path) = config.path {
            info!("Opening local DuckDB database at {}", path);
            let conn = if path == ":memory:" {
                Connection::open_in_memory()
            } else {
                Connection::open(path)
            }
            .map_err(|e| Error::warehouse_connection("Failed to open DuckDB database", e))?;
            return Ok(Self { conn, config });
        }

        info!("Connecting to MotherDuck...");
        let token = config.token.as_deref().unwrap_or_default();

        // First connect without specifying database to create it if needed
        if config.create_database {
            let init_conn_str = format!("md:?motherduck_token={}", token);
            let init_conn = Connection::open(&init_conn_str)
                .map_err(|e| Error::warehouse_connection("Failed to connect to MotherDuck", e))?;

            let create_db = format!("CREATE DATABASE IF NOT EXISTS {}", quote_ident(&config.database));
            init_conn
                .execute(&create_db, [])
                .map_err(|e| Error::warehouse_load("", "Failed to create database", e))?;

            info!("Ensured database exists: {}", config.database);
        }

        let conn_str = format!("md:{}?motherduck_token={}", config.database, token);
        let conn = Connection::open(&conn_str)
            .map_err(|e| Error::warehouse_connection("Failed to connect to database", e))?;

        info!("Connected to MotherDuck database: {}", config.database);
        Ok(Self { conn, config })
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::connect(WarehouseConfig {
            path: Some(":memory:".into()),
            ..Default::default()
        })
    }

    /// Catalog name used as the table namespace.
    pub fn namespace(&self) -> &str {
        &self.config.database
    }

    /// Dataset (schema) tables are written to.
    pub fn dataset(&self) -> &str {
        &self.config.dataset
    }

    /// Table id in the configured dataset.
    pub fn table_id(&self, table: &str) -> TableId {
        TableId::new(&self.config.database, &self.config.dataset, table)
    }

    /// Get row count for a table.
    pub fn count_rows(&self, table: &TableId) -> Result<i64> {
        let query = format!("SELECT COUNT(*) FROM {}", table.sql_ref());
        let mut stmt = self
            .conn
            .prepare(&query)
            .map_err(|e| Error::warehouse_load(table.to_string(), "Prepare count failed", e))?;

        let count: i64 = stmt
            .query_row([], |row| row.get(0))
            .map_err(|e| Error::warehouse_load(table.to_string(), "Count failed", e))?;

        Ok(count)
    }

    fn insert_batch(&self, table: &TableId, rows: &RowBatch<'_>, schema: &[ColumnSchema]) -> Result<usize> {
        let columns = rows.columns();
        let col_names = columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = columns
            .iter()
            .map(|c| {
                let ty = schema
                    .iter()
                    .find(|s| s.name == c.name)
                    .map(|s| s.logical_type.to_duckdb())
                    .unwrap_or("VARCHAR");
                format!("CAST(? AS {})", ty)
            })
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.sql_ref(),
            col_names,
            placeholders
        );

        let mut stmt = self
            .conn
            .prepare(&query)
            .map_err(|e| Error::warehouse_load(table.to_string(), "Prepare insert failed", e))?;

        let mut inserted = 0;
        for row in rows.rows() {
            let values: Vec<Value> = row.into_iter().map(to_duckdb_value).collect();
            inserted += stmt
                .execute(params_from_iter(values.iter()))
                .map_err(|e| Error::warehouse_load(table.to_string(), "Insert failed", e))?;
        }
        Ok(inserted)
    }

    fn in_transaction<T>(&self, table: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.conn
            .execute_batch("BEGIN TRANSACTION")
            .map_err(|e| Error::warehouse_load(table, "Begin transaction failed", e))?;

        match f() {
            Ok(value) => {
                self.conn
                    .execute_batch("COMMIT")
                    .map_err(|e| Error::warehouse_load(table, "Commit failed", e))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    warn!("Rollback failed on {}: {}", table, rollback);
                }
                Err(e)
            }
        }
    }
}

impl Warehouse for MotherDuckClient {
    fn ping(&self) -> Result<()> {
        self.conn
            .execute_batch("SELECT 1")
            .map_err(|e| Error::warehouse_load("", "Ping failed", e))
    }

    fn create_dataset_if_absent(&self, dataset: &str) -> Result<()> {
        let query = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(dataset));
        self.conn
            .execute(&query, [])
            .map_err(|e| Error::warehouse_load("", "Create schema failed", e))?;
        debug!("Ensured dataset exists: {}", dataset);
        Ok(())
    }

    fn table_exists(&self, table: &TableId) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = ? AND table_name = ?",
            )
            .map_err(|e| Error::warehouse_load(table.to_string(), "Check table exists failed", e))?;

        let count: i64 = stmt
            .query_row([&table.dataset, &table.table], |row| row.get(0))
            .map_err(|e| Error::warehouse_load(table.to_string(), "Check table exists failed", e))?;

        Ok(count > 0)
    }

    #[instrument(skip(self, schema), fields(table = %table))]
    fn create_table(&self, table: &TableId, schema: &[ColumnSchema]) -> Result<()> {
        let ddl = create_table_ddl(&table.sql_ref(), schema, false);
        debug!("Creating table with DDL: {}", ddl);
        self.conn
            .execute_batch(&ddl)
            .map_err(|e| Error::warehouse_load(table.to_string(), "Create table failed", e))
    }

    fn delete_table(&self, table: &TableId) -> Result<()> {
        let query = format!("DROP TABLE IF EXISTS {}", table.sql_ref());
        self.conn
            .execute_batch(&query)
            .map_err(|e| Error::warehouse_load(table.to_string(), "Drop table failed", e))?;
        debug!("Dropped table {}", table);
        Ok(())
    }

    #[instrument(skip(self, rows, schema), fields(table = %table, count = rows.len(), mode = %mode))]
    fn load_rows(
        &self,
        table: &TableId,
        rows: &RowBatch<'_>,
        schema: &[ColumnSchema],
        mode: WriteMode,
    ) -> Result<usize> {
        let name = table.to_string();
        self.in_transaction(&name, || {
            let ddl = create_table_ddl(&table.sql_ref(), schema, mode == WriteMode::Replace);
            self.conn
                .execute_batch(&ddl)
                .map_err(|e| Error::warehouse_load(&name, "Prepare target table failed", e))?;
            self.insert_batch(table, rows, schema)
        })
    }

    fn run_query(&self, sql: &str, params: &[CellValue]) -> Result<Vec<Vec<CellValue>>> {
        let values: Vec<Value> = params.iter().map(to_duckdb_value).collect();
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| Error::warehouse_load("", "Prepare query failed", e))?;
        let mut rows = stmt
            .query(params_from_iter(values.iter()))
            .map_err(|e| Error::warehouse_load("", "Query failed", e))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| Error::warehouse_load("", "Reading query rows failed", e))?
        {
            let width = row.as_ref().column_count();
            let mut cells = Vec::with_capacity(width);
            for i in 0..width {
                let value: Value = row
                    .get(i)
                    .map_err(|e| Error::warehouse_load("", "Reading query value failed", e))?;
                cells.push(from_duckdb_value(value));
            }
            out.push(cells);
        }
        Ok(out)
    }

    fn execute(&self, sql: &str, params: &[CellValue]) -> Result<usize> {
        let values: Vec<Value> = params.iter().map(to_duckdb_value).collect();
        self.conn
            .execute(sql, params_from_iter(values.iter()))
            .map_err(|e| Error::warehouse_load("", "Execute failed", e))
    }

    fn execute_script(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).map_err(|e| {
            // A failed script may leave its transaction open
            let _ = self.conn.execute_batch("ROLLBACK");
            Error::warehouse_load("", "Execute script failed", e)
        })
    }

    fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| Error::warehouse_connection("Failed to close connection", e))
    }
}

/// Bind a cell as a DuckDB parameter; timestamps travel as text and are cast in SQL.
fn to_duckdb_value(value: &CellValue) -> Value {
    match value {
        CellValue::Null => Value::Null,
        CellValue::Text(s) => Value::Text(s.clone()),
        CellValue::Integer(i) => Value::BigInt(*i),
        CellValue::Float(f) => Value::Double(*f),
        CellValue::Boolean(b) => Value::Boolean(*b),
        CellValue::Timestamp(ts) => Value::Text(ts.format(TIMESTAMP_FORMAT).to_string()),
    }
}

fn from_duckdb_value(value: Value) -> CellValue {
    match value {
        Value::Null => CellValue::Null,
        Value::Boolean(b) => CellValue::Boolean(b),
        Value::TinyInt(n) => CellValue::Integer(n.into()),
        Value::SmallInt(n) => CellValue::Integer(n.into()),
        Value::Int(n) => CellValue::Integer(n.into()),
        Value::BigInt(n) => CellValue::Integer(n),
        Value::UTinyInt(n) => CellValue::Integer(n.into()),
        Value::USmallInt(n) => CellValue::Integer(n.into()),
        Value::UInt(n) => CellValue::Integer(n.into()),
        Value::Float(n) => CellValue::Float(n.into()),
        Value::Double(n) => CellValue::Float(n),
        Value::Text(s) => CellValue::Text(s),
        Value::Timestamp(unit, raw) => {
            let micros = unit.to_micros(raw);
            chrono::DateTime::from_timestamp_micros(micros)
                .map(|dt| CellValue::Timestamp(dt.naive_utc()))
                .unwrap_or(CellValue::Null)
        }
        Value::Date32(days) => chrono::DateTime::from_timestamp(i64::from(days) * 86_400, 0)
            .map(|dt| CellValue::Timestamp(dt.naive_utc()))
            .unwrap_or(CellValue::Null),
        other => CellValue::Text(format!("{:?}", other)),
    }
}
