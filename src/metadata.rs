//! Per-table sync bookkeeping stored in the warehouse.

use crate::error::{Error, Result};
use crate::rowset::{CellValue, NormalizedRowSet};
use crate::schema::metadata_table_schema;
use crate::sync::SyncMode;
use crate::warehouse::{TableId, Warehouse};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use tracing::{debug, info, instrument};

/// One row of the metadata table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMetadataRecord {
    /// Synced table
    pub table_name: String,
    /// When the last successful pass finished
    pub last_sync_timestamp: Option<NaiveDateTime>,
    /// Largest business date seen in the last pass
    pub last_max_date: Option<NaiveDate>,
    /// Rows written in the last pass
    pub records_synced: i64,
    /// Mode of the last pass
    pub sync_mode: String,
    /// First time the table was recorded
    pub created_at: Option<NaiveDateTime>,
    /// Last time the record changed
    pub updated_at: Option<NaiveDateTime>,
}

/// Reads and upserts [`SyncMetadataRecord`]s.
pub struct MetadataStore<'a, W: Warehouse + ?Sized> {
    warehouse: &'a W,
    table: TableId,
    ensured: Cell<bool>,
}

impl<'a, W: Warehouse + ?Sized> MetadataStore<'a, W> {
    /// Create a store writing to `table`.
    pub fn new(warehouse: &'a W, table: TableId) -> Self {
        Self {
            warehouse,
            table,
            ensured: Cell::new(false),
        }
    }

    /// Metadata table location.
    pub fn table(&self) -> &TableId {
        &self.table
    }

    fn ensure_table(&self) -> Result<()> {
        if !self.ensured.get() {
            self.warehouse
                .create_table(&self.table, &metadata_table_schema())?;
            self.ensured.set(true);
            debug!("Ensured metadata table {}", self.table);
        }
        Ok(())
    }

    /// Record a successful pass for `table_name`.
    ///
    /// Updates the existing row, or inserts one when none matched.
    #[instrument(skip(self), fields(metadata = %self.table))]
    pub fn record(
        &self,
        table_name: &str,
        records_synced: usize,
        mode: SyncMode,
        last_max_date: Option<NaiveDate>,
    ) -> Result<()> {
        self.upsert(table_name, records_synced, mode, last_max_date)
            .map_err(|e| Error::metadata_update(table_name, e))?;
        metrics::counter!("ledger_sync_metadata_updates_total").increment(1);
        info!("Recorded sync metadata for {}", table_name);
        Ok(())
    }

    fn upsert(
        &self,
        table_name: &str,
        records_synced: usize,
        mode: SyncMode,
        last_max_date: Option<NaiveDate>,
    ) -> Result<()> {
        self.ensure_table()?;

        let now = CellValue::Timestamp(Utc::now().naive_utc());
        let max_date = last_max_date
            .map(|d| CellValue::Text(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(CellValue::Null);
        let records = CellValue::Integer(i64::try_from(records_synced).unwrap_or(i64::MAX));
        let mode = CellValue::Text(mode.to_string());
        let name = CellValue::Text(table_name.to_string());
        let target = self.table.sql_ref();

        let update = format!(
            "UPDATE {} SET last_sync_timestamp = CAST(? AS TIMESTAMP), last_max_date = CAST(? AS DATE), \
             records_synced = ?, sync_mode = ?, updated_at = CAST(? AS TIMESTAMP) WHERE table_name = ?",
            target
        );
        let updated = self.warehouse.execute(
            &update,
            &[
                now.clone(),
                max_date.clone(),
                records.clone(),
                mode.clone(),
                now.clone(),
                name.clone(),
            ],
        )?;
        if updated > 0 {
            return Ok(());
        }

        let insert = format!(
            "INSERT INTO {} (table_name, last_sync_timestamp, last_max_date, records_synced, sync_mode, created_at, updated_at) \
             VALUES (?, CAST(? AS TIMESTAMP), CAST(? AS DATE), ?, ?, CAST(? AS TIMESTAMP), CAST(? AS TIMESTAMP))",
            target
        );
        self.warehouse.execute(
            &insert,
            &[name, now.clone(), max_date, records, mode, now.clone(), now],
        )?;
        Ok(())
    }

    /// Every recorded table, ordered by name. Empty when nothing was recorded yet.
    pub fn read_all(&self) -> Result<Vec<SyncMetadataRecord>> {
        if !self.warehouse.table_exists(&self.table)? {
            return Ok(Vec::new());
        }

        let query = format!(
            "SELECT table_name, last_sync_timestamp, last_max_date, records_synced, sync_mode, created_at, updated_at \
             FROM {} ORDER BY table_name",
            self.table.sql_ref()
        );
        let rows = self.warehouse.run_query(&query, &[])?;
        Ok(rows.into_iter().map(record_from_row).collect())
    }
}

fn record_from_row(row: Vec<CellValue>) -> SyncMetadataRecord {
    let mut cells = row.into_iter();
    let mut next = || cells.next().unwrap_or(CellValue::Null);

    let table_name = next().to_text().unwrap_or_default();
    let last_sync_timestamp = timestamp(next());
    let last_max_date = timestamp(next()).map(|ts| ts.date());
    let records_synced = match next() {
        CellValue::Integer(n) => n,
        CellValue::Float(f) => f as i64,
        _ => 0,
    };
    let sync_mode = next().to_text().unwrap_or_default();
    let created_at = timestamp(next());
    let updated_at = timestamp(next());

    SyncMetadataRecord {
        table_name,
        last_sync_timestamp,
        last_max_date,
        records_synced,
        sync_mode,
        created_at,
        updated_at,
    }
}

fn timestamp(value: CellValue) -> Option<NaiveDateTime> {
    match value {
        CellValue::Timestamp(ts) => Some(ts),
        _ => None,
    }
}

/// Largest date in `column`, if the column exists and holds any.
///
/// Text values are accepted when they start with `YYYY-MM-DD`.
pub fn max_business_date(rows: &NormalizedRowSet, column: &str) -> Option<NaiveDate> {
    rows.column(column)?
        .values
        .iter()
        .filter_map(|value| match value {
            CellValue::Timestamp(ts) => Some(ts.date()),
            CellValue::Text(s) => s
                .get(..10)
                .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()),
            _ => None,
        })
        .max()
}
