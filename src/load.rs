//! Batched loading into the warehouse: full refresh or staged merge-upsert.

use crate::error::{Error, Result};
use crate::rowset::NormalizedRowSet;
use crate::schema::{ColumnSchema, quote_ident};
use crate::sync::SyncMode;
use crate::warehouse::{TableId, Warehouse, WriteMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, instrument, warn};

/// How a table is loaded in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// Full mode, target absent
    BootstrapFull,
    /// Full mode, target present
    Full,
    /// Incremental mode, target present: stage then merge
    IncrementalUpsert,
    /// Incremental mode, target absent: loaded like a full refresh
    IncrementalBootstrap,
}

impl LoadStrategy {
    /// Pick the strategy from the configured mode and target existence.
    pub fn decide(mode: SyncMode, target_exists: bool) -> Self {
        match (mode, target_exists) {
            (SyncMode::Full, false) => LoadStrategy::BootstrapFull,
            (SyncMode::Full, true) => LoadStrategy::Full,
            (SyncMode::Incremental, true) => LoadStrategy::IncrementalUpsert,
            (SyncMode::Incremental, false) => LoadStrategy::IncrementalBootstrap,
        }
    }

    /// Whether rows are staged and merged instead of replacing the table.
    pub fn merges(&self) -> bool {
        matches!(self, LoadStrategy::IncrementalUpsert)
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStrategy::BootstrapFull => write!(f, "bootstrap_full"),
            LoadStrategy::Full => write!(f, "full"),
            LoadStrategy::IncrementalUpsert => write!(f, "incremental_upsert"),
            LoadStrategy::IncrementalBootstrap => write!(f, "incremental_bootstrap"),
        }
    }
}

/// Result of loading one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOutcome {
    /// Strategy used
    pub strategy: LoadStrategy,
    /// Rows written to the target or staging table
    pub rows_loaded: usize,
    /// Load calls issued
    pub batches: usize,
    /// Staging table used for the merge, already dropped
    pub staging_table: Option<String>,
}

/// Batch progress callback: `(batch_number, total_batches, rows_so_far)`.
pub type BatchCallback<'a> = &'a (dyn Fn(usize, usize, usize) + Send + Sync);

/// Loads normalized row sets into one warehouse.
pub struct TableLoader<'a, W: Warehouse + ?Sized> {
    warehouse: &'a W,
    batch_size: usize,
    id_column: &'a str,
    on_batch: Option<BatchCallback<'a>>,
}

impl<'a, W: Warehouse + ?Sized> TableLoader<'a, W> {
    /// Create a loader.
    pub fn new(warehouse: &'a W, batch_size: usize, id_column: &'a str) -> Self {
        Self {
            warehouse,
            batch_size: batch_size.max(1),
            id_column,
            on_batch: None,
        }
    }

    /// Report each finished batch.
    pub fn with_progress(mut self, callback: BatchCallback<'a>) -> Self {
        self.on_batch = Some(callback);
        self
    }

    /// Load `rows` into `table` with the given strategy.
    ///
    /// An empty row set issues no load call. For merges the staging table is
    /// dropped before returning, whether the load succeeded or not.
    #[instrument(skip(self, rows, schema), fields(table = %table, strategy = %strategy, rows = rows.row_count()))]
    pub fn load(
        &self,
        table: &TableId,
        rows: &NormalizedRowSet,
        schema: &[ColumnSchema],
        strategy: LoadStrategy,
    ) -> Result<LoadOutcome> {
        if rows.is_empty() {
            warn!("No rows for {}, skipping load", table);
            return Ok(LoadOutcome {
                strategy,
                rows_loaded: 0,
                batches: 0,
                staging_table: None,
            });
        }

        if !strategy.merges() {
            let (rows_loaded, batches) = self.load_batches(table, rows, schema)?;
            info!("Loaded {} rows into {} in {} batches", rows_loaded, table, batches);
            return Ok(LoadOutcome {
                strategy,
                rows_loaded,
                batches,
                staging_table: None,
            });
        }

        let staging = table.with_table(staging_table_name(&table.table, Utc::now()));
        info!("Staging {} rows in {}", rows.row_count(), staging);

        let result = self
            .load_batches(&staging, rows, schema)
            .and_then(|(rows_loaded, batches)| {
                let sql = merge_sql(table, &staging, schema, self.id_column)?;
                debug!("Merge statement: {}", sql);
                self.warehouse.execute_script(&sql)?;
                Ok((rows_loaded, batches))
            });

        if let Err(e) = self.warehouse.delete_table(&staging) {
            warn!("Failed to drop staging table {}: {}", staging, e);
        }

        let (rows_loaded, batches) = result?;
        info!("Merged {} rows into {} via {}", rows_loaded, table, staging.table);
        Ok(LoadOutcome {
            strategy,
            rows_loaded,
            batches,
            staging_table: Some(staging.table),
        })
    }

    fn load_batches(
        &self,
        table: &TableId,
        rows: &NormalizedRowSet,
        schema: &[ColumnSchema],
    ) -> Result<(usize, usize)> {
        let total = rows.batch_count(self.batch_size);
        let mut loaded = 0;

        for (i, batch) in rows.batches(self.batch_size).enumerate() {
            let mode = if i == 0 {
                WriteMode::Replace
            } else {
                WriteMode::Append
            };
            debug!("Batch {}/{} ({} rows, {})", i + 1, total, batch.len(), mode);
            loaded += self.warehouse.load_rows(table, &batch, schema, mode)?;

            metrics::counter!("ledger_sync_load_calls_total").increment(1);
            if let Some(callback) = self.on_batch {
                callback(i + 1, total, loaded);
            }
        }

        metrics::counter!("ledger_sync_rows_loaded_total", "table" => table.table.clone())
            .increment(loaded as u64);
        Ok((loaded, total))
    }
}

const TARGET_ALIAS: &str = "\"__target\"";
const STAGING_ALIAS: &str = "\"__staging\"";

/// Unique staging table name for a target table.
pub fn staging_table_name(table: &str, now: DateTime<Utc>) -> String {
    format!("{}__staging_{}", table, now.format("%Y%m%d%H%M%S%3f"))
}

/// Set-based merge from `staging` into `target` on `id_column`.
///
/// Matching rows get every other column updated; the rest are inserted.
/// The statement only contains quoted identifiers.
pub fn merge_sql(
    target: &TableId,
    staging: &TableId,
    schema: &[ColumnSchema],
    id_column: &str,
) -> Result<String> {
    if !schema.iter().any(|c| c.name == id_column) {
        return Err(Error::validation(format!(
            "Identifier column {} missing from {}, cannot merge",
            id_column, target
        )));
    }

    let target_ref = target.sql_ref();
    let staging_ref = staging.sql_ref();
    let id = quote_ident(id_column);

    let mut sql = String::from("BEGIN TRANSACTION;\n");

    let assignments: Vec<String> = schema
        .iter()
        .filter(|c| c.name != id_column)
        .map(|c| {
            let col = quote_ident(&c.name);
            format!("{} = {}.{}", col, STAGING_ALIAS, col)
        })
        .collect();
    if !assignments.is_empty() {
        sql.push_str(&format!(
            "UPDATE {} AS {t} SET {} FROM {} AS {s} WHERE {t}.{} = {s}.{};\n",
            target_ref,
            assignments.join(", "),
            staging_ref,
            id,
            id,
            t = TARGET_ALIAS,
            s = STAGING_ALIAS,
        ));
    }

    let columns: Vec<String> = schema.iter().map(|c| quote_ident(&c.name)).collect();
    let selected: Vec<String> = columns
        .iter()
        .map(|c| format!("{}.{}", STAGING_ALIAS, c))
        .collect();
    sql.push_str(&format!(
        "INSERT INTO {} ({}) SELECT {} FROM {} AS {s} WHERE NOT EXISTS (SELECT 1 FROM {} AS {t} WHERE {t}.{} = {s}.{});\n",
        target_ref,
        columns.join(", "),
        selected.join(", "),
        staging_ref,
        target_ref,
        id,
        id,
        t = TARGET_ALIAS,
        s = STAGING_ALIAS,
    ));

    sql.push_str("COMMIT;");
    Ok(sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motherduck::MotherDuckClient;
    use crate::rowset::{CellValue, NormalizedColumn, RowBatch};
    use crate::schema::{LogicalType, infer_schema};
    use chrono::TimeZone;
    use std::cell::RefCell;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Load {
            table: String,
            rows: usize,
            mode: WriteMode,
        },
        Script(String),
        Delete(String),
    }

    #[derive(Default)]
    struct RecordingWarehouse {
        calls: RefCell<Vec<Call>>,
        fail_load: bool,
        fail_script: bool,
        fail_delete: bool,
    }

    impl RecordingWarehouse {
        fn calls(&self) -> Vec<Call> {
            self.calls.borrow().clone()
        }

        fn loads(&self) -> Vec<(String, WriteMode)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Load { table, mode, .. } => Some((table, mode)),
                    _ => None,
                })
                .collect()
        }

        fn scripts(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Script(_)))
                .count()
        }
    }

    impl Warehouse for RecordingWarehouse {
        fn ping(&self) -> Result<()> {
            Ok(())
        }

        fn create_dataset_if_absent(&self, _dataset: &str) -> Result<()> {
            Ok(())
        }

        fn table_exists(&self, _table: &TableId) -> Result<bool> {
            Ok(true)
        }

        fn create_table(&self, _table: &TableId, _schema: &[ColumnSchema]) -> Result<()> {
            Ok(())
        }

        fn delete_table(&self, table: &TableId) -> Result<()> {
            self.calls.borrow_mut().push(Call::Delete(table.table.clone()));
            if self.fail_delete {
                return Err(Error::warehouse_load_msg(&table.table, "delete refused"));
            }
            Ok(())
        }

        fn load_rows(
            &self,
            table: &TableId,
            rows: &RowBatch<'_>,
            _schema: &[ColumnSchema],
            mode: WriteMode,
        ) -> Result<usize> {
            self.calls.borrow_mut().push(Call::Load {
                table: table.table.clone(),
                rows: rows.len(),
                mode,
            });
            if self.fail_load {
                return Err(Error::warehouse_load_msg(&table.table, "load refused"));
            }
            Ok(rows.len())
        }

        fn run_query(&self, _sql: &str, _params: &[CellValue]) -> Result<Vec<Vec<CellValue>>> {
            Ok(vec![])
        }

        fn execute(&self, _sql: &str, _params: &[CellValue]) -> Result<usize> {
            Ok(0)
        }

        fn execute_script(&self, sql: &str) -> Result<()> {
            self.calls.borrow_mut().push(Call::Script(sql.to_string()));
            if self.fail_script {
                return Err(Error::warehouse_load_msg("", "merge refused"));
            }
            Ok(())
        }
    }

    fn rows(n: usize) -> NormalizedRowSet {
        NormalizedRowSet::new(vec![
            NormalizedColumn::new(
                "ID",
                (0..n).map(|i| CellValue::Text(i.to_string())).collect(),
            ),
            NormalizedColumn::new("Kc", (0..n).map(|i| CellValue::Float(i as f64)).collect()),
        ])
        .unwrap()
    }

    fn table() -> TableId {
        TableId::new("analytics", "main", "faktury")
    }

    #[test]
    fn test_decide_strategy() {
        assert_eq!(LoadStrategy::decide(SyncMode::Full, false), LoadStrategy::BootstrapFull);
        assert_eq!(LoadStrategy::decide(SyncMode::Full, true), LoadStrategy::Full);
        assert_eq!(
            LoadStrategy::decide(SyncMode::Incremental, true),
            LoadStrategy::IncrementalUpsert
        );
        assert_eq!(
            LoadStrategy::decide(SyncMode::Incremental, false),
            LoadStrategy::IncrementalBootstrap
        );
        assert!(LoadStrategy::IncrementalUpsert.merges());
        assert!(!LoadStrategy::IncrementalBootstrap.merges());
    }

    #[test]
    fn test_full_load_batches() {
        let warehouse = RecordingWarehouse::default();
        let data = rows(250);
        let schema = infer_schema(&data, "ID");

        let outcome = TableLoader::new(&warehouse, 100, "ID")
            .load(&table(), &data, &schema, LoadStrategy::Full)
            .unwrap();

        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.rows_loaded, 250);
        assert_eq!(
            warehouse.loads(),
            vec![
                ("faktury".to_string(), WriteMode::Replace),
                ("faktury".to_string(), WriteMode::Append),
                ("faktury".to_string(), WriteMode::Append),
            ]
        );
        assert_eq!(warehouse.scripts(), 0);
    }

    #[test]
    fn test_incremental_bootstrap_is_a_full_load() {
        let warehouse = RecordingWarehouse::default();
        let data = rows(10);
        let schema = infer_schema(&data, "ID");

        let outcome = TableLoader::new(&warehouse, 100, "ID")
            .load(&table(), &data, &schema, LoadStrategy::IncrementalBootstrap)
            .unwrap();

        assert_eq!(outcome.staging_table, None);
        assert_eq!(warehouse.loads(), vec![("faktury".to_string(), WriteMode::Replace)]);
        assert_eq!(warehouse.scripts(), 0);
    }

    #[test]
    fn test_empty_rows_issue_no_calls() {
        let warehouse = RecordingWarehouse::default();
        let data = rows(0);
        let outcome = TableLoader::new(&warehouse, 100, "ID")
            .load(&table(), &data, &[], LoadStrategy::IncrementalUpsert)
            .unwrap();

        assert_eq!(outcome.batches, 0);
        assert!(warehouse.calls().is_empty());
    }

    #[test]
    fn test_upsert_stages_merges_and_drops() {
        let warehouse = RecordingWarehouse::default();
        let data = rows(150);
        let schema = infer_schema(&data, "ID");

        let outcome = TableLoader::new(&warehouse, 100, "ID")
            .load(&table(), &data, &schema, LoadStrategy::IncrementalUpsert)
            .unwrap();

        let staging = outcome.staging_table.unwrap();
        assert!(staging.starts_with("faktury__staging_"));

        let calls = warehouse.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(
            calls[0],
            Call::Load {
                table: staging.clone(),
                rows: 100,
                mode: WriteMode::Replace
            }
        );
        assert_eq!(
            calls[1],
            Call::Load {
                table: staging.clone(),
                rows: 50,
                mode: WriteMode::Append
            }
        );
        assert!(matches!(&calls[2], Call::Script(sql) if sql.contains(&staging)));
        assert_eq!(calls[3], Call::Delete(staging));
    }

    #[test]
    fn test_failed_merge_still_drops_staging() {
        let warehouse = RecordingWarehouse {
            fail_script: true,
            ..Default::default()
        };
        let data = rows(5);
        let schema = infer_schema(&data, "ID");

        let err = TableLoader::new(&warehouse, 100, "ID")
            .load(&table(), &data, &schema, LoadStrategy::IncrementalUpsert)
            .unwrap_err();

        assert!(err.to_string().contains("merge refused"));
        assert!(matches!(warehouse.calls().last(), Some(Call::Delete(t)) if t.starts_with("faktury__staging_")));
    }

    #[test]
    fn test_cleanup_failure_does_not_mask_load_error() {
        let warehouse = RecordingWarehouse {
            fail_load: true,
            fail_delete: true,
            ..Default::default()
        };
        let data = rows(5);
        let schema = infer_schema(&data, "ID");

        let err = TableLoader::new(&warehouse, 100, "ID")
            .load(&table(), &data, &schema, LoadStrategy::IncrementalUpsert)
            .unwrap_err();

        assert!(err.to_string().contains("load refused"));
        assert_eq!(warehouse.scripts(), 0);
        assert!(matches!(warehouse.calls().last(), Some(Call::Delete(_))));
    }

    #[test]
    fn test_merge_requires_id_column() {
        let schema = vec![ColumnSchema::new("Kc", LogicalType::Float)];
        let staging = table().with_table("s");
        assert!(merge_sql(&table(), &staging, &schema, "ID").is_err());
    }

    #[test]
    fn test_staging_name_has_millisecond_suffix() {
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(staging_table_name("faktury", now), "faktury__staging_20240506070809042");
    }

    #[test]
    fn test_progress_callback() {
        let warehouse = RecordingWarehouse::default();
        let data = rows(30);
        let schema = infer_schema(&data, "ID");
        let seen = std::sync::Mutex::new(Vec::new());
        let callback = |batch: usize, total: usize, done: usize| {
            seen.lock().unwrap().push((batch, total, done));
        };

        TableLoader::new(&warehouse, 10, "ID")
            .with_progress(&callback)
            .load(&table(), &data, &schema, LoadStrategy::Full)
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(1, 3, 10), (2, 3, 20), (3, 3, 30)]);
    }

    #[test]
    fn test_upsert_against_duckdb() {
        let warehouse = MotherDuckClient::in_memory().unwrap();
        warehouse.create_dataset_if_absent("main").unwrap();
        let target = TableId::new("memory", "main", "faktury");
        let loader = TableLoader::new(&warehouse, 2, "ID");

        let initial = NormalizedRowSet::new(vec![
            NormalizedColumn::new("ID", vec![CellValue::Text("1".into()), CellValue::Text("2".into())]),
            NormalizedColumn::new("Kc", vec![CellValue::Float(10.0), CellValue::Float(20.0)]),
        ])
        .unwrap();
        let schema = infer_schema(&initial, "ID");
        loader
            .load(&target, &initial, &schema, LoadStrategy::BootstrapFull)
            .unwrap();

        let delta = NormalizedRowSet::new(vec![
            NormalizedColumn::new(
                "ID",
                vec![
                    CellValue::Text("2".into()),
                    CellValue::Text("3".into()),
                    CellValue::Text("4".into()),
                ],
            ),
            NormalizedColumn::new(
                "Kc",
                vec![CellValue::Float(25.0), CellValue::Float(30.0), CellValue::Null],
            ),
        ])
        .unwrap();
        let exists = warehouse.table_exists(&target).unwrap();
        let strategy = LoadStrategy::decide(SyncMode::Incremental, exists);
        assert_eq!(strategy, LoadStrategy::IncrementalUpsert);

        let outcome = loader.load(&target, &delta, &schema, strategy).unwrap();
        assert_eq!(outcome.batches, 2);

        let rows = warehouse
            .run_query(
                &format!("SELECT \"ID\", \"Kc\" FROM {} ORDER BY \"ID\"", target.sql_ref()),
                &[],
            )
            .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![CellValue::Text("1".into()), CellValue::Float(10.0)],
                vec![CellValue::Text("2".into()), CellValue::Float(25.0)],
                vec![CellValue::Text("3".into()), CellValue::Float(30.0)],
                vec![CellValue::Text("4".into()), CellValue::Null],
            ]
        );

        let staging = target.with_table(outcome.staging_table.unwrap());
        assert!(!warehouse.table_exists(&staging).unwrap());
    }

    #[test]
    fn test_upsert_into_single_letter_tables() {
        let warehouse = MotherDuckClient::in_memory().unwrap();
        warehouse.create_dataset_if_absent("main").unwrap();
        let loader = TableLoader::new(&warehouse, 10, "ID");

        for name in ["s", "t"] {
            let target = TableId::new("memory", "main", name);
            let initial = NormalizedRowSet::new(vec![
                NormalizedColumn::new("ID", vec![CellValue::Integer(1)]),
                NormalizedColumn::new("Popis", vec![CellValue::Text("old".into())]),
            ])
            .unwrap();
            let schema = infer_schema(&initial, "ID");
            loader
                .load(&target, &initial, &schema, LoadStrategy::BootstrapFull)
                .unwrap();

            let delta = NormalizedRowSet::new(vec![
                NormalizedColumn::new("ID", vec![CellValue::Integer(1), CellValue::Integer(2)]),
                NormalizedColumn::new(
                    "Popis",
                    vec![CellValue::Text("new".into()), CellValue::Text("added".into())],
                ),
            ])
            .unwrap();
            loader
                .load(&target, &delta, &schema, LoadStrategy::IncrementalUpsert)
                .unwrap();

            let rows = warehouse
                .run_query(
                    &format!("SELECT \"ID\", \"Popis\" FROM {} ORDER BY \"ID\"", target.sql_ref()),
                    &[],
                )
                .unwrap();
            assert_eq!(
                rows,
                vec![
                    vec![CellValue::Integer(1), CellValue::Text("new".into())],
                    vec![CellValue::Integer(2), CellValue::Text("added".into())],
                ]
            );
        }
    }
}
