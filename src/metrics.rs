//! In-process counters for sync runs.
//!
//! The `metrics` facade counters emitted throughout the crate go to whatever
//! recorder the host installs; [`SyncMetrics`] keeps a local copy that the CLI
//! can print without one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics collector for sync runs.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    /// Runs attempted
    pub runs_total: AtomicU64,
    /// Runs that finished every table
    pub runs_success: AtomicU64,
    /// Runs aborted by a table failure
    pub runs_failed: AtomicU64,
    /// Tables loaded
    pub tables_synced: AtomicU64,
    /// Rows fetched from the source
    pub rows_fetched: AtomicU64,
    /// Rows written to the warehouse
    pub rows_loaded: AtomicU64,
    /// Cells replaced by NULL during validation
    pub cells_nullified: AtomicU64,
    /// Warehouse load calls
    pub batches: AtomicU64,
    /// Total run duration in milliseconds
    pub run_duration_ms: AtomicU64,
}

impl SyncMetrics {
    /// Create a new collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished run.
    pub fn record_run(&self, success: bool, duration_ms: u64) {
        self.runs_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.runs_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.runs_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.run_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
        metrics::histogram!("ledger_sync_run_duration_seconds").record(duration_ms as f64 / 1000.0);
    }

    /// Record one loaded table.
    pub fn record_table(&self, fetched: u64, loaded: u64, nullified: u64, batches: u64) {
        self.tables_synced.fetch_add(1, Ordering::Relaxed);
        self.rows_fetched.fetch_add(fetched, Ordering::Relaxed);
        self.rows_loaded.fetch_add(loaded, Ordering::Relaxed);
        self.cells_nullified.fetch_add(nullified, Ordering::Relaxed);
        self.batches.fetch_add(batches, Ordering::Relaxed);
    }

    /// Get snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_total: self.runs_total.load(Ordering::Relaxed),
            runs_success: self.runs_success.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            tables_synced: self.tables_synced.load(Ordering::Relaxed),
            rows_fetched: self.rows_fetched.load(Ordering::Relaxed),
            rows_loaded: self.rows_loaded.load(Ordering::Relaxed),
            cells_nullified: self.cells_nullified.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            run_duration_ms: self.run_duration_ms.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Runs attempted
    pub runs_total: u64,
    /// Runs that finished every table
    pub runs_success: u64,
    /// Runs aborted by a table failure
    pub runs_failed: u64,
    /// Tables loaded
    pub tables_synced: u64,
    /// Rows fetched from the source
    pub rows_fetched: u64,
    /// Rows written to the warehouse
    pub rows_loaded: u64,
    /// Cells replaced by NULL during validation
    pub cells_nullified: u64,
    /// Warehouse load calls
    pub batches: u64,
    /// Total run duration in milliseconds
    pub run_duration_ms: u64,
}

impl MetricsSnapshot {
    /// Share of runs that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.runs_total == 0 {
            0.0
        } else {
            self.runs_success as f64 / self.runs_total as f64
        }
    }

    /// Loaded rows per second of run time.
    pub fn rows_per_second(&self) -> f64 {
        if self.run_duration_ms == 0 {
            0.0
        } else {
            (self.rows_loaded as f64 * 1000.0) / self.run_duration_ms as f64
        }
    }
}

/// Timer for measuring operation duration.
pub struct Timer {
    start: Instant,
    label: String,
}

impl Timer {
    /// Start a new timer.
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            label: label.into(),
        }
    }

    /// Time since start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop timer and log duration.
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!("{} completed in {}ms", self.label, elapsed);
        elapsed
    }
}
