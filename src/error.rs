//! Error types for ledger-sync.

use thiserror::Error;
use tracing::error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ledger-sync operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
        /// Source error if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// SQL Server connection error
    #[error("Source connection error: {message}")]
    SourceConnection {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<tiberius::error::Error>,
    },

    /// SQL Server query error
    #[error("Source query error on table '{table}': {message}")]
    SourceQuery {
        /// Table name
        table: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<tiberius::error::Error>,
    },

    /// Warehouse connection error
    #[error("Warehouse connection error: {message}")]
    WarehouseConnection {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<duckdb::Error>,
    },

    /// Warehouse load or query error
    #[error("Warehouse error on table '{table}': {message}")]
    WarehouseLoad {
        /// Table name
        table: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<duckdb::Error>,
    },

    /// A single cell or column could not be converted.
    ///
    /// Always recovered where it is raised; it never aborts a table.
    #[error("Cannot convert column '{column}': {message}")]
    CellConversion {
        /// Column name
        column: String,
        /// Error message
        message: String,
    },

    /// Sync metadata could not be written
    #[error("Metadata update failed for table '{table}': {message}")]
    MetadataUpdate {
        /// Table name
        table: String,
        /// Error message
        message: String,
        /// Underlying warehouse error
        #[source]
        source: Option<Box<Error>>,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source.
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a source connection error.
    pub fn source_connection(message: impl Into<String>, source: tiberius::error::Error) -> Self {
        Self::SourceConnection {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a source query error.
    pub fn source_query(
        table: impl Into<String>,
        message: impl Into<String>,
        source: tiberius::error::Error,
    ) -> Self {
        Self::SourceQuery {
            table: table.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a source query error without an underlying driver error.
    pub fn source_query_msg(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SourceQuery {
            table: table.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a warehouse connection error.
    pub fn warehouse_connection(message: impl Into<String>, source: duckdb::Error) -> Self {
        Self::WarehouseConnection {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a warehouse load error.
    pub fn warehouse_load(
        table: impl Into<String>,
        message: impl Into<String>,
        source: duckdb::Error,
    ) -> Self {
        Self::WarehouseLoad {
            table: table.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a warehouse load error without an underlying driver error.
    pub fn warehouse_load_msg(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WarehouseLoad {
            table: table.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a cell conversion error.
    pub fn cell_conversion(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CellConversion {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create a metadata update error wrapping the failure that caused it.
    pub fn metadata_update(table: impl Into<String>, source: Error) -> Self {
        Self::MetadataUpdate {
            table: table.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Check if this error is retryable.
    ///
    /// Only connection establishment is retried; queries and loads are left to
    /// the external scheduler.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SourceConnection { .. } | Error::WarehouseConnection { .. } | Error::Io(_)
        )
    }

    /// Get the error code for metrics/logging.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "CONFIG_ERROR",
            Error::SourceConnection { .. } => "SOURCE_CONNECTION_ERROR",
            Error::SourceQuery { .. } => "SOURCE_QUERY_ERROR",
            Error::WarehouseConnection { .. } => "WAREHOUSE_CONNECTION_ERROR",
            Error::WarehouseLoad { .. } => "WAREHOUSE_LOAD_ERROR",
            Error::CellConversion { .. } => "CELL_CONVERSION_ERROR",
            Error::MetadataUpdate { .. } => "METADATA_UPDATE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Cancelled => "CANCELLED",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

/// Error context extension trait.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation).
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ErrorContext<T>
    for std::result::Result<T, E>
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::config_with_source(message, e))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::config_with_source(f(), e))
    }
}

/// Sink for run-aborting errors (an error tracker, a pager, ...).
pub trait ErrorReporter: Send + Sync {
    /// Report an error that aborted a run.
    fn capture(&self, error: &Error);
}

/// Reporter that writes captured errors to the log with their error code.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn capture(&self, err: &Error) {
        metrics::counter!("ledger_sync_errors_total", "code" => err.code()).increment(1);
        error!(code = err.code(), "Sync aborted: {}", err);
    }
}
