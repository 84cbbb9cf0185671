//! SQL Server source client for ledger-sync.

use crate::config::{RetryConfig, SourceConfig};
use crate::error::{Error, Result};
use crate::query::{LinkedServer, QueryParam, SourceQuery};
use crate::rowset::{RowSet, SourceColumn, SourceValue};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::borrow::Cow;
use std::time::Duration;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, instrument, warn};

/// A source store that runs queries and returns whole row sets.
#[async_trait]
pub trait SourceStore: Send {
    /// Execute a query and materialize the full result.
    async fn execute(&mut self, query: &SourceQuery) -> Result<RowSet>;

    /// Linked server and database that business tables live in.
    async fn resolve_linked_server(&mut self) -> Result<LinkedServer>;

    /// Server version string.
    async fn server_version(&mut self) -> Result<String>;

    /// Close the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Execute a query once and log the native type of every column.
#[instrument(skip(source, query), fields(table = %query.table))]
pub async fn fetch_row_set<S>(source: &mut S, query: &SourceQuery) -> Result<RowSet>
where
    S: SourceStore + ?Sized,
{
    debug!("Executing query: {}", query.sql);
    let rows = source.execute(query).await?;

    for column in rows.columns() {
        debug!("Column {}: native type {}", column.name, column.type_tag);
    }
    info!("Fetched {} rows from source for {}", rows.row_count(), query.table);
    metrics::counter!("ledger_sync_source_rows_total", "table" => query.table.clone())
        .increment(rows.row_count() as u64);

    Ok(rows)
}

/// SQL Server client wrapper.
pub struct MssqlSource {
    client: Option<Client<Compat<TcpStream>>>,
    config: SourceConfig,
}

impl MssqlSource {
    /// Connect to SQL Server, retrying connection failures per `retry`.
    #[instrument(skip(config, retry), fields(host = %config.host, database = %config.database))]
    pub async fn connect(config: SourceConfig, retry: &RetryConfig) -> Result<Self> {
        info!("Connecting to SQL Server...");

        let mut attempt = 0u32;
        let client = backoff::future::retry(retry.backoff(), || {
            attempt += 1;
            let current = attempt;
            let config = &config;
            async move {
                open_client(config).await.map_err(|e| {
                    if e.is_retryable() && current <= retry.max_retries {
                        warn!("Connection attempt {} failed: {}", current, e);
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await?;

        info!("Connected to SQL Server");
        Ok(Self {
            client: Some(client),
            config,
        })
    }

    fn client(&mut self) -> Result<&mut Client<Compat<TcpStream>>> {
        self.client
            .as_mut()
            .ok_or_else(|| Error::source_query_msg("", "Connection already closed"))
    }
}

#[async_trait]
impl SourceStore for MssqlSource {
    async fn execute(&mut self, query: &SourceQuery) -> Result<RowSet> {
        let table = query.table.clone();
        let client = self.client()?;
        let params: Vec<&dyn ToSql> = query.params.iter().map(|p| p as &dyn ToSql).collect();

        let mut stream = client
            .query(query.sql.as_str(), &params)
            .await
            .map_err(|e| Error::source_query(&table, "Query failed", e))?;

        let header: Vec<(String, String)> = stream
            .columns()
            .await
            .map_err(|e| Error::source_query(&table, "Reading column metadata failed", e))?
            .map(|cols| {
                cols.iter()
                    .map(|c| (c.name().to_string(), format!("{:?}", c.column_type())))
                    .collect()
            })
            .unwrap_or_default();

        let rows = stream
            .into_first_result()
            .await
            .map_err(|e| Error::source_query(&table, "Reading rows failed", e))?;

        let mut values: Vec<Vec<SourceValue>> =
            header.iter().map(|_| Vec::with_capacity(rows.len())).collect();
        for row in rows {
            for (idx, data) in row.into_iter().enumerate() {
                let value = to_source_value(&data).map_err(|e| {
                    Error::source_query(&table, format!("Decoding column {} failed", idx), e)
                })?;
                if let Some(column) = values.get_mut(idx) {
                    column.push(value);
                }
            }
        }

        let columns = header
            .into_iter()
            .zip(values)
            .map(|((name, type_tag), values)| SourceColumn::new(name, type_tag, values))
            .collect();
        RowSet::new(columns)
    }

    async fn resolve_linked_server(&mut self) -> Result<LinkedServer> {
        if let (Some(server), Some(database)) = (
            self.config.linked_server.clone(),
            self.config.linked_database.clone(),
        ) {
            debug!("Using configured linked server {}/{}", server, database);
            return Ok(LinkedServer::new(server, database));
        }

        let sql = self.config.companies_query.clone();
        let client = self.client()?;
        let row = client
            .simple_query(sql.as_str())
            .await
            .map_err(|e| Error::source_query("companies", "Linked server lookup failed", e))?
            .into_row()
            .await
            .map_err(|e| Error::source_query("companies", "Linked server lookup failed", e))?
            .ok_or_else(|| Error::source_query_msg("companies", "companies table has no rows"))?;

        let server: Option<&str> = row
            .try_get(0)
            .map_err(|e| Error::source_query("companies", "Invalid linked_server value", e))?;
        let database: Option<&str> = row
            .try_get(1)
            .map_err(|e| Error::source_query("companies", "Invalid database value", e))?;

        match (server, database) {
            (Some(server), Some(database)) => {
                let linked = LinkedServer::new(server, database);
                info!("Source connection: linked_server={}, database={}", linked.server, linked.database);
                Ok(linked)
            }
            _ => Err(Error::source_query_msg(
                "companies",
                "linked_server or database is NULL",
            )),
        }
    }

    async fn server_version(&mut self) -> Result<String> {
        let client = self.client()?;
        let row = client
            .simple_query("SELECT @@VERSION")
            .await
            .map_err(|e| Error::source_query("", "Version query failed", e))?
            .into_row()
            .await
            .map_err(|e| Error::source_query("", "Version query failed", e))?;

        let version = match row {
            Some(row) => row
                .try_get::<&str, _>(0)
                .map_err(|e| Error::source_query("", "Invalid version value", e))?
                .map(|v| v.lines().next().unwrap_or_default().to_string())
                .unwrap_or_default(),
            None => String::new(),
        };
        Ok(version)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client
                .close()
                .await
                .map_err(|e| Error::source_connection("Failed to close connection", e))?;
            info!("SQL Server connection closed");
        }
        Ok(())
    }
}

impl ToSql for QueryParam {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            QueryParam::Int(v) => ColumnData::I64(Some(*v)),
            QueryParam::Text(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
        }
    }
}

fn build_config(config: &SourceConfig) -> Config {
    let mut tds = Config::new();
    tds.host(&config.host);
    tds.port(config.port);
    tds.database(&config.database);
    tds.application_name("ledger-sync");
    tds.authentication(AuthMethod::sql_server(&config.username, &config.password));

    if config.encrypt {
        if config.trust_server_certificate {
            tds.trust_cert();
        }
        tds.encryption(EncryptionLevel::Required);
    } else {
        tds.encryption(EncryptionLevel::NotSupported);
    }

    tds
}

async fn open_client(config: &SourceConfig) -> Result<Client<Compat<TcpStream>>> {
    let tds = build_config(config);
    let timeout = Duration::from_secs(config.connect_timeout_secs);

    let tcp = tokio::time::timeout(timeout, TcpStream::connect(tds.get_addr()))
        .await
        .map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("Connecting to {}:{} timed out", config.host, config.port),
            ))
        })??;
    tcp.set_nodelay(true).ok();

    Client::connect(tds, tcp.compat_write())
        .await
        .map_err(|e| Error::source_connection("Failed to connect", e))
}

/// Convert one driver cell into a source value.
fn to_source_value(data: &ColumnData<'static>) -> tiberius::Result<SourceValue> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| SourceValue::Int(v.into())),
        ColumnData::I16(v) => v.map(|v| SourceValue::Int(v.into())),
        ColumnData::I32(v) => v.map(|v| SourceValue::Int(v.into())),
        ColumnData::I64(v) => v.map(SourceValue::Int),
        ColumnData::F32(v) => v.map(|v| SourceValue::Float(v.into())),
        ColumnData::F64(v) => v.map(SourceValue::Float),
        ColumnData::Bit(v) => v.map(SourceValue::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| SourceValue::Text(s.to_string())),
        ColumnData::Guid(v) => v.map(SourceValue::Guid),
        ColumnData::Binary(v) => v.as_ref().map(|b| SourceValue::Binary(b.to_vec())),
        ColumnData::Numeric(_) => Decimal::from_sql(data)?.map(SourceValue::Decimal),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)?.map(SourceValue::DateTime)
        }
        ColumnData::Date(_) => NaiveDate::from_sql(data)?.map(SourceValue::Date),
        ColumnData::Time(_) => NaiveTime::from_sql(data)?.map(|t| SourceValue::Text(t.to_string())),
        ColumnData::DateTimeOffset(_) => {
            DateTime::<Utc>::from_sql(data)?.map(SourceValue::DateTimeTz)
        }
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|x| SourceValue::Text(AsRef::<str>::as_ref(&**x).to_string())),
        #[allow(unreachable_patterns)]
        other => Some(SourceValue::Text(format!("{:?}", other))),
    };
    Ok(value.unwrap_or(SourceValue::Null))
}
