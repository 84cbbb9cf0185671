//! Source query templates: table qualification and lookback parameters.

use crate::error::{Error, ErrorContext, Result};
use regex::{Captures, Regex};
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Tables reached through the linked server unless configured otherwise.
pub const DEFAULT_QUALIFIED_TABLES: &[&str] = &[
    "FA", "FApol", "PH", "PHpol", "SKPP", "SKPPpol", "SKPV", "SKPVpol", "sStr", "sCin", "AD",
    "sZeme", "sSklad", "sFormUh", "Kasa",
];

const LOOKBACK_PLACEHOLDER: &str = "{lookback_days}";
const LINKED_SERVER_PLACEHOLDER: &str = "{linked_server}";
const DATABASE_PLACEHOLDER: &str = "{database}";

/// Linked server and business database the source tables live in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedServer {
    /// Linked server name
    pub server: String,
    /// Database on the linked server
    pub database: String,
}

impl LinkedServer {
    /// Create a linked server reference.
    pub fn new(server: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            database: database.into(),
        }
    }

    /// `[server].[database].dbo.` prefix for qualified table names.
    pub fn prefix(&self) -> String {
        format!(
            "{}.{}.dbo.",
            bracket_quote(&self.server),
            bracket_quote(&self.database)
        )
    }
}

impl fmt::Display for LinkedServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server, self.database)
    }
}

/// Quote a SQL Server identifier with brackets.
pub fn bracket_quote(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Prefix every `FROM <t>` / `JOIN <t>` for `t` in `tables`.
///
/// Matching is case-insensitive on whole words; the keyword is upper-cased
/// and the table keeps the spelling from `tables`.
pub fn qualify_tables(sql: &str, prefix: &str, tables: &[impl AsRef<str>]) -> Result<String> {
    let mut qualified = sql.to_string();
    for table in tables {
        let table = table.as_ref();
        let pattern = format!(r"(?i)\b(FROM|JOIN)\s+{}\b", regex::escape(table));
        let re = Regex::new(&pattern)
            .map_err(|e| Error::config_with_source(format!("Invalid table name {}", table), e))?;
        qualified = re
            .replace_all(&qualified, |caps: &Captures| {
                format!("{} {}{}", caps[1].to_uppercase(), prefix, table)
            })
            .into_owned();
    }
    Ok(qualified)
}

/// A bound query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    /// Integer
    Int(i64),
    /// Text
    Text(String),
}

/// A query ready to be executed against the source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceQuery {
    /// Target table the query feeds
    pub table: String,
    /// Query text with `@P<n>` parameter markers
    pub sql: String,
    /// Parameters in marker order
    pub params: Vec<QueryParam>,
}

impl SourceQuery {
    /// Query without parameters.
    pub fn raw(table: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            sql: sql.into(),
            params: Vec::new(),
        }
    }
}

/// A per-table query file.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTemplate {
    /// Target table name
    pub table: String,
    /// Template text
    pub text: String,
}

impl QueryTemplate {
    /// Create a template from text.
    pub fn new(table: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            text: text.into(),
        }
    }

    /// Read a template file; the table name is the file stem unless given.
    pub fn load(path: &Path, table: Option<&str>) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Query file {} not readable", path.display()))?;
        let table = match table {
            Some(t) => t.to_string(),
            None => path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::config(format!("Cannot derive table name from {}", path.display()))
                })?,
        };
        debug!("Loaded query for {} from {}", table, path.display());
        Ok(Self { table, text })
    }

    /// Resolve the template into an executable query.
    ///
    /// `{linked_server}` and `{database}` become bracket-quoted identifiers,
    /// `{lookback_days}` becomes the bound parameter `@P1`, and allow-listed
    /// tables are qualified with the linked-server prefix.
    pub fn render(
        &self,
        linked: &LinkedServer,
        lookback_days: u32,
        tables: &[impl AsRef<str>],
    ) -> Result<SourceQuery> {
        let mut sql = self
            .text
            .replace(LINKED_SERVER_PLACEHOLDER, &bracket_quote(&linked.server))
            .replace(DATABASE_PLACEHOLDER, &bracket_quote(&linked.database));

        let mut params = Vec::new();
        if sql.contains(LOOKBACK_PLACEHOLDER) {
            sql = sql.replace(LOOKBACK_PLACEHOLDER, "@P1");
            params.push(QueryParam::Int(i64::from(lookback_days)));
        }

        let sql = qualify_tables(&sql, &linked.prefix(), tables)?;
        Ok(SourceQuery {
            table: self.table.clone(),
            sql,
            params,
        })
    }
}
