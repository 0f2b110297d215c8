//! The OLAP store interface the executor runs statements against.
//!
//! Drivers implement [`OlapStore`]. The executor never talks to a database
//! any other way, so tests substitute an in-memory store.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::Value;
use crate::sql::Dialect;

/// A SQL statement with positional `?` args.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statement {
    pub query: String,
    pub args: Vec<Value>,
    /// Plan the statement without returning rows.
    pub dry_run: bool,
    /// Per-statement timeout. The executor fills in its configured default.
    pub timeout: Option<Duration>,
}

impl Statement {
    pub fn new(query: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            query: query.into(),
            args,
            ..Default::default()
        }
    }

    pub fn dry_run(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            dry_run: true,
            ..Default::default()
        }
    }
}

/// A result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Database type name, e.g. `VARCHAR` or `TIMESTAMP`.
    pub data_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }

    pub fn is_numeric(&self) -> bool {
        let t = self.data_type.to_ascii_uppercase();
        let t = t.trim_start_matches("NULLABLE(");
        if t.starts_with("INTERVAL") {
            return false;
        }
        [
            "TINYINT", "SMALLINT", "INT", "BIGINT", "HUGEINT", "UTINYINT", "USMALLINT", "UINT",
            "UBIGINT", "UHUGEINT", "DECIMAL", "NUMERIC", "FLOAT", "DOUBLE", "REAL", "LONG",
        ]
        .iter()
        .any(|p| t.starts_with(p))
    }

    pub fn is_time(&self) -> bool {
        let t = self.data_type.to_ascii_uppercase();
        let t = t.trim_start_matches("NULLABLE(");
        t.starts_with("TIMESTAMP") || t.starts_with("DATE")
    }
}

/// Rows returned by a statement.
///
/// A release hook set with [`QueryResult::set_cleanup`] runs exactly once,
/// when the result is dropped.
pub struct QueryResult {
    pub columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
    cap: Option<i64>,
    cleanup: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl QueryResult {
    pub fn new(columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows,
            cap: None,
            cleanup: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// Fail reads when the result holds more than `cap` rows.
    pub fn set_cap(&mut self, cap: i64) {
        self.cap = Some(cap);
    }

    pub fn set_cleanup(&mut self, f: impl FnOnce() + Send + Sync + 'static) {
        self.cleanup = Some(Box::new(f));
    }

    pub fn rows(&self) -> Result<&[Vec<Value>]> {
        self.check_cap()?;
        Ok(&self.rows)
    }

    pub fn into_rows(mut self) -> Result<Vec<Vec<Value>>> {
        self.check_cap()?;
        Ok(std::mem::take(&mut self.rows))
    }

    /// Number of rows, regardless of the cap.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The first value of the first row, if any.
    pub fn first_value(&self) -> Option<&Value> {
        self.rows.first().and_then(|r| r.first())
    }

    /// Values of the named column, in row order.
    pub fn column_values(&self, name: &str) -> Result<Vec<Value>> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::execution(format!("result has no column {:?}", name)))?;
        Ok(self
            .rows
            .iter()
            .map(|r| r.get(idx).cloned().unwrap_or_default())
            .collect())
    }

    fn check_cap(&self) -> Result<()> {
        match self.cap {
            Some(cap) if self.rows.len() as i64 > cap => Err(Error::execution(format!(
                "query result exceeds limit of {} rows",
                cap
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("columns", &self.columns)
            .field("rows", &self.rows.len())
            .field("cap", &self.cap)
            .finish()
    }
}

impl Drop for QueryResult {
    fn drop(&mut self) {
        if let Some(f) = self.cleanup.take() {
            f();
        }
    }
}

/// File format for exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Parquet,
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Parquet => "parquet",
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

/// A handle to an OLAP database.
#[async_trait]
pub trait OlapStore: Send + Sync + fmt::Debug {
    fn dialect(&self) -> Dialect;

    /// Run a statement and buffer its rows.
    async fn query(&self, stmt: Statement) -> Result<QueryResult>;

    /// Run a statement and write its rows to `path`.
    async fn export(&self, _stmt: Statement, _path: &Path, _format: ExportFormat) -> Result<()> {
        Err(Error::unsupported(format!(
            "export is not supported for {}",
            self.dialect()
        )))
    }

    /// Columns of a table, or `None` if it does not exist.
    async fn table_columns(
        &self,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<Option<Vec<Column>>>;

    /// Run a native (non-SQL) query document. Only Druid stores support this.
    async fn query_native(&self, _doc: serde_json::Value) -> Result<serde_json::Value> {
        Err(Error::NativeSearchUnavailable)
    }
}

/// Run `stmt` on `olap`, failing with [`Error::Timeout`] once `default_timeout`
/// (or the statement's own timeout) elapses. The in-flight query is dropped.
pub(crate) async fn query_with_timeout(
    olap: &dyn OlapStore,
    mut stmt: Statement,
    default_timeout: Duration,
) -> Result<QueryResult> {
    let timeout = *stmt.timeout.get_or_insert(default_timeout);
    match tokio::time::timeout(timeout, olap.query(stmt)).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

pub(crate) async fn export_with_timeout(
    olap: &dyn OlapStore,
    mut stmt: Statement,
    path: &Path,
    format: ExportFormat,
    default_timeout: Duration,
) -> Result<()> {
    let timeout = *stmt.timeout.get_or_insert(default_timeout);
    match tokio::time::timeout(timeout, olap.export(stmt, path, format)).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout(timeout)),
    }
}
