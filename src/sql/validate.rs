//! Syntax validation for emitted SQL.
//!
//! Uses sqlparser-rs to check that compiled SQL parses. Positional `?`
//! placeholders are accepted by every parser dialect used here.

use sqlparser::dialect::{ClickHouseDialect, DuckDbDialect, GenericDialect};
use sqlparser::parser::Parser;

use super::dialect::Dialect;

/// Validates that a SQL string is syntactically valid for the given dialect.
///
/// # Example
///
/// ```ignore
/// use metricsview::sql::{validate_sql, Dialect};
///
/// validate_sql("SELECT * FROM events", Dialect::DuckDb).unwrap();
/// ```
pub fn validate_sql(sql: &str, dialect: Dialect) -> Result<(), String> {
    let parser_dialect: Box<dyn sqlparser::dialect::Dialect> = match dialect {
        Dialect::DuckDb => Box::new(DuckDbDialect {}),
        Dialect::ClickHouse => Box::new(ClickHouseDialect {}),
        Dialect::Druid => Box::new(GenericDialect {}), // sqlparser has no Druid dialect
        Dialect::Pinot => Box::new(GenericDialect {}), // sqlparser has no Pinot dialect
    };

    Parser::parse_sql(&*parser_dialect, sql)
        .map(|_| ())
        .map_err(|e| format!("Invalid SQL for {:?}: {}\nSQL: {}", dialect, e, sql))
}
