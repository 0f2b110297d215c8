//! SQL dialect definitions and formatting rules.
//!
//! This module provides a trait-based abstraction for OLAP dialect differences.
//! Each dialect implements `SqlDialect` to handle its specific syntax:
//!
//! - Identifier and table escaping
//! - Time truncation, date diffs and interval arithmetic
//! - Array unnesting (lateral join vs automatic)
//! - Case-insensitive matching (ILIKE, regex, LOWER)
//! - Dictionary lookups
//! - Inlining a result set as a literal select
//!
//! # Usage
//!
//! ```ignore
//! use metricsview::sql::{Dialect, SqlDialect};
//!
//! let dialect = Dialect::DuckDb;
//! let quoted = dialect.escape_identifier("country");  // "country"
//! ```
//!
//! # Feature Matrix
//!
//! | Feature | DuckDB | Druid | ClickHouse | Pinot |
//! |---------|--------|-------|------------|-------|
//! | ILIKE | ✓ | ❌ (regex) | ✓ (cast) | ❌ (LOWER) |
//! | Lateral unnest | ✓ | auto | auto (arrayJoin) | auto |
//! | Native PIVOT | ✓ | ❌ | ❌ | ❌ |
//! | Dictionary lookups | ❌ | ❌ | ✓ | ❌ |

mod clickhouse;
mod druid;
mod duckdb;
pub mod helpers;
mod pinot;

pub use clickhouse::ClickHouse;
pub use druid::Druid;
pub use duckdb::DuckDb;
pub use pinot::Pinot;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{DimensionSpec, LookupMeta, TimeGrain, Value};

/// How a dialect expands an array dimension into rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unnest {
    /// The dialect unnests inline; compare against the array expression directly.
    Auto,
    /// A lateral join clause plus the SQL referencing each element.
    Lateral { from: String, column: String },
}

/// SQL dialect trait - defines how SQL constructs are rendered.
///
/// Implementations handle dialect-specific syntax differences.
/// The default implementations follow DuckDB-like ANSI SQL where possible.
pub trait SqlDialect: std::fmt::Debug + Send + Sync {
    /// Dialect name for display/logging.
    fn name(&self) -> &'static str;

    // =========================================================================
    // Identifier and Literal Quoting
    // =========================================================================

    /// Quote an identifier. Empty identifiers stay empty.
    fn escape_identifier(&self, ident: &str) -> String {
        helpers::quote_double(ident)
    }

    /// `tbl."name"`, or just `"name"` when `tbl` is empty.
    ///
    /// Table aliases are generated by the compiler and used as is.
    fn escape_member(&self, tbl: &str, name: &str) -> String {
        if tbl.is_empty() {
            return self.escape_identifier(name);
        }
        format!("{}.{}", tbl, self.escape_identifier(name))
    }

    /// Fully qualified table name; empty parts are skipped.
    fn escape_table(&self, db: &str, schema: &str, table: &str) -> String {
        let mut out = String::new();
        for part in [db, schema] {
            if !part.is_empty() {
                out.push_str(&self.escape_identifier(part));
                out.push('.');
            }
        }
        out.push_str(&self.escape_identifier(table));
        out
    }

    fn escape_string_value(&self, s: &str) -> String {
        helpers::quote_string_single(s)
    }

    /// NULL literal. `like` is a sibling value hinting at the column type.
    fn null_literal(&self, _like: Option<&Value>) -> String {
        "NULL".to_string()
    }

    /// Timestamp literal.
    fn time_literal(&self, t: &DateTime<Utc>) -> String {
        format!("CAST('{}' AS TIMESTAMP)", helpers::rfc3339_nano(t))
    }

    /// Render a value as an inline SQL literal.
    fn value_literal(&self, v: &Value, like: Option<&Value>) -> Result<String> {
        match v {
            Value::Null => Ok(self.null_literal(like)),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Int(i) => Ok(i.to_string()),
            Value::Float(f) if f.is_nan() || f.is_infinite() => Ok(self.null_literal(like)),
            Value::Float(f) => Ok(helpers::format_float(*f)),
            Value::String(s) => Ok(self.escape_string_value(s)),
            Value::Timestamp(t) => Ok(self.time_literal(t)),
            Value::List(_) => Err(Error::dialect(
                self.name(),
                "cannot render a list as a literal",
            )),
        }
    }

    // =========================================================================
    // Ordering, Joins and Aggregation
    // =========================================================================

    fn order_by_expression(&self, name: &str, desc: bool) -> String {
        let mut res = self.escape_identifier(name);
        if desc {
            res.push_str(" DESC");
        }
        res
    }

    /// Null-safe equality used for join conditions.
    fn join_on_expression(&self, lhs: &str, rhs: &str) -> String {
        format!("{} IS NOT DISTINCT FROM {}", lhs, rhs)
    }

    fn any_value_expression(&self, expr: &str) -> String {
        format!("ANY_VALUE({})", expr)
    }

    fn safe_divide_expression(&self, num: &str, den: &str) -> String {
        format!("({})/CAST({} AS DOUBLE)", num, den)
    }

    // =========================================================================
    // Unnest
    // =========================================================================

    /// Lateral join that expands `expr` into rows of `table_alias.col_name`.
    fn lateral_unnest(&self, _expr: &str, _table_alias: &str, _col_name: &str) -> Result<Unnest> {
        Ok(Unnest::Auto)
    }

    /// Wrap an array expression for dialects that unnest inline.
    fn auto_unnest(&self, expr: &str) -> String {
        expr.to_string()
    }

    // =========================================================================
    // Pattern Matching
    // =========================================================================

    fn supports_ilike(&self) -> bool {
        true
    }

    /// Whether LIKE operands must be cast to TEXT.
    fn requires_cast_for_like(&self) -> bool {
        false
    }

    /// Whether case-insensitive matching falls back to a regex function.
    fn supports_regex_match(&self) -> bool {
        false
    }

    fn regex_match_function(&self) -> &'static str {
        "REGEXP_LIKE"
    }

    // =========================================================================
    // Date/Time
    // =========================================================================

    /// Unit name used by date_trunc and date diffs.
    fn date_trunc_specifier(&self, grain: TimeGrain) -> String {
        helpers::date_trunc_unit(grain).to_string()
    }

    /// Truncate a dimension to `grain` in time zone `tz` (empty = UTC).
    fn date_trunc_expr(
        &self,
        dim: &DimensionSpec,
        grain: TimeGrain,
        tz: &str,
        first_day_of_week: u32,
        first_month_of_year: u32,
    ) -> Result<String>;

    /// Number of whole `grain` units between two timestamps.
    fn date_diff(&self, grain: TimeGrain, t1: &DateTime<Utc>, t2: &DateTime<Utc>) -> Result<String>;

    /// Subtract `interval` units of `grain` from a timestamp expression.
    fn interval_subtract(&self, expr: &str, interval: &str, grain: TimeGrain) -> String {
        format!(
            "({} - INTERVAL ({}) {})",
            expr,
            interval,
            self.date_trunc_specifier(grain)
        )
    }

    /// Placeholder for a time range bound.
    fn time_dimension_parameter(&self) -> &'static str {
        "?"
    }

    /// A select producing one row per bin in column `alias`.
    fn select_time_range_bins(&self, bins: &[DateTime<Utc>], alias: &str) -> Result<String> {
        if bins.is_empty() {
            return Err(Error::validation("time spine produced no bins"));
        }
        let rows: Vec<String> = bins
            .iter()
            .map(|t| format!("({})", self.time_literal(t)))
            .collect();
        Ok(format!(
            "SELECT * FROM (VALUES {}) t({})",
            rows.join(", "),
            self.escape_identifier(alias)
        ))
    }

    // =========================================================================
    // Dimensions and Lookups
    // =========================================================================

    /// The SQL expression of a dimension over the underlying table.
    fn metrics_view_dimension_expression(&self, dim: &DimensionSpec) -> Result<String> {
        if let Some(lookup) = dim.lookup() {
            let key = if !dim.expression.is_empty() {
                dim.expression.clone()
            } else {
                self.escape_identifier(&dim.column)
            };
            return self.lookup_expr(&lookup, &key);
        }
        if !dim.expression.is_empty() {
            return Ok(dim.expression.clone());
        }
        if !dim.column.is_empty() {
            return Ok(self.escape_identifier(&dim.column));
        }
        Ok(self.escape_identifier(&dim.name))
    }

    /// Resolve `key_expr` through a dictionary.
    fn lookup_expr(&self, _lookup: &LookupMeta, _key_expr: &str) -> Result<String> {
        Err(Error::dialect(self.name(), "lookup dimensions are not supported"))
    }

    /// A select of the key column of a dictionary, to be completed with a WHERE.
    fn lookup_select_expr(&self, _lookup: &LookupMeta) -> Result<String> {
        Err(Error::dialect(self.name(), "lookup dimensions are not supported"))
    }

    // =========================================================================
    // Pivot and Inline Results
    // =========================================================================

    fn can_pivot(&self) -> bool {
        false
    }

    /// A select returning `rows` literally, plus its positional args.
    fn select_inline_results(
        &self,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<(String, Vec<Value>)> {
        check_inline_rows(self.name(), columns, rows)?;
        let mut args = Vec::new();
        let selects: Vec<String> = rows
            .iter()
            .map(|row| {
                let fields: Vec<String> = row
                    .iter()
                    .zip(columns)
                    .map(|(v, c)| {
                        args.push(v.clone());
                        format!("? AS {}", self.escape_identifier(c))
                    })
                    .collect();
                format!("SELECT {}", fields.join(", "))
            })
            .collect();
        Ok((selects.join(" UNION ALL "), args))
    }
}

/// Inline results need at least one row and rectangular, scalar data.
pub(crate) fn check_inline_rows(
    dialect: &'static str,
    columns: &[String],
    rows: &[Vec<Value>],
) -> Result<()> {
    if columns.is_empty() || rows.is_empty() {
        return Err(Error::dialect(dialect, "cannot inline an empty result"));
    }
    for row in rows {
        if row.len() != columns.len() {
            return Err(Error::dialect(dialect, "inline row width does not match columns"));
        }
        if row.iter().any(|v| matches!(v, Value::List(_))) {
            return Err(Error::dialect(dialect, "cannot inline list values"));
        }
    }
    Ok(())
}

/// Supported OLAP dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dialect {
    #[default]
    DuckDb,
    Druid,
    ClickHouse,
    Pinot,
}

impl Dialect {
    /// Get the dialect implementation.
    pub fn dialect(&self) -> &'static dyn SqlDialect {
        match self {
            Dialect::DuckDb => &DuckDb,
            Dialect::Druid => &Druid,
            Dialect::ClickHouse => &ClickHouse,
            Dialect::Pinot => &Pinot,
        }
    }
}

// Implement SqlDialect for Dialect enum by delegating to concrete types
impl SqlDialect for Dialect {
    fn name(&self) -> &'static str {
        self.dialect().name()
    }

    fn escape_identifier(&self, ident: &str) -> String {
        self.dialect().escape_identifier(ident)
    }

    fn escape_member(&self, tbl: &str, name: &str) -> String {
        self.dialect().escape_member(tbl, name)
    }

    fn escape_table(&self, db: &str, schema: &str, table: &str) -> String {
        self.dialect().escape_table(db, schema, table)
    }

    fn escape_string_value(&self, s: &str) -> String {
        self.dialect().escape_string_value(s)
    }

    fn null_literal(&self, like: Option<&Value>) -> String {
        self.dialect().null_literal(like)
    }

    fn time_literal(&self, t: &DateTime<Utc>) -> String {
        self.dialect().time_literal(t)
    }

    fn value_literal(&self, v: &Value, like: Option<&Value>) -> Result<String> {
        self.dialect().value_literal(v, like)
    }

    fn order_by_expression(&self, name: &str, desc: bool) -> String {
        self.dialect().order_by_expression(name, desc)
    }

    fn join_on_expression(&self, lhs: &str, rhs: &str) -> String {
        self.dialect().join_on_expression(lhs, rhs)
    }

    fn any_value_expression(&self, expr: &str) -> String {
        self.dialect().any_value_expression(expr)
    }

    fn safe_divide_expression(&self, num: &str, den: &str) -> String {
        self.dialect().safe_divide_expression(num, den)
    }

    fn lateral_unnest(&self, expr: &str, table_alias: &str, col_name: &str) -> Result<Unnest> {
        self.dialect().lateral_unnest(expr, table_alias, col_name)
    }

    fn auto_unnest(&self, expr: &str) -> String {
        self.dialect().auto_unnest(expr)
    }

    fn supports_ilike(&self) -> bool {
        self.dialect().supports_ilike()
    }

    fn requires_cast_for_like(&self) -> bool {
        self.dialect().requires_cast_for_like()
    }

    fn supports_regex_match(&self) -> bool {
        self.dialect().supports_regex_match()
    }

    fn regex_match_function(&self) -> &'static str {
        self.dialect().regex_match_function()
    }

    fn date_trunc_specifier(&self, grain: TimeGrain) -> String {
        self.dialect().date_trunc_specifier(grain)
    }

    fn date_trunc_expr(
        &self,
        dim: &DimensionSpec,
        grain: TimeGrain,
        tz: &str,
        first_day_of_week: u32,
        first_month_of_year: u32,
    ) -> Result<String> {
        self.dialect()
            .date_trunc_expr(dim, grain, tz, first_day_of_week, first_month_of_year)
    }

    fn date_diff(&self, grain: TimeGrain, t1: &DateTime<Utc>, t2: &DateTime<Utc>) -> Result<String> {
        self.dialect().date_diff(grain, t1, t2)
    }

    fn interval_subtract(&self, expr: &str, interval: &str, grain: TimeGrain) -> String {
        self.dialect().interval_subtract(expr, interval, grain)
    }

    fn time_dimension_parameter(&self) -> &'static str {
        self.dialect().time_dimension_parameter()
    }

    fn select_time_range_bins(&self, bins: &[DateTime<Utc>], alias: &str) -> Result<String> {
        self.dialect().select_time_range_bins(bins, alias)
    }

    fn metrics_view_dimension_expression(&self, dim: &DimensionSpec) -> Result<String> {
        self.dialect().metrics_view_dimension_expression(dim)
    }

    fn lookup_expr(&self, lookup: &LookupMeta, key_expr: &str) -> Result<String> {
        self.dialect().lookup_expr(lookup, key_expr)
    }

    fn lookup_select_expr(&self, lookup: &LookupMeta) -> Result<String> {
        self.dialect().lookup_select_expr(lookup)
    }

    fn can_pivot(&self) -> bool {
        self.dialect().can_pivot()
    }

    fn select_inline_results(
        &self,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<(String, Vec<Value>)> {
        self.dialect().select_inline_results(columns, rows)
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dialect().name())
    }
}
