//! DuckDB SQL dialect.
//!
//! DuckDB is PostgreSQL-compatible with extensions:
//! - Native ILIKE and PIVOT
//! - `LATERAL UNNEST` for array dimensions
//! - `time_bucket` for sub-day truncation in a time zone
//! - `NULLS LAST` ordering

use chrono::{DateTime, Utc};

use super::{check_inline_rows, helpers, SqlDialect, Unnest};
use crate::error::Result;
use crate::model::{DimensionSpec, TimeGrain, Value};

/// DuckDB SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct DuckDb;

impl SqlDialect for DuckDb {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    // Tables live in the attached database; qualification is not needed.
    fn escape_table(&self, _db: &str, _schema: &str, table: &str) -> String {
        self.escape_identifier(table)
    }

    fn order_by_expression(&self, name: &str, desc: bool) -> String {
        let mut res = self.escape_identifier(name);
        if desc {
            res.push_str(" DESC");
        }
        res.push_str(" NULLS LAST");
        res
    }

    fn lateral_unnest(&self, expr: &str, table_alias: &str, col_name: &str) -> Result<Unnest> {
        Ok(Unnest::Lateral {
            from: format!(
                "LATERAL UNNEST({}) {}({})",
                expr,
                table_alias,
                self.escape_identifier(col_name)
            ),
            column: self.escape_member(table_alias, col_name),
        })
    }

    fn date_trunc_expr(
        &self,
        dim: &DimensionSpec,
        grain: TimeGrain,
        tz: &str,
        first_day_of_week: u32,
        first_month_of_year: u32,
    ) -> Result<String> {
        let tz = crate::model::time::normalize_time_zone(tz)?;
        let spec = self.date_trunc_specifier(grain);
        let expr = truncation_input(self, dim);
        let shift = helpers::calendar_shift(grain, first_day_of_week, first_month_of_year)
            .map(|(n, unit)| format!("{} {}", n, unit));

        if tz.is_empty() {
            return Ok(match shift {
                None => format!("date_trunc('{}', {}::TIMESTAMP)::TIMESTAMP", spec, expr),
                Some(sh) => format!(
                    "date_trunc('{}', {}::TIMESTAMP + INTERVAL {})::TIMESTAMP - INTERVAL {}",
                    spec, expr, sh, sh
                ),
            });
        }

        // date_trunc is faster than time_bucket for day+ grains
        if grain >= TimeGrain::Day {
            return Ok(match shift {
                None => format!(
                    "timezone('{}', date_trunc('{}', timezone('{}', {}::TIMESTAMPTZ)))::TIMESTAMP",
                    tz, spec, tz, expr
                ),
                Some(sh) => format!(
                    "timezone('{}', date_trunc('{}', timezone('{}', {}::TIMESTAMPTZ) + INTERVAL {}) - INTERVAL {})::TIMESTAMP",
                    tz, spec, tz, expr, sh, sh
                ),
            });
        }

        Ok(match shift {
            None => format!(
                "time_bucket(INTERVAL '1 {}', {}::TIMESTAMPTZ, '{}')",
                spec, expr, tz
            ),
            Some(sh) => format!(
                "time_bucket(INTERVAL '1 {}', {}::TIMESTAMPTZ + INTERVAL {}, '{}') - INTERVAL {}",
                spec, expr, sh, tz, sh
            ),
        })
    }

    fn date_diff(&self, grain: TimeGrain, t1: &DateTime<Utc>, t2: &DateTime<Utc>) -> Result<String> {
        Ok(format!(
            "DATEDIFF('{}', TIMESTAMP '{}', TIMESTAMP '{}')",
            self.date_trunc_specifier(grain),
            helpers::rfc3339(t1),
            helpers::rfc3339(t2)
        ))
    }

    fn can_pivot(&self) -> bool {
        true
    }

    fn select_inline_results(
        &self,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<(String, Vec<Value>)> {
        check_inline_rows(self.name(), columns, rows)?;
        let mut args = Vec::new();
        let tuples: Vec<String> = rows
            .iter()
            .map(|row| {
                args.extend(row.iter().cloned());
                format!("({})", vec!["?"; row.len()].join(", "))
            })
            .collect();
        Ok((
            format!(
                "SELECT * FROM (VALUES {}) t({})",
                tuples.join(", "),
                escaped_list(self, columns)
            ),
            args,
        ))
    }
}

/// `(expression)` or the escaped column of a dimension about to be truncated.
pub(super) fn truncation_input(d: &dyn SqlDialect, dim: &DimensionSpec) -> String {
    if !dim.expression.is_empty() {
        format!("({})", dim.expression)
    } else if !dim.column.is_empty() {
        d.escape_identifier(&dim.column)
    } else {
        d.escape_identifier(&dim.name)
    }
}

pub(super) fn escaped_list(d: &dyn SqlDialect, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| d.escape_identifier(c))
        .collect::<Vec<_>>()
        .join(", ")
}
