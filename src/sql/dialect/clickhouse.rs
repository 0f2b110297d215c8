//! ClickHouse SQL dialect.
//!
//! - Lower case time units and `DateTime64` casts
//! - `arrayJoin` unnests arrays inline
//! - LIKE operands must be cast to TEXT
//! - Dictionaries back lookup dimensions (`dictGet`)

use chrono::{DateTime, Utc};

use super::duckdb::truncation_input;
use super::{check_inline_rows, helpers, SqlDialect};
use crate::error::Result;
use crate::model::{DimensionSpec, LookupMeta, TimeGrain, Value};

/// ClickHouse SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct ClickHouse;

impl SqlDialect for ClickHouse {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    fn time_literal(&self, t: &DateTime<Utc>) -> String {
        format!("parseDateTimeBestEffort('{}')", helpers::rfc3339_nano(t))
    }

    fn join_on_expression(&self, lhs: &str, rhs: &str) -> String {
        format!("isNotDistinctFrom({}, {})", lhs, rhs)
    }

    fn any_value_expression(&self, expr: &str) -> String {
        format!("any({})", expr)
    }

    fn auto_unnest(&self, expr: &str) -> String {
        format!("arrayJoin({})", expr)
    }

    fn requires_cast_for_like(&self) -> bool {
        true
    }

    fn date_trunc_specifier(&self, grain: TimeGrain) -> String {
        helpers::date_trunc_unit(grain).to_lowercase()
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
                None => format!("date_trunc('{}', {})::DateTime64", spec, expr),
                Some(sh) => format!(
                    "date_trunc('{}', {} + INTERVAL {})::DateTime64 - INTERVAL {}",
                    spec, expr, sh, sh
                ),
            });
        }

        Ok(match shift {
            None => format!(
                "date_trunc('{}', {}::DateTime64(6, '{}'))::DateTime64(6, '{}')",
                spec, expr, tz, tz
            ),
            Some(sh) => format!(
                "date_trunc('{}', {}::DateTime64(6, '{}') + INTERVAL {})::DateTime64(6, '{}') - INTERVAL {}",
                spec, expr, tz, sh, tz, sh
            ),
        })
    }

    fn date_diff(&self, grain: TimeGrain, t1: &DateTime<Utc>, t2: &DateTime<Utc>) -> Result<String> {
        Ok(format!(
            "DATEDIFF('{}', parseDateTimeBestEffort('{}'), parseDateTimeBestEffort('{}'))",
            self.date_trunc_specifier(grain),
            helpers::rfc3339(t1),
            helpers::rfc3339(t2)
        ))
    }

    fn select_time_range_bins(&self, bins: &[DateTime<Utc>], alias: &str) -> Result<String> {
        if bins.is_empty() {
            return Err(crate::error::Error::validation("time spine produced no bins"));
        }
        let items: Vec<String> = bins.iter().map(|t| self.time_literal(t)).collect();
        Ok(format!(
            "SELECT arrayJoin([{}]) AS {}",
            items.join(", "),
            self.escape_identifier(alias)
        ))
    }

    fn lookup_expr(&self, lookup: &LookupMeta, key_expr: &str) -> Result<String> {
        let get = format!(
            "dictGet({}, {}, {})",
            self.escape_string_value(&lookup.table),
            self.escape_string_value(&lookup.value_column),
            key_expr
        );
        if lookup.default_expression.is_empty() {
            return Ok(get);
        }
        Ok(format!(
            "dictGetOrDefault({}, {}, {}, {})",
            self.escape_string_value(&lookup.table),
            self.escape_string_value(&lookup.value_column),
            key_expr,
            lookup.default_expression
        ))
    }

    fn lookup_select_expr(&self, lookup: &LookupMeta) -> Result<String> {
        Ok(format!(
            "SELECT {} FROM dictionary({})",
            self.escape_identifier(&lookup.key_column),
            self.escape_string_value(&lookup.table)
        ))
    }

    fn select_inline_results(
        &self,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<(String, Vec<Value>)> {
        check_inline_rows(self.name(), columns, rows)?;
        let fields: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("c{} AS {}", i + 1, self.escape_identifier(c)))
            .collect();
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
                "SELECT {} FROM VALUES ({})",
                fields.join(", "),
                tuples.join(", ")
            ),
            args,
        ))
    }
}
