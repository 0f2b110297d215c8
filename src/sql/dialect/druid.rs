//! Apache Druid SQL dialect.
//!
//! - No ILIKE; case-insensitive matching goes through `REGEXP_LIKE`
//! - Arrays unnest automatically in filters and GROUP BY
//! - `time_floor` with ISO periods for time zone aware truncation
//! - NULL literals need an explicit type

use chrono::{DateTime, Utc};

use super::duckdb::{escaped_list, truncation_input};
use super::{check_inline_rows, helpers, SqlDialect};
use crate::error::{Error, Result};
use crate::model::{DimensionSpec, TimeGrain, Value};

/// Apache Druid SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct Druid;

impl SqlDialect for Druid {
    fn name(&self) -> &'static str {
        "druid"
    }

    fn null_literal(&self, like: Option<&Value>) -> String {
        let ty = match like {
            Some(Value::Int(_)) => "INTEGER",
            Some(Value::Float(_)) => "DOUBLE",
            Some(Value::Bool(_)) => "BOOLEAN",
            Some(Value::Timestamp(_)) => "TIMESTAMP",
            _ => "VARCHAR",
        };
        format!("CAST(NULL AS {})", ty)
    }

    fn safe_divide_expression(&self, num: &str, den: &str) -> String {
        format!("SAFE_DIVIDE({}, CAST({} AS DOUBLE))", num, den)
    }

    fn supports_ilike(&self) -> bool {
        false
    }

    fn supports_regex_match(&self) -> bool {
        true
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
        let expr = truncation_input(self, dim);
        let shift = helpers::calendar_shift(grain, first_day_of_week, first_month_of_year)
            .map(|(n, unit)| (n, if unit == "DAY" { "P1D" } else { "P1M" }));

        if tz.is_empty() {
            let spec = self.date_trunc_specifier(grain);
            return Ok(match shift {
                None => format!("date_trunc('{}', {})", spec, expr),
                Some((n, period)) => format!(
                    "time_shift(date_trunc('{}', time_shift({}, '{}', {})), '{}', -{})",
                    spec, expr, period, n, period, n
                ),
            });
        }

        let spec = time_floor_period(grain)?;
        Ok(match shift {
            None => format!("time_floor({}, '{}', null, '{}')", expr, spec, tz),
            Some((n, period)) => format!(
                "time_shift(time_floor(time_shift({}, '{}', {}), '{}', null, '{}'), '{}', -{})",
                expr, period, n, spec, tz, period, n
            ),
        })
    }

    fn date_diff(&self, grain: TimeGrain, t1: &DateTime<Utc>, t2: &DateTime<Utc>) -> Result<String> {
        Ok(format!(
            "TIMESTAMPDIFF(\"{}\", TIME_PARSE('{}'), TIME_PARSE('{}'))",
            self.date_trunc_specifier(grain),
            helpers::rfc3339(t1),
            helpers::rfc3339(t2)
        ))
    }

    fn interval_subtract(&self, expr: &str, interval: &str, grain: TimeGrain) -> String {
        format!(
            "TIMESTAMPADD({}, -({}), {})",
            self.date_trunc_specifier(grain),
            interval,
            expr
        )
    }

    // Druid VALUES does not take parameters, so values are inlined.
    fn select_inline_results(
        &self,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<(String, Vec<Value>)> {
        check_inline_rows(self.name(), columns, rows)?;
        let mut tuples = Vec::with_capacity(rows.len());
        for row in rows {
            let mut fields = Vec::with_capacity(row.len());
            for (i, v) in row.iter().enumerate() {
                let like = rows.iter().map(|r| &r[i]).find(|v| !v.is_null());
                fields.push(self.value_literal(v, like)?);
            }
            tuples.push(format!("({})", fields.join(", ")));
        }
        Ok((
            format!(
                "SELECT * FROM (VALUES {}) t({})",
                tuples.join(", "),
                escaped_list(self, columns)
            ),
            Vec::new(),
        ))
    }
}

/// ISO 8601 period for `time_floor`.
fn time_floor_period(grain: TimeGrain) -> Result<&'static str> {
    Ok(match grain {
        TimeGrain::Millisecond => "PT0.001S",
        TimeGrain::Second => "PT1S",
        TimeGrain::Minute => "PT1M",
        TimeGrain::Hour => "PT1H",
        TimeGrain::Day => "P1D",
        TimeGrain::Week => "P1W",
        TimeGrain::Month => "P1M",
        TimeGrain::Quarter => "P3M",
        TimeGrain::Year => "P1Y",
        TimeGrain::Unspecified => {
            return Err(Error::dialect("druid", "time grain must be specified"))
        }
    })
}
