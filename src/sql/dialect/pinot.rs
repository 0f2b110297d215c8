//! Apache Pinot SQL dialect.
//!
//! - No ILIKE or regex fallback; case-insensitive matching uses `LOWER(..) LIKE LOWER(..)`
//! - Arrays unnest automatically
//! - `date_trunc` takes an explicit input unit

use chrono::{DateTime, Utc};

use super::duckdb::truncation_input;
use super::{helpers, SqlDialect};
use crate::error::{Error, Result};
use crate::model::{DimensionSpec, TimeGrain};

/// Apache Pinot SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct Pinot;

impl SqlDialect for Pinot {
    fn name(&self) -> &'static str {
        "pinot"
    }

    fn supports_ilike(&self) -> bool {
        false
    }

    fn time_dimension_parameter(&self) -> &'static str {
        "CAST(? AS TIMESTAMP)"
    }

    fn date_trunc_expr(
        &self,
        dim: &DimensionSpec,
        grain: TimeGrain,
        tz: &str,
        first_day_of_week: u32,
        first_month_of_year: u32,
    ) -> Result<String> {
        if helpers::calendar_shift(grain, first_day_of_week, first_month_of_year).is_some() {
            return Err(Error::dialect(
                self.name(),
                "custom first day of week or month of year is not supported",
            ));
        }
        let tz = crate::model::time::normalize_time_zone(tz)?;
        let spec = self.date_trunc_specifier(grain);
        let expr = truncation_input(self, dim);
        if tz.is_empty() {
            return Ok(format!("date_trunc('{}', {}, 'MILLISECONDS')", spec, expr));
        }
        Ok(format!(
            "date_trunc('{}', {}, 'MILLISECONDS', '{}')",
            spec, expr, tz
        ))
    }

    fn date_diff(&self, grain: TimeGrain, t1: &DateTime<Utc>, t2: &DateTime<Utc>) -> Result<String> {
        Ok(format!(
            "DATETIMECONVERT(DATETRUNC('MILLISECONDS', {}) - DATETRUNC('MILLISECONDS', {}), '1:MILLISECONDS:EPOCH', '1:{}:EPOCH')",
            helpers::rfc3339(t1),
            helpers::rfc3339(t2),
            self.date_trunc_specifier(grain)
        ))
    }
}
