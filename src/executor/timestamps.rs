//! Min, max and watermark of a time dimension.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result, ResultExt};
use crate::executor::{Executor, Statement};
use crate::model::Value;
use crate::sql::{Dialect, SqlDialect};

/// Time bounds of the data behind a metrics view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampsResult {
    pub min: Option<DateTime<Utc>>,
    pub max: Option<DateTime<Utc>>,
    /// The view's watermark expression, or `max`.
    pub watermark: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl Executor {
    /// Timestamps for `time_dimension`, defaulting to the view's time
    /// dimension. Results with a known minimum are cached.
    pub async fn timestamps(&self, time_dimension: &str) -> Result<TimestampsResult> {
        let td = if time_dimension.is_empty() {
            self.metrics_view.time_dimension.as_str()
        } else {
            time_dimension
        };

        let mut cache = self.timestamps.lock().await;
        if let Some(res) = cache.get(td) {
            if res.min.is_some() {
                return Ok(res.clone());
            }
        }

        let time_expr = self
            .time_column_or_expr(td)
            .context("failed to resolve time column or expression")?;
        if time_expr.is_empty() {
            return Err(Error::validation(format!(
                "no time dimension found in metrics view {:?}",
                self.metrics_view.name
            )));
        }

        let (min, max, watermark) = match self.dialect() {
            Dialect::Druid => self.resolve_druid(&time_expr).await?,
            _ => self.resolve_single_query(&time_expr).await?,
        };
        let res = TimestampsResult {
            min,
            max,
            watermark,
            now: Utc::now(),
        };
        debug!(time_dimension = td, min = ?res.min, max = ?res.max, watermark = ?res.watermark, "resolved timestamps");

        cache.insert(td.to_string(), res.clone());
        Ok(res)
    }

    /// The dimension's expression if the view lists it, else the column.
    fn time_column_or_expr(&self, td: &str) -> Result<String> {
        if td.is_empty() {
            return Ok(String::new());
        }
        match self.metrics_view.dimension(td) {
            Some(dim) => self.dialect().metrics_view_dimension_expression(dim),
            None => Ok(self.dialect().escape_identifier(td)),
        }
    }

    fn watermark_expr(&self, time_expr: &str) -> String {
        if self.metrics_view.watermark_expression.is_empty() {
            format!("max({})", time_expr)
        } else {
            self.metrics_view.watermark_expression.clone()
        }
    }

    fn timestamps_from_where(&self) -> String {
        let d = self.dialect();
        let tbl = d.escape_table(
            &self.metrics_view.database,
            &self.metrics_view.database_schema,
            &self.metrics_view.table,
        );
        match self.security.row_filter() {
            Some(filter) if !filter.is_empty() => format!("{} WHERE {}", tbl, filter),
            _ => tbl,
        }
    }

    async fn resolve_single_query(&self, time_expr: &str) -> Result<Timestamps> {
        let sql = format!(
            "SELECT min({0}) AS \"min\", max({0}) AS \"max\", {1} AS \"watermark\" FROM {2}",
            time_expr,
            self.watermark_expr(time_expr),
            self.timestamps_from_where()
        );
        let res = self.execute(Statement::new(sql, Vec::new())).await?;
        let row = res.rows()?.first().cloned().unwrap_or_default();
        Ok((
            row.first().and_then(Value::as_timestamp),
            row.get(1).and_then(Value::as_timestamp),
            row.get(2).and_then(Value::as_timestamp),
        ))
    }

    /// Druid answers aggregate-only queries fastest one at a time, so the
    /// three scalar queries run concurrently.
    async fn resolve_druid(&self, time_expr: &str) -> Result<Timestamps> {
        let from = self.timestamps_from_where();
        let scalar = |expr: String| {
            let sql = format!("SELECT {} FROM {}", expr, from);
            async move {
                let res = self.execute(Statement::new(sql, Vec::new())).await?;
                Ok::<_, Error>(res.first_value().and_then(Value::as_timestamp))
            }
        };

        let (min, max, watermark) = futures::try_join!(
            scalar(format!("min({})", time_expr)),
            scalar(format!("max({})", time_expr)),
            scalar(self.watermark_expr(time_expr)),
        )?;
        Ok((min, max, watermark))
    }
}

type Timestamps = (
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);
