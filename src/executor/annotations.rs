//! Annotations: time-stamped notes attached to measures.
//!
//! Each annotation of the view is its own table. Rows overlapping the
//! requested time range are returned with the requested measures they apply
//! to. Tables with a `duration` column only return notes at least as coarse
//! as the requested grain.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result, ResultExt};
use crate::executor::{Executor, Statement, TimestampsResult};
use crate::model::{AnnotationSpec, TimeGrain, TimeRange, Value};
use crate::sql::{Dialect, SqlDialect};

const GRAINS: [TimeGrain; 9] = [
    TimeGrain::Millisecond,
    TimeGrain::Second,
    TimeGrain::Minute,
    TimeGrain::Hour,
    TimeGrain::Day,
    TimeGrain::Week,
    TimeGrain::Month,
    TimeGrain::Quarter,
    TimeGrain::Year,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AnnotationsQuery {
    pub metrics_view: String,
    /// Empty requests every measure of the view.
    pub measures: Vec<String>,
    pub time_range: Option<TimeRange>,
    pub time_grain: TimeGrain,
    pub time_zone: String,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// One annotation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
    /// Requested measures the row applies to.
    pub for_measures: Vec<String>,
}

impl Executor {
    /// Resolve the relative time range of `qry` against known timestamps.
    pub fn bind_annotations_query(
        &self,
        qry: &mut AnnotationsQuery,
        timestamps: &TimestampsResult,
    ) -> Result<()> {
        let Some(tr) = qry.time_range.as_mut() else {
            return Ok(());
        };
        let anchor = timestamps.watermark.or(timestamps.max).unwrap_or(timestamps.now);
        super::rewrites::time_ranges::resolve_time_range(
            tr,
            Some(anchor),
            self.metrics_view.first_day_of_week(),
            self.metrics_view.first_month_of_year(),
        )
    }

    /// Annotations of the requested measures within the query's time range.
    pub async fn annotations(
        &self,
        qry: &AnnotationsQuery,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<Annotation>> {
        if !self.security.can_access() {
            return Err(Error::Forbidden);
        }

        let mut tr = qry
            .time_range
            .clone()
            .ok_or_else(|| Error::validation("annotations query requires a time range"))?;
        self.resolve_relative_time_range(&mut tr, execution_time)
            .await?;
        let (Some(start), Some(end)) = (tr.start, tr.end) else {
            return Err(Error::validation(
                "annotations query requires a time range with a start and end",
            ));
        };

        let requested: Vec<&str> = if qry.measures.is_empty() {
            self.metrics_view
                .measures
                .iter()
                .map(|m| m.name.as_str())
                .collect()
        } else {
            qry.measures.iter().map(String::as_str).collect()
        };

        let mut rows = Vec::new();
        for ann in &self.metrics_view.annotations {
            let for_measures: Vec<String> = ann
                .measures
                .iter()
                .filter(|m| requested.contains(&m.as_str()))
                .filter(|m| self.security.can_access_field(m))
                .cloned()
                .collect();
            if for_measures.is_empty() {
                continue;
            }

            let stmt = annotation_statement(self.dialect(), ann, start, end, qry);
            debug!(metrics_view = %self.metrics_view.name, annotation = %ann.name, sql = %stmt.query, "executing annotations query");
            let res = self
                .execute(stmt)
                .await
                .with_context(|| format!("failed to query annotation {:?}", ann.name))?;

            let names: Vec<String> = res.columns.iter().map(|c| c.name.clone()).collect();
            for row in res.into_rows()? {
                let fields = names
                    .iter()
                    .cloned()
                    .zip(row)
                    .filter(|(name, _)| name != TIME_GRAIN_ALIAS)
                    .collect();
                rows.push(Annotation {
                    fields,
                    for_measures: for_measures.clone(),
                });
            }
        }
        Ok(rows)
    }
}

const TIME_GRAIN_ALIAS: &str = "__time_grain";

/// The statement selecting the rows of `ann` within `[start, end)`.
fn annotation_statement(
    dialect: Dialect,
    ann: &AnnotationSpec,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    qry: &AnnotationsQuery,
) -> Statement {
    let time = dialect.escape_identifier("time");
    let p = dialect.time_dimension_parameter();

    // Duration grains as their rank, 0 when unknown.
    let grain_expr = ann.has_duration.then(|| {
        let duration = dialect.escape_identifier("duration");
        let whens: Vec<String> = GRAINS
            .iter()
            .map(|g| {
                format!(
                    "WHEN {} = {} THEN {}",
                    duration,
                    dialect.escape_string_value(g.as_str()),
                    *g as i64
                )
            })
            .collect();
        format!("CASE {} ELSE 0 END", whens.join(" "))
    });

    let mut sql = String::from("SELECT *");
    if let Some(expr) = &grain_expr {
        sql.push_str(&format!(
            ", ({}) AS {}",
            expr,
            dialect.escape_identifier(TIME_GRAIN_ALIAS)
        ));
    }
    sql.push_str(&format!(
        " FROM {} WHERE {} >= {} AND {} < {}",
        dialect.escape_table(&ann.database, &ann.database_schema, &ann.table),
        time,
        p,
        time,
        p
    ));
    let mut args = vec![Value::Timestamp(start), Value::Timestamp(end)];

    if ann.has_time_end {
        let time_end = dialect.escape_identifier("time_end");
        sql.push_str(&format!(
            " AND {} >= {} AND {} < {}",
            time_end, p, time_end, p
        ));
        args.extend([Value::Timestamp(start), Value::Timestamp(end)]);
    }

    if let Some(expr) = &grain_expr {
        if qry.time_grain.is_specified() {
            sql.push_str(&format!(" AND (({}) = 0 OR ({}) <= ?)", expr, expr));
            args.push(Value::Int(qry.time_grain as i64));
        }
    }

    sql.push_str(&format!(" ORDER BY {}", time));
    if let Some(limit) = qry.limit {
        sql.push_str(" LIMIT ?");
        args.push(Value::Int(limit));
    }
    if let Some(offset) = qry.offset {
        sql.push_str(" OFFSET ?");
        args.push(Value::Int(offset));
    }

    Statement::new(sql, args)
}
