//! Totals for percent-of-total measures.

use tracing::debug;

use crate::error::{Error, Result, ResultExt};
use crate::executor::{Executor, Statement};
use crate::model::{Measure, MeasureCompute, Query, Value};

impl Executor {
    /// Bind the denominator of every percent-of-total measure in `qry` by
    /// querying the measure without dimensions.
    pub(crate) async fn rewrite_percent_of_totals(&self, qry: &mut Query) -> Result<()> {
        for i in 0..qry.measures.len() {
            let measure = match &qry.measures[i].compute {
                Some(MeasureCompute::PercentOfTotal { measure, total: None }) => measure.clone(),
                _ => continue,
            };

            let totals_qry = totals_query(qry, &measure);
            let ast = self.new_ast(&totals_qry)?;
            let (sql, args) = ast.sql()?;
            drop(ast);

            let res = self
                .execute(Statement::new(sql, args))
                .await
                .with_context(|| format!("failed to compute total of measure {:?}", measure))?;
            let total = total_from_value(res.first_value().unwrap_or(&Value::Null))
                .with_context(|| format!("invalid total of measure {:?}", measure))?;

            debug!(measure = %measure, total, "bound percent of total");
            if let Some(MeasureCompute::PercentOfTotal { total: t, .. }) =
                &mut qry.measures[i].compute
            {
                *t = Some(total);
            }
        }
        Ok(())
    }
}

/// The query totalling `measure` over the same rows as `qry`.
pub fn totals_query(qry: &Query, measure: &str) -> Query {
    Query {
        metrics_view: qry.metrics_view.clone(),
        measures: vec![Measure::new(measure)],
        where_clause: qry.where_clause.clone(),
        time_range: qry.time_range.clone(),
        time_zone: qry.time_zone.clone(),
        ..Default::default()
    }
}

/// An empty aggregate totals to zero.
fn total_from_value(v: &Value) -> Result<f64> {
    if v.is_null() {
        return Ok(0.0);
    }
    v.as_f64()
        .ok_or_else(|| Error::validation(format!("expected a numeric value, got {:?}", v)))
}
