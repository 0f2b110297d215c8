//! Validation of a metrics view against its underlying table.

use std::collections::HashMap;

use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::error::{Error, Result, ResultExt};
use crate::executor::{Column, Executor, Statement};
use crate::model::{DimensionSpec, MeasureSpec, MeasureType};
use crate::sql::{Dialect, SqlDialect, Unnest};

/// Errors found while validating a metrics view.
#[derive(Debug, Default)]
pub struct ValidateResult {
    pub time_dimension_err: Option<Error>,
    /// Sorted by index.
    pub dimension_errs: Vec<IndexedError>,
    /// Sorted by index.
    pub measure_errs: Vec<IndexedError>,
    pub other_errs: Vec<Error>,
}

/// An error of the dimension or measure at `idx`.
#[derive(Debug)]
pub struct IndexedError {
    pub idx: usize,
    pub err: Error,
}

impl ValidateResult {
    pub fn is_zero(&self) -> bool {
        self.time_dimension_err.is_none()
            && self.dimension_errs.is_empty()
            && self.measure_errs.is_empty()
            && self.other_errs.is_empty()
    }

    /// Every error, in report order.
    pub fn errors(&self) -> impl Iterator<Item = &Error> {
        self.time_dimension_err
            .iter()
            .chain(self.dimension_errs.iter().map(|e| &e.err))
            .chain(self.measure_errs.iter().map(|e| &e.err))
            .chain(self.other_errs.iter())
    }
}

impl Executor {
    /// Check that every dimension and simple measure of the view compiles
    /// and runs against the underlying table.
    ///
    /// Problems with the view are reported in the result; only failures to
    /// reach the store are returned as errors.
    pub async fn validate_metrics_view(&self) -> Result<ValidateResult> {
        let mut res = ValidateResult::default();
        let mv = &*self.metrics_view;

        let Some(columns) = self
            .olap
            .table_columns(&mv.database, &mv.database_schema, &mv.table)
            .await
            .with_context(|| format!("could not find table {:?}", mv.table))?
        else {
            res.other_errs.push(Error::validation(format!(
                "table {:?} does not exist",
                mv.table
            )));
            return Ok(res);
        };
        let cols: HashMap<String, Column> = columns
            .into_iter()
            .map(|c| (c.name.to_lowercase(), c))
            .collect();

        self.validate_time_dimension(&cols, &mut res).await;

        // ClickHouse substitutes select aliases into expressions.
        if self.dialect() == Dialect::ClickHouse {
            for d in &mv.dimensions {
                if (d.expression.is_empty() && !d.unnest) || d.expression == d.name {
                    continue;
                }
                if cols.contains_key(&d.name.to_lowercase()) {
                    res.other_errs.push(Error::validation(format!(
                        "invalid dimension {:?}: dimensions that use `expression` or `unnest` cannot have the same name as a column in the underlying table when backed by clickhouse",
                        d.name
                    )));
                }
            }
            for m in &mv.measures {
                if cols.contains_key(&m.name.to_lowercase()) {
                    res.other_errs.push(Error::validation(format!(
                        "invalid measure {:?}: measures cannot have the same name as a column in the underlying table when backed by clickhouse",
                        m.name
                    )));
                }
            }
        }

        if let Err(err) = self.validate_all_fields().await {
            debug!(metrics_view = %mv.name, error = %err, "validating fields one by one");
            self.validate_individual_fields(&cols, &mut res).await;
        }

        self.validate_annotations(&mut res).await?;

        if self.dialect() == Dialect::Pinot && (mv.first_day_of_week > 1 || mv.first_month_of_year > 1)
        {
            res.other_errs.push(Error::validation(
                "time shift not supported for Pinot dialect, so FirstDayOfWeek and FirstMonthOfYear should be 1",
            ));
        }

        // The schema is only computable once every field is valid.
        if res.is_zero() {
            if let Err(err) = self.validate_schema(&mut res).await {
                res.other_errs
                    .push(err.context("failed to validate metrics view schema"));
            }
        }

        if let Err(err) = self.cache_key().await {
            res.other_errs.push(err.context("failed to get cache key"));
        }

        Ok(res)
    }

    async fn validate_time_dimension(
        &self,
        cols: &HashMap<String, Column>,
        res: &mut ValidateResult,
    ) {
        let mv = &*self.metrics_view;
        if mv.time_dimension.is_empty() {
            return;
        }

        let Some(d) = mv
            .dimensions
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(&mv.time_dimension))
        else {
            res.time_dimension_err = match cols.get(&mv.time_dimension.to_lowercase()) {
                None => Some(Error::validation(format!(
                    "timeseries {:?} is not a column in table {:?} or defined in metrics view",
                    mv.time_dimension, mv.table
                ))),
                Some(c) if !self.is_time_column(c) => Some(Error::validation(format!(
                    "time dimension {:?} is not a TIMESTAMP column, got {}",
                    mv.time_dimension, c.data_type
                ))),
                Some(_) => None,
            };
            return;
        };

        let checked = async {
            let expr = self.dialect().metrics_view_dimension_expression(d)?;
            let sql = format!("SELECT {} FROM {} LIMIT 0", expr, self.table());
            let out = self.execute(Statement::new(sql, Vec::new())).await?;
            Ok::<_, Error>(out.columns.first().cloned())
        }
        .await;

        res.time_dimension_err = match checked {
            Err(err) => Some(err.context(format!(
                "failed to validate time dimension {:?}",
                mv.time_dimension
            ))),
            Ok(None) => Some(Error::validation(format!(
                "time dimension {:?} is not a column in table {:?} or defined in metrics view",
                mv.time_dimension, mv.table
            ))),
            Ok(Some(c)) if !self.is_time_column(&c) => Some(Error::validation(format!(
                "time dimension {:?} is not a TIMESTAMP column, got {}",
                mv.time_dimension, c.data_type
            ))),
            Ok(Some(_)) => None,
        };
    }

    /// Pinot stores epoch millis in LONG columns.
    fn is_time_column(&self, c: &Column) -> bool {
        if c.is_time() {
            return true;
        }
        let t = c.data_type.to_ascii_uppercase();
        self.dialect() == Dialect::Pinot && (t == "LONG" || t == "BIGINT")
    }

    /// Dry run every dimension and simple measure in one statement.
    async fn validate_all_fields(&self) -> Result<()> {
        let mv = &*self.metrics_view;

        let mut dims = Vec::with_capacity(mv.dimensions.len());
        let mut unnests = Vec::new();
        for d in &mv.dimensions {
            let (expr, unnest) = self
                .dimension_select(d)
                .with_context(|| format!("failed to validate dimension {:?}", d.name))?;
            dims.push(expr);
            unnests.extend(unnest);
        }
        let measures: Vec<String> = mv
            .measures
            .iter()
            .filter(|m| is_simple(m))
            .map(|m| format!("({})", m.expression))
            .collect();

        let sql = match (dims.is_empty(), measures.is_empty()) {
            (true, true) => return Ok(()),
            (true, false) => format!(
                "SELECT 1, {} FROM {} GROUP BY 1",
                measures.join(","),
                self.table()
            ),
            (false, _) => {
                let groups: Vec<String> = (1..=dims.len()).map(|i| i.to_string()).collect();
                let fields = dims.into_iter().chain(measures).collect::<Vec<_>>();
                format!(
                    "SELECT {} FROM {}{} GROUP BY {}",
                    fields.join(","),
                    self.table(),
                    unnests
                        .iter()
                        .map(|u| format!(", {}", u))
                        .collect::<String>(),
                    groups.join(",")
                )
            }
        };

        self.execute(Statement::dry_run(sql))
            .await
            .context("failed to validate dims and metrics")?;
        Ok(())
    }

    async fn validate_individual_fields(
        &self,
        cols: &HashMap<String, Column>,
        res: &mut ValidateResult,
    ) {
        let mv = &*self.metrics_view;
        let limit = self.settings.validate_concurrency.max(1);

        let dimension_errs = stream::iter(mv.dimensions.iter().enumerate())
            .map(move |(idx, d)| async move {
                self.validate_dimension(d, cols)
                    .await
                    .err()
                    .map(|err| IndexedError { idx, err })
            })
            .buffer_unordered(limit)
            .filter_map(|e| async move { e })
            .collect::<Vec<_>>()
            .await;

        let measure_errs = stream::iter(
            mv.measures
                .iter()
                .enumerate()
                .filter(|(_, m)| is_simple(m)),
        )
        .map(move |(idx, m)| async move {
            self.validate_measure(m).await.err().map(|err| IndexedError {
                idx,
                err: err.context(format!("invalid expression for measure {:?}", m.name)),
            })
        })
        .buffer_unordered(limit)
        .filter_map(|e| async move { e })
        .collect::<Vec<_>>()
        .await;

        res.dimension_errs.extend(dimension_errs);
        res.measure_errs.extend(measure_errs);
        res.dimension_errs.sort_by_key(|e| e.idx);
        res.measure_errs.sort_by_key(|e| e.idx);
    }

    async fn validate_dimension(
        &self,
        d: &DimensionSpec,
        cols: &HashMap<String, Column>,
    ) -> Result<()> {
        if !d.column.is_empty() {
            if !cols.contains_key(&d.column.to_lowercase()) {
                return Err(Error::validation(format!(
                    "failed to validate dimension {:?}: column {:?} not found in table",
                    d.name, d.column
                )));
            }
            // A plain column needs no dry run.
            if !d.unnest {
                return Ok(());
            }
        }

        let (expr, unnest) = self
            .dimension_select(d)
            .with_context(|| format!("failed to validate dimension {:?}", d.name))?;
        let unnest = unnest.map(|u| format!(", {}", u)).unwrap_or_default();
        let sql = format!("SELECT {} FROM {}{} GROUP BY 1", expr, self.table(), unnest);
        self.execute(Statement::dry_run(sql))
            .await
            .with_context(|| format!("failed to validate expression for dimension {:?}", d.name))?;
        Ok(())
    }

    async fn validate_measure(&self, m: &MeasureSpec) -> Result<()> {
        let sql = format!(
            "SELECT 1, ({}) FROM {} GROUP BY 1",
            m.expression,
            self.table()
        );
        self.execute(Statement::dry_run(sql)).await?;
        Ok(())
    }

    /// Measures must not resolve to text, time or nested types.
    async fn validate_schema(&self, res: &mut ValidateResult) -> Result<()> {
        let schema = self.schema().await?;
        let types: HashMap<&str, &Column> = schema.iter().map(|c| (c.name.as_str(), c)).collect();

        for (idx, m) in self.metrics_view.measures.iter().enumerate() {
            // Schemas are not always reliable, so unknown columns pass.
            let Some(c) = types.get(m.name.as_str()) else {
                continue;
            };
            if !c.is_numeric() && !c.data_type.is_empty() {
                res.measure_errs.push(IndexedError {
                    idx,
                    err: Error::validation(format!(
                        "measure {:?} is of type {}, but must be a numeric type",
                        m.name, c.data_type
                    )),
                });
            }
        }
        Ok(())
    }

    /// `expr AS "name"` of a dimension, plus the lateral unnest clause it needs.
    fn dimension_select(&self, d: &DimensionSpec) -> Result<(String, Option<String>)> {
        let dialect = self.dialect();
        let mut expr = dialect.metrics_view_dimension_expression(d)?;
        let mut clause = None;
        if d.unnest {
            let alias = format!("{}_unnest", d.name);
            match dialect.lateral_unnest(&expr, &alias, &d.name)? {
                Unnest::Auto => expr = dialect.auto_unnest(&expr),
                Unnest::Lateral { from, column } => {
                    clause = Some(from);
                    expr = column;
                }
            }
        }
        Ok((
            format!("({}) AS {}", expr, dialect.escape_identifier(&d.name)),
            clause,
        ))
    }

    /// Annotation tables need `time` and `description` columns, plus any
    /// optional column they declare.
    async fn validate_annotations(&self, res: &mut ValidateResult) -> Result<()> {
        let mv = &*self.metrics_view;
        for ann in &mv.annotations {
            if let Some(m) = ann.measures.iter().find(|m| mv.lookup_measure(m).is_err()) {
                res.other_errs.push(Error::validation(format!(
                    "invalid measures for annotation {:?}: measure {:?} not found",
                    ann.name, m
                )));
            }

            let Some(columns) = self
                .olap
                .table_columns(&ann.database, &ann.database_schema, &ann.table)
                .await
                .with_context(|| format!("could not find table {:?}", ann.table))?
            else {
                res.other_errs.push(Error::validation(format!(
                    "table {:?} for annotation {:?} does not exist",
                    ann.table, ann.name
                )));
                continue;
            };

            let has = |name: &str| columns.iter().any(|c| c.name.eq_ignore_ascii_case(name));
            let required = [
                ("time", true),
                ("description", true),
                ("time_end", ann.has_time_end),
                ("duration", ann.has_duration),
            ];
            for (col, _) in required.iter().filter(|(col, needed)| *needed && !has(col)) {
                res.other_errs.push(Error::validation(format!(
                    "table {:?} for annotation {:?} does not have the required {:?} column",
                    ann.table, ann.name, col
                )));
            }
        }
        Ok(())
    }

    fn table(&self) -> String {
        let mv = &self.metrics_view;
        self.dialect()
            .escape_table(&mv.database, &mv.database_schema, &mv.table)
    }
}

fn is_simple(m: &MeasureSpec) -> bool {
    m.measure_type == MeasureType::Simple && m.window.is_none()
}
