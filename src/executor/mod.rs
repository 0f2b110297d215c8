//! Runs metrics view queries against an OLAP store.
//!
//! The [`Executor`] owns the store handle and applies the rewrite pipeline
//! around [`Ast`] compilation:
//!
//! ```text
//! Query ─ validate ─ caps ─ pivot ─ time ranges ─ percent of total ─ druid exactify
//!   │
//!   ▼
//! Ast ─ two-phase ─ approximate comparisons ─ limit pushdown ─ druid groups ─ clickhouse
//!   │
//!   ▼
//! SQL ─ OlapStore
//! ```
//!
//! Passes that need data (totals, exactify, timestamps) run their sub-queries
//! through the same store with the interactive timeout.

mod annotations;
mod cache;
mod olap;
pub mod rewrites;
mod search;
mod timestamps;
mod validate;

pub use annotations::{Annotation, AnnotationsQuery};
pub use cache::compute_hash;
pub use olap::{Column, ExportFormat, OlapStore, QueryResult, Statement};
pub use rewrites::apply_static_passes;
pub use search::{SearchQuery, SearchResult};
pub use timestamps::TimestampsResult;
pub use validate::{IndexedError, ValidateResult};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::ast::Ast;
use crate::config::ExecutorSettings;
use crate::error::{Error, Result};
use crate::model::{
    Dimension, Measure, MetricsViewSpec, Query, Security, TimeGrain, TimeRange, Value,
};
use crate::sql::{Dialect, SqlDialect};

use self::olap::{export_with_timeout, query_with_timeout};
use self::rewrites::pivot::PivotPlan;

/// Executes queries for one metrics view on behalf of one user.
#[derive(Debug)]
pub struct Executor {
    olap: Arc<dyn OlapStore>,
    /// DuckDB store used to pivot results from stores that can't pivot.
    pivot_store: Option<Arc<dyn OlapStore>>,
    metrics_view: Arc<MetricsViewSpec>,
    security: Arc<dyn Security>,
    settings: ExecutorSettings,
    interactive_timeout: Duration,
    export_timeout: Duration,
    /// Cached per time dimension.
    timestamps: Mutex<HashMap<String, TimestampsResult>>,
}

impl Executor {
    pub fn new(
        olap: Arc<dyn OlapStore>,
        metrics_view: Arc<MetricsViewSpec>,
        security: Arc<dyn Security>,
        settings: ExecutorSettings,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            olap,
            pivot_store: None,
            metrics_view,
            security,
            interactive_timeout: settings.interactive_timeout()?,
            export_timeout: settings.export_timeout()?,
            settings,
            timestamps: Mutex::new(HashMap::new()),
        })
    }

    /// Set the DuckDB store used to serve pivots for non-DuckDB stores.
    pub fn with_pivot_store(mut self, store: Arc<dyn OlapStore>) -> Self {
        self.pivot_store = Some(store);
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.olap.dialect()
    }

    pub fn metrics_view(&self) -> &MetricsViewSpec {
        &self.metrics_view
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Check a query for option combinations that can never compile.
    pub fn validate_query(&self, qry: &Query) -> Result<()> {
        qry.validate()
    }

    /// Resolve the relative time ranges of `qry` against known timestamps.
    pub fn bind_query(&self, qry: &mut Query, timestamps: &TimestampsResult) -> Result<()> {
        let anchor = timestamps.watermark.or(timestamps.max).unwrap_or(timestamps.now);
        let mv = &self.metrics_view;
        for tr in [&mut qry.time_range, &mut qry.comparison_time_range]
            .into_iter()
            .flatten()
        {
            rewrites::time_ranges::resolve_time_range(
                tr,
                Some(anchor),
                mv.first_day_of_week(),
                mv.first_month_of_year(),
            )?;
        }
        Ok(())
    }

    /// Execute `qry` and return its rows.
    ///
    /// `execution_time` anchors relative time ranges; without it they anchor
    /// on the watermark.
    pub async fn query(
        &self,
        mut qry: Query,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<QueryResult> {
        if !self.security.can_access() {
            return Err(Error::Forbidden);
        }
        qry.validate()?;

        // Two-phase comparisons use the limit the caller asked for.
        let og_limit = qry.limit;

        let rows_cap = self.rewrite_query_enforce_caps(&mut qry)?;
        let pivot = PivotPlan::extract(&mut qry)?;
        self.rewrite_query_time_ranges(&mut qry, execution_time).await?;
        self.rewrite_percent_of_totals(&mut qry).await?;
        self.rewrite_query_druid_exactify(&mut qry).await?;

        let mut ast = self.new_ast(&qry)?;

        let two_phase = self
            .rewrite_two_phase_comparisons(&mut ast, og_limit)
            .await?;
        self.apply_ast_passes(&mut ast, two_phase)?;

        let mut res = match pivot {
            None => {
                let (sql, args) = ast.sql()?;
                debug!(metrics_view = %self.metrics_view.name, sql = %sql, "executing query");
                drop(ast);
                self.execute(Statement::new(sql, args)).await?
            }
            Some(plan) => {
                let underlying = ast.sql()?;
                let names = plan.output_names(&ast)?;
                drop(ast);
                self.query_pivot(&plan, &names, underlying).await?
            }
        };

        if let Some(cap) = rows_cap {
            res.set_cap(cap);
        }
        Ok(res)
    }

    /// Execute `qry` and write its rows to a temporary file.
    ///
    /// The caller owns the returned file. Row caps don't apply.
    pub async fn export(
        &self,
        mut qry: Query,
        execution_time: Option<DateTime<Utc>>,
        format: ExportFormat,
    ) -> Result<PathBuf> {
        if !self.security.can_access() {
            return Err(Error::Forbidden);
        }
        qry.validate()?;

        let pivot = PivotPlan::extract(&mut qry)?;
        self.rewrite_query_time_ranges(&mut qry, execution_time).await?;
        self.rewrite_percent_of_totals(&mut qry).await?;
        self.rewrite_query_druid_exactify(&mut qry).await?;

        let mut ast = self.new_ast(&qry)?;
        self.apply_ast_passes(&mut ast, false)?;

        let underlying = ast.sql()?;
        let names = pivot
            .as_ref()
            .map(|plan| plan.output_names(&ast))
            .transpose()?;
        drop(ast);

        if let (Some(plan), Some(names)) = (&pivot, &names) {
            return self
                .execute_pivot_export(plan, names, underlying, format)
                .await;
        }

        let path = temp_export_path(format);
        let (sql, args) = underlying;
        export_with_timeout(
            &*self.olap,
            Statement::new(sql, args),
            &path,
            format,
            self.export_timeout,
        )
        .await?;
        Ok(path)
    }

    /// Result columns of a query over every accessible field.
    pub async fn schema(&self) -> Result<Vec<Column>> {
        if !self.security.can_access() {
            return Err(Error::Forbidden);
        }
        let mv = &self.metrics_view;

        let mut dimensions = Vec::new();
        if !mv.time_dimension.is_empty() {
            dimensions.push(Dimension::time_floor(
                mv.time_dimension.clone(),
                mv.time_dimension.clone(),
                TimeGrain::Day,
            ));
        }
        for d in &mv.dimensions {
            if d.name != mv.time_dimension && self.security.can_access_field(&d.name) {
                dimensions.push(Dimension::new(d.name.clone()));
            }
        }
        let measures = mv
            .measures
            .iter()
            .filter(|m| self.security.can_access_field(&m.name))
            .map(|m| Measure::new(m.name.clone()))
            .collect::<Vec<_>>();

        // A comparison range exposes the columns of comparison-time measures.
        let now = Utc::now();
        let (time_range, comparison_time_range) = if mv.time_dimension.is_empty() {
            (None, None)
        } else {
            (
                Some(TimeRange::new(now - TimeDelta::seconds(1), now)),
                Some(TimeRange::new(
                    now - TimeDelta::seconds(2),
                    now - TimeDelta::seconds(1),
                )),
            )
        };

        let qry = Query {
            metrics_view: mv.name.clone(),
            dimensions,
            measures,
            time_range,
            comparison_time_range,
            limit: Some(0),
            ..Default::default()
        };

        let ast = self.new_ast(&qry)?;
        let (sql, args) = ast.sql()?;
        drop(ast);
        let res = self.execute(Statement::new(sql, args)).await?;
        Ok(res.columns.clone())
    }

    /// Build an AST with this executor's security and settings.
    pub(crate) fn new_ast<'q>(&'q self, qry: &'q Query) -> Result<Ast<'q>> {
        Ast::with_time_spine_max_bins(
            &self.metrics_view,
            &*self.security,
            qry,
            self.dialect(),
            self.settings.time_spine_max_bins,
        )
    }

    fn apply_ast_passes(&self, ast: &mut Ast<'_>, two_phase_applied: bool) -> Result<()> {
        rewrites::apply_ast_passes(ast, &self.settings, two_phase_applied)
    }

    /// Run a statement with the interactive timeout.
    pub(crate) async fn execute(&self, stmt: Statement) -> Result<QueryResult> {
        query_with_timeout(&*self.olap, stmt, self.interactive_timeout).await
    }

    /// Serve a pivot by exporting it to Parquet and reading the file back.
    async fn query_pivot(
        &self,
        plan: &PivotPlan,
        names: &rewrites::pivot::PivotNames,
        underlying: (String, Vec<Value>),
    ) -> Result<QueryResult> {
        let duck = self.pivot_duckdb()?;
        let path = self
            .execute_pivot_export(plan, names, underlying, ExportFormat::Parquet)
            .await?;

        let sql = format!(
            "SELECT * FROM {}",
            Dialect::DuckDb.escape_string_value(&path.to_string_lossy())
        );
        let res = query_with_timeout(
            &*duck,
            Statement::new(sql, Vec::new()),
            self.interactive_timeout,
        )
        .await;
        match res {
            Ok(mut res) => {
                res.set_cleanup(move || remove_file(&path));
                Ok(res)
            }
            Err(err) => {
                remove_file(&path);
                Err(err)
            }
        }
    }

    /// Run the pivot statement and export its result to a new temporary file.
    async fn execute_pivot_export(
        &self,
        plan: &PivotPlan,
        names: &rewrites::pivot::PivotNames,
        underlying: (String, Vec<Value>),
        format: ExportFormat,
    ) -> Result<PathBuf> {
        let out = temp_export_path(format);
        let (sql, args) = underlying;

        if self.dialect().can_pivot() {
            let pivot_sql = plan.sql(names, &format!("({})", sql))?;
            export_with_timeout(
                &*self.olap,
                Statement::new(pivot_sql, args),
                &out,
                format,
                self.export_timeout,
            )
            .await?;
            return Ok(out);
        }

        let duck = self.pivot_duckdb()?;
        let staged = TempFile(temp_export_path(ExportFormat::Parquet));
        export_with_timeout(
            &*self.olap,
            Statement::new(sql, args),
            &staged.0,
            ExportFormat::Parquet,
            self.export_timeout,
        )
        .await?;

        let from = format!(
            "(SELECT * FROM {})",
            Dialect::DuckDb.escape_string_value(&staged.0.to_string_lossy())
        );
        let pivot_sql = plan.sql(names, &from)?;
        export_with_timeout(
            &*duck,
            Statement::new(pivot_sql, Vec::new()),
            &out,
            format,
            self.export_timeout,
        )
        .await?;
        Ok(out)
    }

    fn pivot_duckdb(&self) -> Result<Arc<dyn OlapStore>> {
        if self.dialect() == Dialect::DuckDb {
            return Ok(self.olap.clone());
        }
        self.pivot_store.clone().ok_or_else(|| {
            Error::unsupported(format!(
                "pivot queries on {} require a DuckDB store to serve the pivot",
                self.dialect()
            ))
        })
    }
}

/// A file removed when dropped.
struct TempFile(PathBuf);

impl Drop for TempFile {
    fn drop(&mut self) {
        remove_file(&self.0);
    }
}

fn remove_file(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove temporary file");
        }
    }
}

fn temp_export_path(format: ExportFormat) -> PathBuf {
    std::env::temp_dir().join(format!(
        "metricsview_{}.{}",
        uuid::Uuid::new_v4().simple(),
        format.extension()
    ))
}
