//! Builds the select tree from a query.

use std::cell::Cell;

use tracing::debug;

use super::expr::{ExprCompiler, Scope};
use super::{Ast, Builder, ExprNode, FieldNode, FromClause, Join, OrderField, SelectNode};
use crate::error::{Error, Result, ResultExt};
use crate::model::{
    DimensionCompute, DimensionSelector, DimensionSpec, MeasureCompute, MeasureSpec,
    MetricsViewSpec, Query, Security, TimeGrain, TimeRange, TimeSpine, Value,
};
use crate::model::time::parse_time_zone;
use crate::model::{Dimension, Spine};
use crate::sql::{Dialect, SqlDialect, Unnest};

/// Default upper bound on the bins a time spine may generate.
pub const DEFAULT_TIME_SPINE_MAX_BINS: usize = 1000;

impl<'a> Ast<'a> {
    /// Build the tree for `query`.
    ///
    /// Relative time ranges must already be resolved to `start`/`end` and
    /// `pivot_on` must be empty; both are the executor's job.
    pub fn new(
        metrics_view: &'a MetricsViewSpec,
        security: &'a dyn Security,
        query: &'a Query,
        dialect: Dialect,
    ) -> Result<Self> {
        Self::with_time_spine_max_bins(
            metrics_view,
            security,
            query,
            dialect,
            DEFAULT_TIME_SPINE_MAX_BINS,
        )
    }

    pub fn with_time_spine_max_bins(
        metrics_view: &'a MetricsViewSpec,
        security: &'a dyn Security,
        query: &'a Query,
        dialect: Dialect,
        time_spine_max_bins: usize,
    ) -> Result<Self> {
        if !query.pivot_on.is_empty() {
            return Err(Error::validation("cannot build AST for pivot queries"));
        }
        if query.dimensions.is_empty() && query.measures.is_empty() && !query.rows {
            return Err(Error::validation(
                "must specify at least one dimension or measure",
            ));
        }

        let mut b = Builder {
            metrics_view,
            security,
            query,
            dialect,
            dim_fields: Vec::new(),
            comparison_dim_fields: Vec::new(),
            unnests: Vec::new(),
            underlying_table: dialect.escape_table(
                &metrics_view.database,
                &metrics_view.database_schema,
                &metrics_view.table,
            ),
            underlying_where: None,
            time_spine_max_bins,
            next_identifier: Cell::new(0),
        };

        let (dims, comparison_dims, unnests) = b.resolve_dimension_fields()?;
        b.dim_fields = dims;
        b.comparison_dim_fields = comparison_dims;
        b.unnests = unnests;
        b.underlying_where = b.build_underlying_where()?;

        let root = if query.rows {
            b.build_rows_select()?
        } else {
            b.build_root()?
        };

        debug!(
            metrics_view = %metrics_view.name,
            dialect = %dialect,
            dimensions = query.dimensions.len(),
            measures = query.measures.len(),
            "built metrics view AST"
        );

        Ok(Ast {
            root,
            ctes: Vec::new(),
            builder: b,
        })
    }
}

impl<'a> Builder<'a> {
    fn build_root(&self) -> Result<SelectNode> {
        let mut root = self.build_base_select(self.generate_identifier(), false)?;

        // Each measure may reshape the tree to accommodate it.
        for qm in &self.query.measures {
            if let Some(MeasureCompute::ComparisonTime { dimension }) = &qm.compute {
                self.add_comparison_time_measure(&mut root, &qm.name, dimension)
                    .with_context(|| format!("can't query measure {:?}", qm.name))?;
                continue;
            }

            let m = self
                .resolve_measure(qm, true)
                .with_context(|| format!("invalid measure {:?}", qm.name))?;
            self.add_measure_field(&mut root, &m)
                .with_context(|| format!("can't query measure {:?}", qm.name))?;
        }

        // A window field can't be filtered in place, so HAVING becomes a WHERE on a wrapping select.
        if let Some(having) = &self.query.having {
            self.wrap_select(&mut root, self.generate_identifier());
            let (expr, args) = ExprCompiler::compile(self, having, Scope::Node(&root), true, true)
                .context("failed to compile 'having'")?;
            root.where_clause = Some(ExprNode { expr, args });
        }

        for s in &self.query.sort {
            self.add_order_field(&mut root, &s.name, s.desc)
                .with_context(|| format!("can't sort by {:?}", s.name))?;
        }

        root.limit = self.query.limit;
        root.offset = self.query.offset;
        Ok(root)
    }

    /// `SELECT *` against the underlying table.
    ///
    /// Every column is returned, so every field of the view must be accessible.
    fn build_rows_select(&self) -> Result<SelectNode> {
        let dims = self
            .metrics_view
            .dimensions
            .iter()
            .map(|d| d.name.as_str())
            .filter(|name| *name != self.metrics_view.time_dimension);
        let measures = self.metrics_view.measures.iter().map(|m| m.name.as_str());
        if let Some(name) = dims.chain(measures).find(|n| !self.security.can_access_field(n)) {
            debug!(metrics_view = %self.metrics_view.name, field = name, "rows query denied");
            return Err(Error::Forbidden);
        }

        Ok(SelectNode {
            alias: self.generate_identifier(),
            from: FromClause::Table {
                expr: self.underlying_table.clone(),
                unnests: Vec::new(),
            },
            where_clause: self.underlying_where.clone(),
            time_where: self.time_range_where(self.query.time_range.as_ref())?,
            limit: self.query.limit,
            offset: self.query.offset,
            ..Default::default()
        })
    }

    /// Smallest grain among time floors on the view's time dimension.
    fn min_time_grain(&self) -> TimeGrain {
        let mut min = TimeGrain::Unspecified;
        for qd in &self.query.dimensions {
            let Some(DimensionCompute::TimeFloor { dimension, grain }) = &qd.compute else {
                continue;
            };
            if !dimension.eq_ignore_ascii_case(&self.metrics_view.time_dimension) {
                continue;
            }
            if grain.is_specified() && (!min.is_specified() || *grain < min) {
                min = *grain;
            }
        }
        min
    }

    /// Query dimensions against the underlying table, their comparison-shifted
    /// variants, and the lateral unnest clauses they need.
    #[allow(clippy::type_complexity)]
    fn resolve_dimension_fields(&self) -> Result<(Vec<FieldNode>, Vec<FieldNode>, Vec<String>)> {
        let min_grain = self.min_time_grain();
        let mut fields = Vec::with_capacity(self.query.dimensions.len());
        let mut comparison_fields = Vec::with_capacity(self.query.dimensions.len());
        let mut unnests = Vec::new();

        for qd in &self.query.dimensions {
            let dim = self
                .resolve_dimension(qd, true)
                .with_context(|| format!("invalid dimension {:?}", qd.name))?;

            let mut f = FieldNode {
                name: dim.name.clone(),
                display_name: dim.display_name_or_name().to_string(),
                expr: self.dialect.metrics_view_dimension_expression(&dim)?,
                ..Default::default()
            };

            if dim.unnest {
                let alias = self.generate_identifier();
                let unnest = self
                    .dialect
                    .lateral_unnest(&f.expr, &alias, &f.name)
                    .with_context(|| format!("failed to unnest field {:?}", f.name))?;
                match unnest {
                    Unnest::Auto => {
                        f.expr = self.dialect.auto_unnest(&f.expr);
                        f.auto_unnest = true;
                    }
                    Unnest::Lateral { from, column } => {
                        unnests.push(from);
                        f.expr = column;
                    }
                }
            }

            // Time floors on the time dimension are shifted onto the base range so both sides join.
            let mut cf = f.clone();
            if self.query.comparison_time_range.is_some() {
                if let Some(DimensionCompute::TimeFloor { dimension, grain }) = &qd.compute {
                    if dimension.eq_ignore_ascii_case(&self.metrics_view.time_dimension) {
                        cf.expr = self
                            .expression_adjusted_by_comparison_offset(&f.expr, *grain, min_grain)
                            .with_context(|| format!("invalid dimension {:?}", qd.name))?;
                    }
                }
            }

            fields.push(f);
            comparison_fields.push(cf);
        }

        Ok((fields, comparison_fields, unnests))
    }

    /// The view dimension a query dimension reads, synthesizing a spec for time floors.
    pub(crate) fn resolve_dimension(&self, qd: &Dimension, visible: bool) -> Result<DimensionSpec> {
        let Some(DimensionCompute::TimeFloor { dimension, grain }) = &qd.compute else {
            return self.lookup_dimension(&qd.name, visible);
        };

        if !grain.is_specified() {
            return Err(Error::validation(
                "\"grain\" must be specified for time floor",
            ));
        }

        let dim = self.lookup_dimension(dimension, visible)?;
        if &qd.name != dimension {
            self.check_name_for_computed_field(&qd.name)?;
        }

        let expr = self
            .dialect
            .date_trunc_expr(
                &dim,
                *grain,
                &self.query.time_zone,
                self.metrics_view.first_day_of_week(),
                self.metrics_view.first_month_of_year(),
            )
            .context("failed to compute time floor")?;

        let display_name = if dim.display_name.is_empty() {
            &qd.name
        } else {
            &dim.display_name
        };

        Ok(DimensionSpec {
            name: qd.name.clone(),
            display_name: format!("{} ({})", display_name, grain),
            expression: expr,
            unnest: dim.unnest,
            ..Default::default()
        })
    }

    /// Find a view dimension, checking field access when `visible`.
    pub(crate) fn lookup_dimension(&self, name: &str, visible: bool) -> Result<DimensionSpec> {
        if name.is_empty() {
            return Err(Error::validation("received empty dimension name"));
        }
        if visible
            && name != self.metrics_view.time_dimension
            && !self.security.can_access_field(name)
        {
            return Err(Error::Forbidden);
        }
        self.metrics_view.lookup_dimension(name)
    }

    /// Find a view measure, checking field access when `visible`.
    pub(crate) fn lookup_measure(&self, name: &str, visible: bool) -> Result<&'a MeasureSpec> {
        if visible && !self.security.can_access_field(name) {
            return Err(Error::Forbidden);
        }
        self.metrics_view.lookup_measure(name)
    }

    /// Computed fields must not shadow view fields, which derived measures may reference.
    pub(crate) fn check_name_for_computed_field(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::validation("name for computed field is empty"));
        }
        if name == self.metrics_view.time_dimension {
            return Err(Error::validation(
                "name for computed field collides with the time dimension name",
            ));
        }
        if self.metrics_view.dimension(name).is_some() {
            return Err(Error::validation(
                "name for computed field collides with an existing dimension name",
            ));
        }
        if self.metrics_view.measure(name).is_some() {
            return Err(Error::validation(
                "name for computed field collides with an existing measure name",
            ));
        }
        Ok(())
    }

    /// Every required dimension (at its grain, if any) must be a query dimension.
    pub(crate) fn check_required_dimensions(&self, m: &MeasureSpec) -> Result<()> {
        for rd in &m.required_dimensions {
            let found = self.query.dimensions.iter().any(|qd| match &qd.compute {
                Some(DimensionCompute::TimeFloor { dimension, grain }) => {
                    rd.name == *dimension
                        && (!rd.time_grain.is_specified() || rd.time_grain == *grain)
                }
                None => !rd.time_grain.is_specified() && rd.name == qd.name,
            });

            if !found {
                if rd.time_grain.is_specified() {
                    return Err(Error::validation(format!(
                        "missing required dimension {:?} at {:?} granularity",
                        rd.name,
                        rd.time_grain.as_str()
                    )));
                }
                return Err(Error::validation(format!(
                    "missing required dimension {:?}",
                    rd.name
                )));
            }
        }
        Ok(())
    }

    /// Query filter AND security query filter AND security row filter.
    fn build_underlying_where(&self) -> Result<Option<ExprNode>> {
        let mut res = None;

        if let Some(where_clause) = &self.query.where_clause {
            let (expr, args) =
                ExprCompiler::compile(self, where_clause, Scope::Table, false, true)
                    .context("failed to compile 'where'")?;
            res = ExprNode::and(res, expr, args);
        }

        if let Some(qf) = self.security.query_filter() {
            let (expr, args) = ExprCompiler::compile(self, qf, Scope::Table, false, false)
                .context("failed to compile the security policy's query filter")?;
            res = ExprNode::and(res, expr, args);
        }

        if let Some(rf) = self.security.row_filter() {
            res = ExprNode::and(res, rf.to_string(), Vec::new());
        }

        Ok(res)
    }

    /// A grouped select against the underlying table for the base or
    /// comparison time range, joined to the spine if the query has one.
    pub(crate) fn build_base_select(&self, alias: String, comparison: bool) -> Result<SelectNode> {
        let (dim_fields, tr) = if comparison {
            (
                self.comparison_dim_fields.clone(),
                self.query.comparison_time_range.as_ref(),
            )
        } else {
            (self.dim_fields.clone(), self.query.time_range.as_ref())
        };

        let mut n = SelectNode {
            alias,
            dim_fields,
            from: FromClause::Table {
                expr: self.underlying_table.clone(),
                unnests: self.unnests.clone(),
            },
            group: true,
            where_clause: self.underlying_where.clone(),
            time_where: self.time_range_where(tr)?,
            ..Default::default()
        };

        // The spine joins after GROUP BY so it can't skew the aggregates.
        if let Some(spine) = &self.query.spine {
            let sn = self.build_spine_select(self.generate_identifier(), spine, tr)?;
            self.wrap_select(&mut n, self.generate_identifier());

            // Dimension values come from the spine, which may hold values absent from the data.
            for f in &mut n.dim_fields {
                f.expr = self.member(&sn.alias, &f.name);
            }
            if let FromClause::Select { join, .. } = &mut n.from {
                *join = Join::Spine(Box::new(sn));
            }
        }

        Ok(n)
    }

    fn build_spine_select(
        &self,
        alias: String,
        spine: &Spine,
        tr: Option<&TimeRange>,
    ) -> Result<SelectNode> {
        if let Some(ws) = &spine.where_spine {
            let (expr, args) = ExprCompiler::compile(self, &ws.expr, Scope::Table, false, true)
                .context("failed to compile 'spine.where'")?;
            return Ok(SelectNode {
                alias,
                dim_fields: self.dim_fields.clone(),
                from: FromClause::Table {
                    expr: self.underlying_table.clone(),
                    unnests: self.unnests.clone(),
                },
                group: true,
                where_clause: ExprNode::and(None, expr, args),
                time_where: self.time_range_where(tr)?,
                ..Default::default()
            });
        }

        if let Some(ts) = &spine.time {
            return self.build_time_spine_select(alias, ts, tr);
        }

        Err(Error::validation(
            "spine must specify either 'where' or 'time'",
        ))
    }

    /// Generated bins for the floored time dimension, cross joined with the
    /// distinct values of any other query dimensions.
    fn build_time_spine_select(
        &self,
        alias: String,
        ts: &TimeSpine,
        tr: Option<&TimeRange>,
    ) -> Result<SelectNode> {
        let td = ts
            .time_dimension
            .as_deref()
            .unwrap_or(&self.metrics_view.time_dimension);

        let idx = self
            .query
            .dimensions
            .iter()
            .position(|qd| match &qd.compute {
                Some(DimensionCompute::TimeFloor { dimension, grain }) => {
                    dimension.eq_ignore_ascii_case(td) && *grain == ts.grain
                }
                None => false,
            })
            .ok_or_else(|| {
                Error::validation(format!(
                    "time spine requires a dimension flooring {:?} at {:?} granularity",
                    td,
                    ts.grain.as_str()
                ))
            })?;

        let bins = self.time_spine_bins(ts)?;
        let name = &self.dim_fields[idx].name;
        let bins_node = SelectNode {
            alias: self.generate_identifier(),
            dim_fields: vec![FieldNode {
                name: name.clone(),
                display_name: self.dim_fields[idx].display_name.clone(),
                expr: self.dialect.escape_identifier(name),
                ..Default::default()
            }],
            from: FromClause::Inline {
                sql: self.dialect.select_time_range_bins(&bins, name)?,
                args: Vec::new(),
                alias: self.generate_identifier(),
            },
            ..Default::default()
        };

        if self.dim_fields.len() == 1 {
            return Ok(SelectNode { alias, ..bins_node });
        }

        let others = SelectNode {
            alias: self.generate_identifier(),
            dim_fields: self
                .dim_fields
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != idx)
                .map(|(_, f)| f.clone())
                .collect(),
            from: FromClause::Table {
                expr: self.underlying_table.clone(),
                unnests: self.unnests.clone(),
            },
            group: true,
            where_clause: self.underlying_where.clone(),
            time_where: self.time_range_where(tr)?,
            ..Default::default()
        };

        let dim_fields = self
            .dim_fields
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let source = if i == idx {
                    &bins_node.alias
                } else {
                    &others.alias
                };
                FieldNode {
                    name: f.name.clone(),
                    display_name: f.display_name.clone(),
                    expr: self.member(source, &f.name),
                    ..Default::default()
                }
            })
            .collect();

        Ok(SelectNode {
            alias,
            dim_fields,
            from: FromClause::Select {
                inner: Box::new(bins_node),
                join: Join::Cross(vec![others]),
            },
            ..Default::default()
        })
    }

    /// Bin starts from the truncated spine start up to (excluding) its end.
    fn time_spine_bins(&self, ts: &TimeSpine) -> Result<Vec<chrono::DateTime<chrono::Utc>>> {
        if !ts.grain.is_specified() {
            return Err(Error::validation("time spine must specify a grain"));
        }

        // Bins must equal the floored dimension, which truncates in the query's time zone.
        let tz = parse_time_zone(&self.query.time_zone)?;
        let mut bins = Vec::new();
        let mut t = ts.grain.truncate_in(
            ts.start,
            tz,
            self.metrics_view.first_day_of_week(),
            self.metrics_view.first_month_of_year(),
        )?;
        while t < ts.end {
            if bins.len() >= self.time_spine_max_bins {
                return Err(Error::validation(format!(
                    "time spine would produce more than {} bins",
                    self.time_spine_max_bins
                )));
            }
            bins.push(t);
            t = ts
                .grain
                .add_one_in(t, tz)
                .context("time spine exceeds the supported time range")?;
        }

        if bins.is_empty() {
            return Err(Error::validation("time spine is empty"));
        }
        Ok(bins)
    }

    /// `WHERE` clause for a resolved time range.
    pub(crate) fn time_range_where(&self, tr: Option<&TimeRange>) -> Result<Option<ExprNode>> {
        let Some(tr) = tr else {
            return Ok(None);
        };
        if tr.is_zero() {
            return Ok(None);
        }
        let td = tr
            .time_dimension
            .as_deref()
            .unwrap_or(&self.metrics_view.time_dimension);
        if td.is_empty() {
            return Ok(None);
        }
        if !tr.is_resolved() {
            return Err(Error::validation(
                "received a non-empty, unresolved time range",
            ));
        }

        let col = self
            .dialect
            .metrics_view_dimension_expression(&self.metrics_view.lookup_dimension(td)?)?;
        let p = self.dialect.time_dimension_parameter();

        let res = match (tr.start, tr.end) {
            (Some(start), Some(end)) => ExprNode::new(
                format!("{} >= {} AND {} < {}", col, p, col, p),
                vec![Value::Timestamp(start), Value::Timestamp(end)],
            ),
            (Some(start), None) => {
                ExprNode::new(format!("{} >= {}", col, p), vec![Value::Timestamp(start)])
            }
            (None, Some(end)) => {
                ExprNode::new(format!("{} < {}", col, p), vec![Value::Timestamp(end)])
            }
            (None, None) => return Ok(None),
        };
        Ok(Some(res))
    }

    /// `expr` moved by the distance between the base and comparison range starts.
    ///
    /// When `grain` is coarser than the smallest time floor in the query, the
    /// raw time column is shifted at `min_grain` and truncated again, since a
    /// coarse bucket can move by less than its own width.
    fn expression_adjusted_by_comparison_offset(
        &self,
        expr: &str,
        grain: TimeGrain,
        min_grain: TimeGrain,
    ) -> Result<String> {
        let start = self.query.time_range.as_ref().and_then(|t| t.start);
        let comparison_start = self
            .query
            .comparison_time_range
            .as_ref()
            .and_then(|t| t.start);
        let (Some(start), Some(comparison_start)) = (start, comparison_start) else {
            return Err(Error::validation(
                "must specify an explicit start time for both the base and comparison time range when comparing by a time dimension",
            ));
        };

        if !grain.is_specified() || grain == min_grain {
            let grain = if grain.is_specified() {
                grain
            } else {
                TimeGrain::Millisecond
            };
            let diff = self.dialect.date_diff(grain, &start, &comparison_start)?;
            return Ok(self.dialect.interval_subtract(expr, &diff, grain));
        }

        let diff = self
            .dialect
            .date_diff(min_grain, &start, &comparison_start)?;
        let tc = self.dialect.metrics_view_dimension_expression(
            &self
                .metrics_view
                .lookup_dimension(&self.metrics_view.time_dimension)?,
        )?;
        let shifted = DimensionSpec::expression(
            self.metrics_view.time_dimension.clone(),
            self.dialect.interval_subtract(&tc, &diff, min_grain),
        );
        self.dialect
            .date_trunc_expr(
                &shifted,
                grain,
                &self.query.time_zone,
                self.metrics_view.first_day_of_week(),
                self.metrics_view.first_month_of_year(),
            )
            .context("failed to compute time floor")
    }

    /// Sorting is limited to projected dimensions and measures.
    fn add_order_field(&self, n: &mut SelectNode, name: &str, desc: bool) -> Result<()> {
        if !n.has_name(name) {
            return Err(Error::validation("name not present in context"));
        }
        n.order_by.push(OrderField {
            name: name.to_string(),
            desc,
        });
        Ok(())
    }

    /// The field in `n` for a dimension selector, matching time floors by
    /// their underlying dimension and grain.
    pub(crate) fn find_field_for_dimension<'n>(
        &self,
        n: &'n SelectNode,
        sel: &DimensionSelector,
    ) -> Option<&'n FieldNode> {
        n.dim_fields.iter().find(|f| {
            if f.name == sel.name {
                return true;
            }
            let Some(qd) = self.query.dimensions.iter().find(|qd| qd.name == f.name) else {
                return false;
            };
            match &qd.compute {
                Some(DimensionCompute::TimeFloor { dimension, grain }) => {
                    sel.name == *dimension
                        && (!sel.time_grain.is_specified() || sel.time_grain == *grain)
                }
                None => false,
            }
        })
    }
}
