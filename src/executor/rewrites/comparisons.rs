//! Rewrites of comparison joins.
//!
//! A comparison query joins the base and comparison time ranges with a FULL
//! OUTER JOIN, which groups both ranges in full before the root sorts and
//! limits. When the sort reads one side only, that side can be sorted and
//! limited on its own.

use tracing::{debug, warn};

use crate::ast::{in_values, Ast, ExprNode, FromClause, Join, JoinType, OrderField, SelectNode};
use crate::config::ComparisonSettings;
use crate::error::Result;
use crate::executor::{Executor, Statement};
use crate::model::{MeasureCompute, Query, Value};
use crate::sql::{Dialect, SqlDialect};

/// What the single sort field of a comparison query reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKind {
    Dimension,
    /// A measure of the base time range.
    Base,
    /// The comparison value of the named measure.
    Comparison(String),
    /// Reads both sides.
    Delta,
}

pub fn sort_kind(qry: &Query, root: &SelectNode, name: &str) -> SortKind {
    if root.has_dimension(name) {
        return SortKind::Dimension;
    }
    match qry
        .measures
        .iter()
        .find(|m| m.name == name)
        .and_then(|m| m.compute.as_ref())
    {
        Some(MeasureCompute::ComparisonValue { measure }) => SortKind::Comparison(measure.clone()),
        Some(
            MeasureCompute::ComparisonDelta { .. }
            | MeasureCompute::ComparisonRatio { .. }
            | MeasureCompute::ComparisonTime { .. },
        ) => SortKind::Delta,
        _ => SortKind::Base,
    }
}

// =============================================================================
// Approximate comparisons
// =============================================================================

struct Approx<'s> {
    sort: OrderField,
    kind: SortKind,
    limit: Option<i64>,
    offset: Option<i64>,
    dialect: Dialect,
    settings: &'s ComparisonSettings,
}

/// Replace the FULL OUTER comparison join of a single-sort, limited query
/// with a LEFT (or RIGHT) join, sorting and limiting the sorted side first.
///
/// With `approximate_cte`, the sorted side becomes a CTE and the other side
/// only scans its dimension values. Offsets above the rewritten join are
/// cleared since the sorted side now applies them.
pub fn rewrite_approx_comparisons(
    ast: &mut Ast<'_>,
    settings: &ComparisonSettings,
    two_phase_applied: bool,
) {
    if !settings.approximate || two_phase_applied {
        return;
    }

    let dialect = ast.dialect();
    let qry = ast.query();
    let Ast { root, ctes, .. } = ast;

    if root.order_by.len() != 1 || root.limit.is_none() || qry.having.is_some() {
        return;
    }
    let sort = root.order_by[0].clone();
    let kind = sort_kind(qry, root, &sort.name);
    if kind == SortKind::Delta {
        debug!(sort = %sort.name, "approximate comparison not applicable to delta sorts");
        return;
    }

    let ctx = Approx {
        kind,
        limit: root.limit,
        offset: root.offset,
        sort,
        dialect,
        settings,
    };
    walk_approx(root, &ctx, ctes);
}

fn walk_approx(n: &mut SelectNode, ctx: &Approx<'_>, ctes: &mut Vec<SelectNode>) -> bool {
    let mut rewrote = false;
    if n.comparison().is_some() {
        rewrote = rewrite_approx_node(n, ctx, ctes);
    }
    if let Some(inner) = n.inner_mut() {
        rewrote |= walk_approx(inner, ctx, ctes);
    }
    if rewrote {
        n.offset = None;
    }
    rewrote
}

fn rewrite_approx_node(n: &mut SelectNode, ctx: &Approx<'_>, ctes: &mut Vec<SelectNode>) -> bool {
    let FromClause::Select {
        inner,
        join: Join::Comparison { node, join_type },
    } = &mut n.from
    else {
        return false;
    };
    if *join_type != JoinType::Full {
        return false;
    }

    let (sorted, other, order_name, new_join) = match &ctx.kind {
        SortKind::Dimension | SortKind::Base => (
            &mut **inner,
            &mut **node,
            ctx.sort.name.clone(),
            JoinType::Left,
        ),
        SortKind::Comparison(measure) => {
            (&mut **node, &mut **inner, measure.clone(), JoinType::Right)
        }
        SortKind::Delta => return false,
    };
    if !sorted.has_name(&order_name) || !sorted.order_by.is_empty() || sorted.limit.is_some() {
        return false;
    }

    *join_type = new_join;
    sorted.order_by = vec![OrderField {
        name: order_name,
        desc: ctx.sort.desc,
    }];
    sorted.limit = ctx.limit;
    sorted.offset = ctx.offset;

    if ctx.settings.approximate_cte
        && ctx.dialect != Dialect::Druid
        && other.is_table()
        && !sorted.is_cte
    {
        let filter = in_cte_filter(sorted, other, ctx.dialect);
        Ast::convert_to_cte(ctes, sorted);
        other.where_clause = ExprNode::and(other.where_clause.take(), filter, Vec::new());
    }

    debug!(join = ?new_join, sort = %ctx.sort.name, "approximated comparison join");
    true
}

/// `expr IN (SELECT "name" FROM cte)` for every dimension computed the same
/// way on both sides.
fn in_cte_filter(cte: &SelectNode, other: &SelectNode, dialect: Dialect) -> String {
    cte.dim_fields
        .iter()
        .filter(|f| !f.auto_unnest)
        .filter_map(|f| {
            let of = other.dim_fields.iter().find(|o| o.name == f.name)?;
            if of.expr != f.expr {
                return None;
            }
            Some(format!(
                "{} IN (SELECT {} FROM {})",
                of.expr,
                dialect.escape_member(&cte.alias, &f.name),
                cte.alias
            ))
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

// =============================================================================
// Two-phase comparisons
// =============================================================================

impl Executor {
    /// Run the sorted side of a small single-dimension comparison query on
    /// its own, then join its inlined rows against the other side filtered
    /// to the same dimension values.
    ///
    /// Returns whether the AST was rewritten.
    pub(crate) async fn rewrite_two_phase_comparisons(
        &self,
        ast: &mut Ast<'_>,
        og_limit: Option<i64>,
    ) -> Result<bool> {
        let cfg = &self.settings.comparisons;
        if !cfg.two_phase || self.dialect() != Dialect::Druid {
            return Ok(false);
        }
        let qry = ast.query();
        if qry.comparison_time_range.is_none() {
            return Ok(false);
        }
        let Some(limit) = og_limit.filter(|l| *l <= cfg.two_phase_limit) else {
            debug!(limit = ?og_limit, "two-phase comparison not applicable to limit");
            return Ok(false);
        };

        let Some(plan) = plan_two_phase(ast, limit) else {
            warn!(metrics_view = %self.metrics_view.name, "two-phase comparison not applicable to query shape");
            return Ok(false);
        };
        let (sql, args) = ast.select_sql(&plan.standalone)?;

        let res = self.execute(Statement::new(sql, args)).await?;
        let rows = res.into_rows()?;
        if rows.is_empty() {
            debug!("two-phase comparison skipped for empty sorted side");
            return Ok(false);
        }

        let (inline_sql, inline_args) = self
            .dialect()
            .select_inline_results(&plan.columns, &rows)?;
        let values: Vec<Value> = rows.iter().map(|r| r[0].clone()).collect();
        let inline_alias = ast.generate_identifier();
        apply_two_phase(ast, &plan, inline_sql, inline_args, inline_alias, &values);

        debug!(rows = rows.len(), "applied two-phase comparison");
        Ok(true)
    }
}

struct TwoPhasePlan {
    base_sorted: bool,
    standalone: SelectNode,
    columns: Vec<String>,
}

fn plan_two_phase(ast: &Ast<'_>, limit: i64) -> Option<TwoPhasePlan> {
    let qry = ast.query();
    if qry.dimensions.len() != 1 || qry.sort.len() != 1 || qry.having.is_some() {
        return None;
    }
    let sort = &qry.sort[0];
    let (base_sorted, order_name) = match sort_kind(qry, &ast.root, &sort.name) {
        SortKind::Dimension | SortKind::Base => (true, sort.name.clone()),
        SortKind::Comparison(measure) => (false, measure),
        SortKind::Delta => return None,
    };

    let FromClause::Select {
        inner,
        join: Join::Comparison {
            node,
            join_type: JoinType::Full,
        },
    } = &ast.root.from
    else {
        return None;
    };
    let (sorted, other) = if base_sorted {
        (&**inner, &**node)
    } else {
        (&**node, &**inner)
    };
    if !sorted.is_table() || !other.is_table() || !sorted.has_name(&order_name) {
        return None;
    }

    let mut standalone = sorted.clone();
    standalone.order_by = vec![OrderField {
        name: order_name,
        desc: sort.desc,
    }];
    standalone.limit = Some(limit);
    standalone.offset = qry.offset;

    let columns = standalone
        .dim_fields
        .iter()
        .chain(standalone.measure_fields.iter())
        .map(|f| f.name.clone())
        .collect();
    Some(TwoPhasePlan {
        base_sorted,
        standalone,
        columns,
    })
}

fn apply_two_phase(
    ast: &mut Ast<'_>,
    plan: &TwoPhasePlan,
    inline_sql: String,
    inline_args: Vec<Value>,
    inline_alias: String,
    values: &[Value],
) {
    let dialect = ast.dialect();
    let root = &mut ast.root;
    let FromClause::Select {
        inner,
        join: Join::Comparison { node, join_type },
    } = &mut root.from
    else {
        return;
    };

    let (sorted, other) = if plan.base_sorted {
        *join_type = JoinType::Left;
        (&mut **inner, &mut **node)
    } else {
        *join_type = JoinType::Right;
        (&mut **node, &mut **inner)
    };

    if let Some(f) = other.dim_fields.first() {
        let filter = in_values(&ExprNode::new(f.expr.clone(), Vec::new()), values, false);
        other.where_clause = ExprNode::and(other.where_clause.take(), filter.expr, filter.args);
    }

    let member = |f: &crate::ast::FieldNode| crate::ast::FieldNode {
        expr: dialect.escape_member(&inline_alias, &f.name),
        auto_unnest: false,
        ..f.clone()
    };
    *sorted = SelectNode {
        alias: sorted.alias.clone(),
        dim_fields: plan.standalone.dim_fields.iter().map(member).collect(),
        measure_fields: plan.standalone.measure_fields.iter().map(member).collect(),
        from: FromClause::Inline {
            sql: inline_sql,
            args: inline_args,
            alias: inline_alias.clone(),
        },
        ..Default::default()
    };

    // The inlined rows are already paged.
    root.offset = None;
}
