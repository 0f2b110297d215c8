//! Rewrite passes applied around AST compilation.
//!
//! Query passes run before [`Ast::new`] and may issue sub-queries:
//! - [`caps`] - row caps
//! - [`pivot`] - pivot extraction and the `PIVOT` statement
//! - [`time_ranges`] - relative time range resolution
//! - [`percent_of_total`] - totals for percent-of-total measures
//! - [`druid`] - TopN exactify
//!
//! AST passes mutate the built tree in place:
//! - [`comparisons`] - two-phase and approximate comparison joins
//! - [`limits`] - limit pushdown
//! - [`druid`] - forced GROUP BY under joins
//! - [`clickhouse`] - dictionary lookups and computed time dimensions
//!
//! Every AST pass is a no-op for dialects and shapes it doesn't target, and
//! a no-op on a tree it already rewrote.

pub mod caps;
pub mod clickhouse;
pub mod comparisons;
pub mod druid;
pub mod limits;
pub mod percent_of_total;
pub mod pivot;
pub mod time_ranges;

use crate::ast::{Ast, FromClause, Join, SelectNode};
use crate::config::ExecutorSettings;
use crate::error::Result;

/// Apply the AST passes that don't consult the database, in pipeline order.
pub fn apply_static_passes(ast: &mut Ast<'_>, settings: &ExecutorSettings) -> Result<()> {
    apply_ast_passes(ast, settings, false)
}

pub(crate) fn apply_ast_passes(
    ast: &mut Ast<'_>,
    settings: &ExecutorSettings,
    two_phase_applied: bool,
) -> Result<()> {
    comparisons::rewrite_approx_comparisons(ast, &settings.comparisons, two_phase_applied);
    if settings.limit_pushdown {
        limits::rewrite_limits_into_subqueries(ast);
    }
    druid::rewrite_druid_groups(ast)?;
    clickhouse::rewrite_clickhouse_lookups(ast)?;
    clickhouse::wrap_clickhouse_computed_time_dims(ast)?;
    Ok(())
}

/// Visit every node under `n`, children before parents.
pub(crate) fn walk_post_order(
    n: &mut SelectNode,
    f: &mut dyn FnMut(&mut SelectNode) -> Result<()>,
) -> Result<()> {
    if let FromClause::Select { inner, join } = &mut n.from {
        walk_post_order(inner, f)?;
        match join {
            Join::None => {}
            Join::Spine(node) | Join::Comparison { node, .. } => walk_post_order(node, f)?,
            Join::LeftJoins(nodes) | Join::Cross(nodes) => {
                for node in nodes {
                    walk_post_order(node, f)?;
                }
            }
        }
    }
    f(n)
}

/// Visit every node of a tree, CTEs included.
pub(crate) fn walk_tree(
    root: &mut SelectNode,
    ctes: &mut [SelectNode],
    f: &mut dyn FnMut(&mut SelectNode) -> Result<()>,
) -> Result<()> {
    for cte in ctes {
        walk_post_order(cte, f)?;
    }
    walk_post_order(root, f)
}
