//! ClickHouse-specific rewrites.

use tracing::debug;

use super::walk_tree;
use crate::ast::{Ast, FromClause, SelectNode};
use crate::error::{Result, ResultExt};
use crate::model::{DimensionCompute, LookupMeta};
use crate::sql::{Dialect, SqlDialect};

/// Group by dictionary keys and resolve lookups after aggregation.
///
/// A lookup dimension renders as `dictGet(...)` over its key. Grouping by
/// the key and resolving it once per group in an outer select keeps the
/// dictionary out of the aggregation.
pub fn rewrite_clickhouse_lookups(ast: &mut Ast<'_>) -> Result<()> {
    if ast.dialect() != Dialect::ClickHouse {
        return Ok(());
    }
    let Ast {
        root,
        ctes,
        builder,
    } = ast;
    let dialect = builder.dialect;
    let mv = builder.metrics_view;
    let qry = builder.query;

    walk_tree(root, ctes, &mut |n| {
        if !n.group || !n.is_table() {
            return Ok(());
        }

        let mut lookups: Vec<(String, LookupMeta)> = Vec::new();
        for f in &mut n.dim_fields {
            let computed = qry
                .dimensions
                .iter()
                .any(|d| d.name == f.name && d.compute.is_some());
            if computed {
                continue;
            }
            let Some(dim) = mv.dimension(&f.name) else {
                continue;
            };
            let Some(lookup) = dim.lookup() else {
                continue;
            };
            let key = if dim.expression.is_empty() {
                dialect.escape_identifier(&dim.column)
            } else {
                dim.expression.clone()
            };
            // Already grouped by key.
            if f.expr == key {
                continue;
            }
            f.expr = key;
            lookups.push((f.name.clone(), lookup));
        }
        if lookups.is_empty() {
            return Ok(());
        }

        let inner_alias = builder.generate_identifier();
        builder.wrap_select(n, inner_alias.clone());
        n.group = true;
        for f in &mut n.dim_fields {
            if let Some((_, lookup)) = lookups.iter().find(|(name, _)| *name == f.name) {
                f.expr = dialect
                    .lookup_expr(lookup, &builder.member(&inner_alias, &f.name))
                    .with_context(|| format!("failed to resolve lookup of {:?}", f.name))?;
            }
        }
        for f in &mut n.measure_fields {
            f.expr = builder.any_in_group(&f.expr);
        }
        move_paging_out(n);

        debug!(alias = %n.alias, lookups = lookups.len(), "grouped clickhouse lookups by key");
        Ok(())
    })
}

/// Keep time floors from shadowing their own column.
///
/// ClickHouse resolves select aliases in WHERE, so `toStartOfDay(ts) AS ts`
/// would make the time range filter compare truncated values. The floor is
/// computed under a temporary name and renamed in an outer select.
pub fn wrap_clickhouse_computed_time_dims(ast: &mut Ast<'_>) -> Result<()> {
    if ast.dialect() != Dialect::ClickHouse {
        return Ok(());
    }
    let Ast {
        root,
        ctes,
        builder,
    } = ast;
    let dialect = builder.dialect;
    let shadowing: Vec<&str> = builder
        .query
        .dimensions
        .iter()
        .filter_map(|d| match &d.compute {
            Some(DimensionCompute::TimeFloor { dimension, .. }) if *dimension == d.name => {
                Some(d.name.as_str())
            }
            _ => None,
        })
        .collect();
    if shadowing.is_empty() {
        return Ok(());
    }

    walk_tree(root, ctes, &mut |n| {
        if !n.is_table() || !shadowing.iter().any(|name| n.has_dimension(name)) {
            return Ok(());
        }

        let inner_alias = builder.generate_identifier();
        builder.wrap_select(n, inner_alias.clone());
        let Some(inner) = n.inner_mut() else {
            return Ok(());
        };
        for f in inner.dim_fields.iter_mut() {
            if shadowing.contains(&f.name.as_str()) {
                f.name = computed_name(&f.name);
            }
        }
        for f in n.dim_fields.iter_mut() {
            if shadowing.contains(&f.name.as_str()) {
                f.expr = dialect.escape_member(&inner_alias, &computed_name(&f.name));
            }
        }
        move_paging_out(n);

        debug!(alias = %n.alias, "wrapped clickhouse computed time dimensions");
        Ok(())
    })
}

fn computed_name(name: &str) -> String {
    format!("{}_computed", name)
}

/// After a wrap, order and page in the outer select only.
fn move_paging_out(n: &mut SelectNode) {
    let FromClause::Select { inner, .. } = &mut n.from else {
        return;
    };
    inner.order_by.clear();
    n.limit = inner.limit.take();
    n.offset = inner.offset.take();
}
