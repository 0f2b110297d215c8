//! Limit pushdown.

use tracing::debug;

use crate::ast::{Ast, FromClause, Join, JoinType, SelectNode};

/// Push the root's ORDER BY and LIMIT into the child that drives its rows.
///
/// The driving child is the inner select for plain wraps and left joins,
/// and the sorted side of a one-sided comparison join. The child gets
/// `limit + offset` rows; the root keeps its own LIMIT and OFFSET.
/// Skipped unless every sort field is projected by the child, and when the
/// root filters, groups, or the child already has an order or limit.
pub fn rewrite_limits_into_subqueries(ast: &mut Ast<'_>) {
    let root = &mut ast.root;
    let Some(limit) = root.limit else {
        return;
    };
    if root.order_by.is_empty() || root.group || root.where_clause.is_some() {
        return;
    }

    let pushed = limit + root.offset.unwrap_or(0);
    let order_by = root.order_by.clone();
    let Some(child) = driving_child(root) else {
        return;
    };
    if !child.order_by.is_empty() || child.limit.is_some() || child.is_cte {
        return;
    }
    if !order_by.iter().all(|o| child.has_name(&o.name)) {
        return;
    }

    debug!(alias = %child.alias, limit = pushed, "pushed limit into subquery");
    child.order_by = order_by;
    child.limit = Some(pushed);
}

fn driving_child(n: &mut SelectNode) -> Option<&mut SelectNode> {
    let FromClause::Select { inner, join } = &mut n.from else {
        return None;
    };
    match join {
        Join::None | Join::LeftJoins(_) => Some(&mut **inner),
        Join::Comparison {
            join_type: JoinType::Left,
            ..
        } => Some(&mut **inner),
        Join::Comparison {
            node,
            join_type: JoinType::Right,
        } => Some(&mut **node),
        Join::Comparison { .. } | Join::Spine(_) | Join::Cross(_) => None,
    }
}
