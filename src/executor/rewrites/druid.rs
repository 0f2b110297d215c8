//! Druid-specific rewrites.

use tracing::debug;

use super::walk_tree;
use crate::ast::Ast;
use crate::error::Result;
use crate::executor::{Executor, Statement};
use crate::model::{Expression, Query};
use crate::sql::{Dialect, SqlDialect};

impl Executor {
    /// Pin the dimension values of a small TopN query.
    ///
    /// Druid answers single-dimension sorted queries with an approximate
    /// TopN. A preliminary run fetches the expected values, and the query is
    /// constrained to them so it runs as an exact filtered group-by.
    pub(crate) async fn rewrite_query_druid_exactify(&self, qry: &mut Query) -> Result<()> {
        if self.dialect() != Dialect::Druid || !self.settings.druid.exactify_topn {
            return Ok(());
        }
        let Some(limit) = exactify_limit(qry, self.settings.druid.exactify_topn_limit) else {
            return Ok(());
        };

        let mut preview = qry.clone();
        preview.use_display_names = false;
        let ast = self.new_ast(&preview)?;
        let (sql, args) = ast.sql()?;
        drop(ast);

        let dim = qry.dimensions[0].name.clone();
        let res = self.execute(Statement::new(sql, args)).await?;
        let values = res.column_values(&dim)?;

        debug!(dimension = %dim, values = values.len(), "exactified druid topn");
        if limit >= values.len() as i64 {
            qry.limit = None;
        }
        qry.where_clause =
            Expression::and_opt(qry.where_clause.take(), Some(Expression::in_list(&dim, values)));
        Ok(())
    }
}

/// The limit of a query eligible for exactify: one dimension, one sort, no
/// comparison, and a limit within `max_limit`.
fn exactify_limit(qry: &Query, max_limit: i64) -> Option<i64> {
    if qry.dimensions.len() != 1 || qry.sort.len() != 1 || qry.comparison_time_range.is_some() {
        return None;
    }
    qry.limit.filter(|l| *l <= max_limit)
}

/// Druid can't project ungrouped measures over joins, so every join node is
/// grouped and its measures wrapped in `ANY_VALUE`.
pub fn rewrite_druid_groups(ast: &mut Ast<'_>) -> Result<()> {
    if ast.dialect() != Dialect::Druid {
        return Ok(());
    }
    let dialect = ast.dialect();
    let Ast { root, ctes, .. } = ast;
    walk_tree(root, ctes, &mut |n| {
        if !n.has_join() || n.group || n.dim_fields.is_empty() {
            return Ok(());
        }
        n.group = true;
        for f in &mut n.measure_fields {
            f.expr = dialect.any_value_expression(&f.expr);
        }
        Ok(())
    })
}
