//! Renders the select tree to SQL.

use super::{Ast, ExprNode, FieldNode, FromClause, Join, SelectNode};
use crate::error::{Error, Result};
use crate::model::Value;
use crate::sql::{Dialect, SqlDialect};

impl Ast<'_> {
    /// Render the tree to SQL and its positional args, in text order.
    pub fn sql(&self) -> Result<(String, Vec<Value>)> {
        let mut w = SqlWriter {
            dialect: self.dialect(),
            use_display_names: self.query().use_display_names,
            out: String::new(),
            args: Vec::new(),
        };

        if !self.ctes.is_empty() {
            w.out.push_str("WITH ");
            for (i, cte) in self.ctes.iter().enumerate() {
                if i > 0 {
                    w.out.push_str(", ");
                }
                w.out.push_str(&cte.alias);
                w.out.push_str(" AS (");
                w.write_select(cte, false)?;
                w.out.push(')');
            }
            w.out.push(' ');
        }

        w.write_select(&self.root, true)?;
        Ok((w.out, w.args))
    }

    /// Render `n` as a standalone select, without CTEs or display names.
    pub fn select_sql(&self, n: &SelectNode) -> Result<(String, Vec<Value>)> {
        let mut w = SqlWriter {
            dialect: self.dialect(),
            use_display_names: false,
            out: String::new(),
            args: Vec::new(),
        };
        w.write_select(n, false)?;
        Ok((w.out, w.args))
    }
}

struct SqlWriter {
    dialect: Dialect,
    use_display_names: bool,
    out: String,
    args: Vec<Value>,
}

impl SqlWriter {
    fn write_select(&mut self, n: &SelectNode, root: bool) -> Result<()> {
        if n.is_cte {
            return Err(Error::validation(format!(
                "cannot render CTE reference {:?} as a select",
                n.alias
            )));
        }

        self.out.push_str("SELECT ");
        if n.is_raw() {
            self.out.push('*');
        } else {
            let joined = n.has_join();
            let fields = n
                .dim_fields
                .iter()
                .map(|f| (f, false))
                .chain(n.measure_fields.iter().map(|f| (f, joined)));
            for (i, (f, coalesce)) in fields.enumerate() {
                if i > 0 {
                    self.out.push_str(", ");
                }
                self.write_field(f, root, coalesce);
            }
        }

        self.out.push_str(" FROM ");
        self.write_from(n)?;

        let clauses: Vec<&ExprNode> = [n.time_where.as_ref(), n.where_clause.as_ref()]
            .into_iter()
            .flatten()
            .filter(|e| !e.expr.is_empty())
            .collect();
        if !clauses.is_empty() {
            self.out.push_str(" WHERE ");
            for (i, e) in clauses.into_iter().enumerate() {
                if i > 0 {
                    self.out.push_str(" AND ");
                }
                if is_enclosed(&e.expr) {
                    self.write_expr(e);
                } else {
                    self.out.push('(');
                    self.write_expr(e);
                    self.out.push(')');
                }
            }
        }

        if n.group && !n.dim_fields.is_empty() {
            let positions: Vec<String> = (1..=n.dim_fields.len()).map(|i| i.to_string()).collect();
            self.out.push_str(" GROUP BY ");
            self.out.push_str(&positions.join(","));
        }

        if let Some(having) = &n.having {
            self.out.push_str(" HAVING ");
            self.write_expr(having);
        }

        if !n.order_by.is_empty() {
            let items: Vec<String> = n
                .order_by
                .iter()
                .map(|o| {
                    let name = if root {
                        self.output_name(n.field(&o.name), &o.name)
                    } else {
                        &o.name
                    };
                    self.dialect.order_by_expression(name, o.desc)
                })
                .collect();
            self.out.push_str(" ORDER BY ");
            self.out.push_str(&items.join(", "));
        }

        if let Some(limit) = n.limit {
            self.out.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = n.offset {
            self.out.push_str(&format!(" OFFSET {}", offset));
        }

        Ok(())
    }

    fn write_field(&mut self, f: &FieldNode, root: bool, coalesce: bool) {
        let expr = match &f.treat_null_as {
            Some(v) if coalesce => format!("COALESCE({}, {})", f.expr, v),
            _ => f.expr.clone(),
        };
        let name = if root {
            self.output_name(Some(f), &f.name).to_string()
        } else {
            f.name.clone()
        };
        self.out.push('(');
        self.out.push_str(&expr);
        self.out.push_str(") AS ");
        self.out.push_str(&self.dialect.escape_identifier(&name));
    }

    /// Column name in the result set.
    fn output_name<'f>(&self, f: Option<&'f FieldNode>, name: &'f str) -> &'f str {
        match f {
            Some(f) if self.use_display_names && !f.display_name.is_empty() => &f.display_name,
            _ => name,
        }
    }

    fn write_from(&mut self, n: &SelectNode) -> Result<()> {
        match &n.from {
            FromClause::Table { expr, unnests } => {
                if expr.is_empty() {
                    return Err(Error::validation("select has no table"));
                }
                self.out.push_str(expr);
                for u in unnests {
                    self.out.push_str(", ");
                    self.out.push_str(u);
                }
            }
            FromClause::Inline { sql, args, alias } => {
                self.out.push('(');
                self.out.push_str(sql);
                self.out.push_str(") ");
                self.out.push_str(alias);
                self.args.extend(args.iter().cloned());
            }
            FromClause::Select { inner, join } => {
                self.write_subselect(inner)?;
                match join {
                    Join::None => {}
                    Join::Spine(spine) => {
                        self.out.push_str(" RIGHT OUTER JOIN ");
                        self.write_subselect(spine)?;
                        self.write_join_on(inner, spine);
                    }
                    Join::LeftJoins(nodes) => {
                        for j in nodes {
                            self.out.push_str(" LEFT OUTER JOIN ");
                            self.write_subselect(j)?;
                            self.write_join_on(inner, j);
                        }
                    }
                    Join::Comparison { node, join_type } => {
                        self.out.push(' ');
                        self.out.push_str(join_type.sql());
                        self.out.push_str(" JOIN ");
                        self.write_subselect(node)?;
                        self.write_join_on(inner, node);
                    }
                    Join::Cross(nodes) => {
                        for j in nodes {
                            self.out.push_str(" CROSS JOIN ");
                            self.write_subselect(j)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// `(<select>) alias`, or just the alias for a CTE reference.
    fn write_subselect(&mut self, n: &SelectNode) -> Result<()> {
        if n.is_cte {
            self.out.push_str(&n.alias);
            return Ok(());
        }
        self.out.push('(');
        self.write_select(n, false)?;
        self.out.push_str(") ");
        self.out.push_str(&n.alias);
        Ok(())
    }

    /// Null-safe equality on every dimension of the left side.
    fn write_join_on(&mut self, left: &SelectNode, right: &SelectNode) {
        self.out.push_str(" ON ");
        if left.dim_fields.is_empty() {
            self.out.push_str("TRUE");
            return;
        }
        let conds: Vec<String> = left
            .dim_fields
            .iter()
            .map(|f| {
                self.dialect.join_on_expression(
                    &self.dialect.escape_member(&left.alias, &f.name),
                    &self.dialect.escape_member(&right.alias, &f.name),
                )
            })
            .collect();
        self.out.push_str(&conds.join(" AND "));
    }

    fn write_expr(&mut self, e: &ExprNode) {
        self.out.push_str(&e.expr);
        self.args.extend(e.args.iter().cloned());
    }
}

/// Whether one pair of parentheses wraps `expr` from end to end.
fn is_enclosed(expr: &str) -> bool {
    if !expr.starts_with('(') || !expr.ends_with(')') {
        return false;
    }
    let mut depth = 0usize;
    let mut quote = None;
    for (i, c) in expr.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
                if depth == 0 {
                    return i == expr.len() - 1;
                }
            }
            _ => {}
        }
    }
    false
}
