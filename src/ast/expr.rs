//! Compiles filter expressions (`where`, `having`, spines, security
//! filters) to SQL with positional args.
//!
//! Every compiled condition is wrapped in parentheses, so the output can be
//! combined with other clauses without precedence surprises.

use super::{Ast, Builder, ExprNode, SelectNode};
use crate::error::{Error, Result, ResultExt};
use crate::model::{
    Condition, Expression, LookupMeta, Operator, Query, Security, SkipSecurity, Subquery, Value,
};
use crate::sql::{SqlDialect, Unnest};

/// What names in an expression resolve against.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'n> {
    /// The underlying table: query dimensions first, then any view dimension.
    Table,
    /// The fields projected by a select node. Measures resolve only in
    /// pseudo-HAVING mode.
    Node(&'n SelectNode),
}

impl<'a> Ast<'a> {
    /// Compile `e` against `scope`. `visible` enforces field access rules.
    pub fn compile_expression(
        &self,
        e: &Expression,
        scope: Scope<'_>,
        pseudo_having: bool,
        visible: bool,
    ) -> Result<ExprNode> {
        let (expr, args) = ExprCompiler::compile(&self.builder, e, scope, pseudo_having, visible)?;
        Ok(ExprNode { expr, args })
    }
}

/// A resolved name.
struct ResolvedName {
    expr: String,
    unnest: bool,
    lookup: Option<(LookupMeta, String)>,
}

pub(crate) struct ExprCompiler<'c> {
    builder: &'c Builder<'c>,
    scope: Scope<'c>,
    pseudo_having: bool,
    visible: bool,
    out: String,
    args: Vec<Value>,
}

impl<'c> ExprCompiler<'c> {
    pub(crate) fn compile(
        builder: &'c Builder<'c>,
        e: &Expression,
        scope: Scope<'c>,
        pseudo_having: bool,
        visible: bool,
    ) -> Result<(String, Vec<Value>)> {
        let mut c = ExprCompiler {
            builder,
            scope,
            pseudo_having,
            visible,
            out: String::new(),
            args: Vec::new(),
        };
        c.write_expression(e)?;
        Ok((c.out, c.args))
    }

    /// Compile `e` on its own so it can be written more than once.
    fn fragment(&self, e: &Expression) -> Result<ExprNode> {
        let (expr, args) =
            Self::compile(self.builder, e, self.scope, self.pseudo_having, self.visible)?;
        Ok(ExprNode { expr, args })
    }

    fn write_expression(&mut self, e: &Expression) -> Result<()> {
        match e {
            Expression::Name(name) => self.write_name(name),
            Expression::Value(v) => {
                self.write_value(v);
                Ok(())
            }
            Expression::Subquery(sub) => self.write_subquery(sub),
            Expression::Condition(cond) => self.write_condition(cond),
        }
    }

    fn write_name(&mut self, name: &str) -> Result<()> {
        let r = self.resolve_name(name)?;
        if r.unnest {
            return Err(Error::validation(format!(
                "cannot apply expression to dimension {:?} because it requires unnesting, which is not supported for expressions of this structure",
                name
            )));
        }
        self.write_parenthesized(&r.expr);
        Ok(())
    }

    fn write_value(&mut self, v: &Value) {
        self.out.push('?');
        self.args.push(v.clone());
    }

    fn write_subquery(&mut self, sub: &Subquery) -> Result<()> {
        let outer = self.builder.query;
        let inner = Query {
            metrics_view: outer.metrics_view.clone(),
            dimensions: vec![sub.dimension.clone()],
            measures: sub.measures.clone(),
            time_range: outer.time_range.clone(),
            comparison_time_range: outer.comparison_time_range.clone(),
            where_clause: sub.where_clause.clone(),
            having: sub.having.clone(),
            time_zone: outer.time_zone.clone(),
            ..Default::default()
        };

        let security: &dyn Security = if self.visible {
            self.builder.security
        } else {
            &SkipSecurity
        };
        let ast = Ast::with_time_spine_max_bins(
            self.builder.metrics_view,
            security,
            &inner,
            self.builder.dialect,
            self.builder.time_spine_max_bins,
        )
        .context("failed to create AST for subquery")?;
        let (sql, args) = ast.sql().context("failed to generate SQL for subquery")?;

        self.out.push_str("(SELECT ");
        self.out
            .push_str(&self.builder.dialect.escape_identifier(&sub.dimension.name));
        self.out.push_str(" FROM (");
        self.out.push_str(&sql);
        self.out.push_str("))");
        self.args.extend(args);
        Ok(())
    }

    fn write_condition(&mut self, cond: &Condition) -> Result<()> {
        match cond.op {
            Operator::Or => self.write_joined(&cond.exprs, " OR "),
            Operator::And => self.write_joined(&cond.exprs, " AND "),
            op => self.write_binary_condition(&cond.exprs, op),
        }
    }

    fn write_joined(&mut self, exprs: &[Expression], joiner: &str) -> Result<()> {
        if exprs.is_empty() {
            return Ok(());
        }
        self.out.push('(');
        for (i, e) in exprs.iter().enumerate() {
            if i > 0 {
                self.out.push_str(joiner);
            }
            self.write_expression(e)?;
        }
        self.out.push(')');
        Ok(())
    }

    fn write_binary_condition(&mut self, exprs: &[Expression], op: Operator) -> Result<()> {
        let normalized;
        let exprs = if matches!(op, Operator::In | Operator::Nin) {
            normalized = normalize_in_operands(exprs)?;
            normalized.as_slice()
        } else {
            exprs
        };

        let [left, right] = exprs else {
            return Err(Error::validation(
                "binary condition must have exactly 2 expressions",
            ));
        };

        if let Expression::Name(name) = right {
            if self.resolve_name(name)?.unnest {
                return Err(Error::validation(format!(
                    "cannot apply expression to dimension {:?} because it requires unnesting, which is only supported for the left side of an operation",
                    name
                )));
            }
        }

        let Expression::Name(left_name) = left else {
            let left = self.fragment(left)?;
            return self.write_binary_condition_inner(&left, right, op);
        };

        let r = self.resolve_name(left_name)?;
        if !r.unnest {
            if let Some((lookup, key)) = &r.lookup {
                // Filter on the dictionary's values, then match the keys.
                let select = self.builder.dialect.lookup_select_expr(lookup)?;
                self.out.push_str(key);
                self.out.push_str(" IN (");
                self.out.push_str(&select);
                self.out.push_str(" WHERE ");
                let value_col = ExprNode::new(
                    parenthesized(&self.builder.dialect.escape_identifier(&lookup.value_column)),
                    Vec::new(),
                );
                self.write_binary_condition_inner(&value_col, right, op)?;
                self.out.push(')');
                return Ok(());
            }
            return self.write_binary_condition_inner(
                &ExprNode::new(parenthesized(&r.expr), Vec::new()),
                right,
                op,
            );
        }

        let alias = self.builder.generate_identifier();
        let unnest = self
            .builder
            .dialect
            .lateral_unnest(&r.expr, &alias, left_name)?;
        let (from, column) = match unnest {
            Unnest::Auto => {
                return self.write_binary_condition_inner(
                    &ExprNode::new(parenthesized(&r.expr), Vec::new()),
                    right,
                    op,
                );
            }
            Unnest::Lateral { from, column } => (from, column),
        };

        // NOT moves outside the EXISTS so it applies to the whole array.
        let (op, not) = match op.positive() {
            Some(p) => (p, true),
            None => (op, false),
        };

        if not {
            self.out.push_str("NOT ");
        }
        self.out.push_str("EXISTS (SELECT 1 FROM ");
        self.out.push_str(&from);
        self.out.push_str(" WHERE ");
        self.write_binary_condition_inner(
            &ExprNode::new(parenthesized(&column), Vec::new()),
            right,
            op,
        )?;
        self.out.push(')');
        Ok(())
    }

    fn write_binary_condition_inner(
        &mut self,
        left: &ExprNode,
        right: &Expression,
        op: Operator,
    ) -> Result<()> {
        match op {
            Operator::Eq
            | Operator::Neq
            | Operator::Lt
            | Operator::Lte
            | Operator::Gt
            | Operator::Gte => {}
            Operator::Ilike => return self.write_ilike(left, right, false),
            Operator::Nilike => return self.write_ilike(left, right, true),
            Operator::In => return self.write_in(left, right, false),
            Operator::Nin => return self.write_in(left, right, true),
            Operator::And | Operator::Or => {
                return Err(Error::validation(format!(
                    "invalid binary condition operator {:?}",
                    op.sql()
                )));
            }
        }

        self.out.push('(');
        self.write_fragment(left);

        if matches!(right, Expression::Value(Value::Null)) {
            match op {
                Operator::Eq => {
                    self.out.push_str(" IS NULL)");
                    return Ok(());
                }
                Operator::Neq => {
                    self.out.push_str(" IS NOT NULL)");
                    return Ok(());
                }
                _ => {}
            }
        }

        self.out.push(' ');
        self.out.push_str(op.sql());
        self.out.push(' ');
        self.write_expression(right)?;
        self.out.push(')');
        Ok(())
    }

    fn write_ilike(&mut self, left: &ExprNode, right: &Expression, not: bool) -> Result<()> {
        let dialect = self.builder.dialect;
        let cast = if dialect.requires_cast_for_like() {
            "::TEXT"
        } else {
            ""
        };

        self.out.push('(');
        if dialect.supports_ilike() {
            self.write_fragment(left);
            self.out.push_str(cast);
            self.out.push_str(if not { " NOT ILIKE " } else { " ILIKE " });
            self.write_expression(right)?;
            self.out.push_str(cast);
        } else if dialect.supports_regex_match() {
            let pattern = like_to_regex(right)?;
            if not {
                self.out.push_str(" NOT ");
            }
            self.out.push_str(dialect.regex_match_function());
            self.out.push('(');
            self.write_fragment(left);
            self.out.push_str(", ");
            self.write_value(&pattern);
            self.out.push(')');
        } else {
            self.out.push_str("LOWER(");
            self.write_fragment(left);
            self.out.push_str(cast);
            self.out.push(')');
            self.out.push_str(if not { " NOT LIKE " } else { " LIKE " });
            self.out.push_str("LOWER(");
            self.write_expression(right)?;
            self.out.push_str(cast);
            self.out.push(')');
        }

        // NOT ILIKE never matches NULL.
        if not {
            self.out.push_str(" OR ");
            self.write_fragment(left);
            self.out.push_str(" IS NULL");
        }
        self.out.push(')');
        Ok(())
    }

    fn write_in(&mut self, left: &ExprNode, right: &Expression, not: bool) -> Result<()> {
        if let Expression::Value(v) = right {
            let vals = v.as_list().ok_or_else(|| {
                Error::validation("the right value must be a list of values for an IN condition")
            })?;
            let node = in_values(left, vals, not);
            self.write_fragment(&node);
            return Ok(());
        }

        self.out.push('(');
        self.write_fragment(left);
        self.out.push_str(if not { " NOT IN " } else { " IN " });
        self.write_expression(right)?;
        self.out.push(')');
        Ok(())
    }

    fn write_fragment(&mut self, f: &ExprNode) {
        self.out.push_str(&f.expr);
        self.args.extend(f.args.iter().cloned());
    }

    fn write_parenthesized(&mut self, s: &str) {
        self.out.push('(');
        self.out.push_str(s);
        self.out.push(')');
    }

    fn resolve_name(&self, name: &str) -> Result<ResolvedName> {
        let plain = |expr: &str| ResolvedName {
            expr: expr.to_string(),
            unnest: false,
            lookup: None,
        };

        let node = match self.scope {
            Scope::Node(node) => node,
            Scope::Table => {
                // Query dimensions are already unnested in the base select.
                if let Some(f) = self.builder.dim_fields.iter().find(|f| f.name == name) {
                    return Ok(plain(&f.expr));
                }
                return self
                    .resolve_view_dimension(name)
                    .with_context(|| format!("invalid dimension reference {:?}", name));
            }
        };

        if let Some(f) = node.dim_fields.iter().find(|f| f.name == name) {
            return Ok(plain(&f.expr));
        }

        // Measures are only addressable in a pseudo-HAVING (a WHERE on a wrapping select).
        if !self.pseudo_having {
            return Err(Error::validation(format!(
                "name {:?} in expression is not a dimension available in the current context",
                name
            )));
        }

        if let Some(f) = node.measure_fields.iter().find(|f| f.name == name) {
            return Ok(plain(&f.expr));
        }

        Err(Error::validation(format!(
            "name {:?} in expression is not a dimension or measure available in the current context",
            name
        )))
    }

    fn resolve_view_dimension(&self, name: &str) -> Result<ResolvedName> {
        let dim = self.builder.lookup_dimension(name, self.visible)?;
        let expr = self.builder.dialect.metrics_view_dimension_expression(&dim)?;

        let Some(lookup) = dim.lookup() else {
            return Ok(ResolvedName {
                expr,
                unnest: dim.unnest,
                lookup: None,
            });
        };

        if dim.unnest {
            return Err(Error::validation(format!(
                "dimension {:?} is unnested and also has a lookup. This is not supported",
                name
            )));
        }

        let key = if !dim.column.is_empty() {
            self.builder.dialect.escape_identifier(&dim.column)
        } else if !dim.expression.is_empty() {
            dim.expression.clone()
        } else {
            return Err(Error::validation(format!(
                "dimension {:?} has a lookup table but no column or expression defined",
                name
            )));
        };

        Ok(ResolvedName {
            expr,
            unnest: false,
            lookup: Some((lookup, key)),
        })
    }
}

/// `left IN (?, ?)` over a literal list, with NULL members compared via
/// `IS NULL`. `NOT IN` keeps NULL rows unless the list itself holds NULL.
pub fn in_values(left: &ExprNode, vals: &[Value], not: bool) -> ExprNode {
    if vals.is_empty() {
        return ExprNode::new(if not { "TRUE" } else { "FALSE" }, Vec::new());
    }

    let has_null = vals.iter().any(Value::is_null);
    let non_null: Vec<&Value> = vals.iter().filter(|v| !v.is_null()).collect();

    let mut out = String::from("(");
    let mut args = Vec::new();
    let push_left = |out: &mut String, args: &mut Vec<Value>| {
        out.push_str(&left.expr);
        args.extend(left.args.iter().cloned());
    };

    if !non_null.is_empty() {
        push_left(&mut out, &mut args);
        out.push_str(if not { " NOT IN (" } else { " IN (" });
        for (i, v) in non_null.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push('?');
            args.push((*v).clone());
        }
        out.push(')');
    }

    if has_null {
        if !non_null.is_empty() {
            out.push_str(if not { " AND " } else { " OR " });
        }
        push_left(&mut out, &mut args);
        out.push_str(if not { " IS NOT NULL" } else { " IS NULL" });
    }

    if not && !has_null {
        out.push_str(" OR ");
        push_left(&mut out, &mut args);
        out.push_str(" IS NULL");
    }

    out.push(')');
    ExprNode::new(out, args)
}

/// Accept a flattened right-hand side (`IN a, b, c`) or a scalar in place of a list.
fn normalize_in_operands(exprs: &[Expression]) -> Result<Vec<Expression>> {
    match exprs {
        [left, Expression::Value(v)] if v.as_list().is_none() => Ok(vec![
            left.clone(),
            Expression::Value(Value::List(vec![v.clone()])),
        ]),
        [left, rest @ ..] if rest.len() > 1 => {
            let vals = rest
                .iter()
                .map(|e| match e {
                    Expression::Value(v) => Ok(v.clone()),
                    _ => Err(Error::validation(
                        "the right side of an IN condition must be a list of values",
                    )),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(vec![left.clone(), Expression::Value(Value::List(vals))])
        }
        _ => Ok(exprs.to_vec()),
    }
}

/// `%foo%` becomes the case-insensitive regex `^(?i).*foo.*$`.
fn like_to_regex(pattern: &Expression) -> Result<Value> {
    match pattern {
        Expression::Value(Value::String(s)) => {
            Ok(Value::String(format!("^(?i){}$", s.replace('%', ".*"))))
        }
        _ => Err(Error::validation(
            "the pattern expression for regex match function must be a string value",
        )),
    }
}

fn parenthesized(s: &str) -> String {
    format!("({})", s)
}
