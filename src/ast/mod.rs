//! Abstract SQL tree for metrics view queries.
//!
//! A query compiles to a tree of [`SelectNode`]s rooted at [`Ast::root`].
//! Nodes are built once by [`Ast::new`], mutated in place by the executor's
//! rewrite passes, and rendered once by [`Ast::sql`].
//!
//! # Shape
//!
//! ```text
//! root: SELECT ... FROM (inner) t1 [FULL OUTER JOIN (comparison) comparison ON ...]
//!                        └── inner: SELECT ... FROM "table" WHERE ... GROUP BY 1,2
//! ```
//!
//! - [`builder`] - resolves dimensions, spines, having, order and limits
//! - [`measures`] - materializes simple, derived and comparison measures
//! - [`expr`] - compiles filter expressions to SQL
//! - [`sql`] - renders the tree

mod builder;
pub mod expr;
mod measures;
mod sql;

pub use builder::DEFAULT_TIME_SPINE_MAX_BINS;
pub use expr::{in_values, Scope};

use std::cell::Cell;

use crate::model::{MetricsViewSpec, Query, Security, Value};
use crate::sql::{Dialect, SqlDialect};

/// A compiled query: the root select plus CTEs promoted by rewrite passes.
#[derive(Debug)]
pub struct Ast<'a> {
    pub root: SelectNode,
    /// Rendered as `WITH alias AS (...)`, in order.
    pub ctes: Vec<SelectNode>,
    pub(crate) builder: Builder<'a>,
}

/// One SELECT in the tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectNode {
    pub alias: String,
    /// Stub standing in for a node moved to [`Ast::ctes`]. Rendered as its alias.
    pub is_cte: bool,
    pub dim_fields: Vec<FieldNode>,
    pub measure_fields: Vec<FieldNode>,
    pub from: FromClause,
    pub group: bool,
    pub where_clause: Option<ExprNode>,
    pub time_where: Option<ExprNode>,
    pub having: Option<ExprNode>,
    pub order_by: Vec<OrderField>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FromClause {
    /// The underlying table, plus lateral unnest clauses.
    Table { expr: String, unnests: Vec<String> },
    /// A nested select, optionally joined with further selects.
    Select { inner: Box<SelectNode>, join: Join },
    /// Literal rows produced by a dialect's inline results select.
    Inline {
        sql: String,
        args: Vec<Value>,
        alias: String,
    },
}

impl Default for FromClause {
    fn default() -> Self {
        FromClause::Table {
            expr: String::new(),
            unnests: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Join {
    #[default]
    None,
    /// Right join against a select of every dimension value to emit.
    Spine(Box<SelectNode>),
    LeftJoins(Vec<SelectNode>),
    /// The comparison time range, joined on every dimension.
    Comparison {
        node: Box<SelectNode>,
        join_type: JoinType,
    },
    Cross(Vec<SelectNode>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Full,
    Left,
    Right,
}

impl JoinType {
    pub fn sql(self) -> &'static str {
        match self {
            JoinType::Full => "FULL OUTER",
            JoinType::Left => "LEFT OUTER",
            JoinType::Right => "RIGHT OUTER",
        }
    }
}

/// A projected column.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldNode {
    pub name: String,
    pub display_name: String,
    pub expr: String,
    /// The dialect unnests `expr` inline (e.g. `arrayJoin`).
    pub auto_unnest: bool,
    /// SQL literal substituted for NULL when the node joins.
    pub treat_null_as: Option<String>,
}

/// A SQL fragment with its positional args.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExprNode {
    pub expr: String,
    pub args: Vec<Value>,
}

impl ExprNode {
    pub fn new(expr: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            expr: expr.into(),
            args,
        }
    }

    /// AND `expr` onto an optional existing clause. Empty expressions are skipped.
    pub fn and(existing: Option<ExprNode>, expr: String, args: Vec<Value>) -> Option<ExprNode> {
        if expr.is_empty() {
            return existing;
        }
        match existing {
            None => Some(ExprNode { expr, args }),
            Some(mut e) => {
                e.expr = format!("({}) AND ({})", e.expr, expr);
                e.args.extend(args);
                Some(e)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderField {
    pub name: String,
    pub desc: bool,
}

impl SelectNode {
    /// Whether `name` is projected as a dimension or measure.
    pub fn has_name(&self, name: &str) -> bool {
        self.has_dimension(name) || self.has_measure(name)
    }

    pub fn has_dimension(&self, name: &str) -> bool {
        self.dim_fields.iter().any(|f| f.name == name)
    }

    pub fn has_measure(&self, name: &str) -> bool {
        self.measure_fields.iter().any(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldNode> {
        self.dim_fields
            .iter()
            .chain(self.measure_fields.iter())
            .find(|f| f.name == name)
    }

    /// Whether the node selects raw rows (`SELECT *`).
    pub fn is_raw(&self) -> bool {
        self.dim_fields.is_empty() && self.measure_fields.is_empty()
    }

    pub fn inner(&self) -> Option<&SelectNode> {
        match &self.from {
            FromClause::Select { inner, .. } => Some(inner),
            _ => None,
        }
    }

    pub fn inner_mut(&mut self) -> Option<&mut SelectNode> {
        match &mut self.from {
            FromClause::Select { inner, .. } => Some(inner),
            _ => None,
        }
    }

    pub fn join(&self) -> Option<&Join> {
        match &self.from {
            FromClause::Select { join, .. } => Some(join),
            _ => None,
        }
    }

    pub fn has_join(&self) -> bool {
        !matches!(self.join(), None | Some(Join::None))
    }

    /// The comparison side and join type, if the node joins one.
    pub fn comparison(&self) -> Option<(&SelectNode, JoinType)> {
        match self.join() {
            Some(Join::Comparison { node, join_type }) => Some((node, *join_type)),
            _ => None,
        }
    }

    pub fn is_table(&self) -> bool {
        matches!(self.from, FromClause::Table { .. })
    }
}

/// Compilation context shared by the builder, the expression compiler and
/// rewrite passes. Kept apart from the tree so nodes can be borrowed mutably
/// while it is borrowed immutably.
#[derive(Debug)]
pub(crate) struct Builder<'a> {
    pub(crate) metrics_view: &'a MetricsViewSpec,
    pub(crate) security: &'a dyn Security,
    pub(crate) query: &'a Query,
    pub(crate) dialect: Dialect,
    /// Resolved query dimensions against the underlying table.
    pub(crate) dim_fields: Vec<FieldNode>,
    /// Same, shifted onto the base time range for comparison joins.
    pub(crate) comparison_dim_fields: Vec<FieldNode>,
    pub(crate) unnests: Vec<String>,
    pub(crate) underlying_table: String,
    pub(crate) underlying_where: Option<ExprNode>,
    pub(crate) time_spine_max_bins: usize,
    next_identifier: Cell<usize>,
}

impl Builder<'_> {
    /// A table alias unique within this compilation: `t0`, `t1`, ...
    pub(crate) fn generate_identifier(&self) -> String {
        let n = self.next_identifier.get();
        self.next_identifier.set(n + 1);
        format!("t{}", n)
    }

    pub(crate) fn member(&self, tbl: &str, name: &str) -> String {
        self.dialect.escape_member(tbl, name)
    }

    pub(crate) fn any_in_group(&self, expr: &str) -> String {
        self.dialect.any_value_expression(expr)
    }

    /// Replace `n` with `SELECT <n's fields> FROM (<n>) inner_alias`.
    ///
    /// The outer select keeps `n`'s alias and ORDER BY; everything else moves
    /// to the inner select.
    pub(crate) fn wrap_select(&self, n: &mut SelectNode, inner_alias: String) {
        let alias = std::mem::take(&mut n.alias);
        let mut inner = std::mem::take(n);
        inner.alias = inner_alias;

        n.alias = alias;
        n.dim_fields = inner
            .dim_fields
            .iter()
            .map(|f| FieldNode {
                name: f.name.clone(),
                display_name: f.display_name.clone(),
                expr: self.member(&inner.alias, &f.name),
                auto_unnest: false,
                treat_null_as: None,
            })
            .collect();
        n.measure_fields = inner
            .measure_fields
            .iter()
            .map(|f| FieldNode {
                name: f.name.clone(),
                display_name: f.display_name.clone(),
                expr: self.member(&inner.alias, &f.name),
                auto_unnest: false,
                treat_null_as: f.treat_null_as.clone(),
            })
            .collect();
        n.order_by = inner.order_by.clone();
        n.from = FromClause::Select {
            inner: Box::new(inner),
            join: Join::None,
        };
    }
}

impl<'a> Ast<'a> {
    pub fn dialect(&self) -> Dialect {
        self.builder.dialect
    }

    pub fn query(&self) -> &'a Query {
        self.builder.query
    }

    pub fn metrics_view(&self) -> &'a MetricsViewSpec {
        self.builder.metrics_view
    }

    pub fn generate_identifier(&self) -> String {
        self.builder.generate_identifier()
    }

    /// Move the node in `slot` to the CTE list, leaving a stub that renders
    /// as its alias. No-op for nodes that already are CTE stubs.
    pub fn convert_to_cte(ctes: &mut Vec<SelectNode>, slot: &mut SelectNode) {
        if slot.is_cte {
            return;
        }
        let stub = SelectNode {
            alias: slot.alias.clone(),
            is_cte: true,
            dim_fields: slot.dim_fields.clone(),
            measure_fields: slot.measure_fields.clone(),
            ..Default::default()
        };
        let node = std::mem::replace(slot, stub);
        ctes.push(node);
    }
}
