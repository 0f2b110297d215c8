//! The predicate language used by `where`, `having` and spines.
//!
//! An expression is a name, a literal, an operator condition or a subquery.
//! In JSON each variant is an object with a single key:
//!
//! ```json
//! {"cond": {"op": "eq", "exprs": [{"name": "country"}, {"val": "US"}]}}
//! ```

use serde::{Deserialize, Serialize};

use super::query::{Dimension, Measure};
use super::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    #[serde(rename = "name")]
    Name(String),
    #[serde(rename = "val")]
    Value(Value),
    #[serde(rename = "cond")]
    Condition(Condition),
    #[serde(rename = "subquery")]
    Subquery(Box<Subquery>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub op: Operator,
    #[serde(default)]
    pub exprs: Vec<Expression>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Nin,
    Ilike,
    Nilike,
    Or,
    And,
}

impl Operator {
    /// SQL operator for binary comparisons.
    pub fn sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Neq => "!=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::In => "IN",
            Operator::Nin => "NOT IN",
            Operator::Ilike => "ILIKE",
            Operator::Nilike => "NOT ILIKE",
            Operator::Or => "OR",
            Operator::And => "AND",
        }
    }

    /// The positive form of a negated operator, if any.
    pub fn positive(self) -> Option<Operator> {
        match self {
            Operator::Neq => Some(Operator::Eq),
            Operator::Nin => Some(Operator::In),
            Operator::Nilike => Some(Operator::Ilike),
            _ => None,
        }
    }
}

/// A correlated filter: rows whose `dimension` is among the results of an
/// inner query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subquery {
    pub dimension: Dimension,
    #[serde(default)]
    pub measures: Vec<Measure>,
    #[serde(default, rename = "where")]
    pub where_clause: Option<Expression>,
    #[serde(default)]
    pub having: Option<Expression>,
}

impl Expression {
    pub fn name(name: impl Into<String>) -> Self {
        Expression::Name(name.into())
    }

    pub fn value(v: impl Into<Value>) -> Self {
        Expression::Value(v.into())
    }

    pub fn null() -> Self {
        Expression::Value(Value::Null)
    }

    pub fn cond(op: Operator, exprs: Vec<Expression>) -> Self {
        Expression::Condition(Condition { op, exprs })
    }

    pub fn binary(op: Operator, name: &str, v: impl Into<Value>) -> Self {
        Self::cond(op, vec![Self::name(name), Self::value(v)])
    }

    pub fn eq(name: &str, v: impl Into<Value>) -> Self {
        Self::binary(Operator::Eq, name, v)
    }

    pub fn ilike(name: &str, pattern: &str) -> Self {
        Self::binary(Operator::Ilike, name, pattern)
    }

    pub fn in_list(name: &str, values: Vec<Value>) -> Self {
        Self::cond(
            Operator::In,
            vec![Self::name(name), Expression::Value(Value::List(values))],
        )
    }

    pub fn and(exprs: Vec<Expression>) -> Self {
        Self::cond(Operator::And, exprs)
    }

    pub fn or(exprs: Vec<Expression>) -> Self {
        Self::cond(Operator::Or, exprs)
    }

    /// AND two optional expressions together.
    pub fn and_opt(a: Option<Expression>, b: Option<Expression>) -> Option<Expression> {
        match (a, b) {
            (Some(a), Some(b)) => Some(Self::and(vec![a, b])),
            (a, None) => a,
            (None, b) => b,
        }
    }

    /// Every name referenced in the expression, subqueries included.
    pub fn referenced_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names(&self, out: &mut Vec<String>) {
        match self {
            Expression::Name(n) => {
                if !out.contains(n) {
                    out.push(n.clone());
                }
            }
            Expression::Value(_) => {}
            Expression::Condition(c) => {
                for e in &c.exprs {
                    e.collect_names(out);
                }
            }
            Expression::Subquery(sq) => {
                if !out.contains(&sq.dimension.name) {
                    out.push(sq.dimension.name.clone());
                }
                if let Some(w) = &sq.where_clause {
                    w.collect_names(out);
                }
                if let Some(h) = &sq.having {
                    h.collect_names(out);
                }
            }
        }
    }
}
