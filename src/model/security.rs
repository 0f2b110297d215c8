//! Per-user access policies applied while compiling queries.

use std::collections::HashSet;

use super::expression::Expression;

/// Access policy for one user against one metrics view.
pub trait Security: Send + Sync + std::fmt::Debug {
    /// Whether the user may query the view at all.
    fn can_access(&self) -> bool;

    fn can_access_field(&self, name: &str) -> bool;

    /// Trusted SQL predicate ANDed into every underlying WHERE.
    fn row_filter(&self) -> Option<&str>;

    /// Structured predicate ANDed into every underlying WHERE.
    fn query_filter(&self) -> Option<&Expression>;
}

/// A resolved policy.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSecurity {
    deny: bool,
    /// `None` grants every field.
    fields: Option<HashSet<String>>,
    row_filter: Option<String>,
    query_filter: Option<Expression>,
}

impl ResolvedSecurity {
    pub fn open() -> Self {
        Self::default()
    }

    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Default::default()
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_row_filter(mut self, sql: impl Into<String>) -> Self {
        self.row_filter = Some(sql.into());
        self
    }

    pub fn with_query_filter(mut self, expr: Expression) -> Self {
        self.query_filter = Some(expr);
        self
    }
}

impl Security for ResolvedSecurity {
    fn can_access(&self) -> bool {
        !self.deny
    }

    fn can_access_field(&self, name: &str) -> bool {
        if self.deny {
            return false;
        }
        match &self.fields {
            Some(fields) => fields.contains(name),
            None => true,
        }
    }

    fn row_filter(&self) -> Option<&str> {
        self.row_filter.as_deref()
    }

    fn query_filter(&self) -> Option<&Expression> {
        self.query_filter.as_ref()
    }
}

/// Grants everything. Used for internal sub-queries whose results never
/// reach the user directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipSecurity;

impl Security for SkipSecurity {
    fn can_access(&self) -> bool {
        true
    }

    fn can_access_field(&self, _name: &str) -> bool {
        true
    }

    fn row_filter(&self) -> Option<&str> {
        None
    }

    fn query_filter(&self) -> Option<&Expression> {
        None
    }
}
