//! Pivot queries.
//!
//! The underlying query is compiled without pivot, sort or paging. Its
//! result is then pivoted with a DuckDB `PIVOT` statement, which sorts and
//! pages the pivoted rows.

use crate::ast::Ast;
use crate::error::{Error, Result};
use crate::model::{Query, Sort};
use crate::sql::{Dialect, SqlDialect};

/// What a pivot query does on top of its underlying query.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotPlan {
    pub pivot_on: Vec<String>,
    pub sort: Vec<Sort>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Column names of the underlying result, as the pivot statement sees them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PivotNames {
    pub on: Vec<String>,
    pub group_by: Vec<String>,
    pub measures: Vec<String>,
    /// Output names of the sort fields, with descending flags.
    pub sort: Vec<(String, bool)>,
}

impl PivotPlan {
    /// Take the pivot out of `qry`, leaving the underlying query.
    pub fn extract(qry: &mut Query) -> Result<Option<PivotPlan>> {
        if qry.pivot_on.is_empty() {
            return Ok(None);
        }

        for name in &qry.pivot_on {
            if !qry.dimensions.iter().any(|d| &d.name == name) {
                return Err(Error::validation(format!(
                    "pivot field {:?} is not a dimension of the query",
                    name
                )));
            }
        }
        if qry.measures.is_empty() {
            return Err(Error::validation("pivot queries require at least one measure"));
        }
        for s in &qry.sort {
            let is_dimension = qry.dimensions.iter().any(|d| d.name == s.name);
            if !is_dimension || qry.pivot_on.contains(&s.name) {
                return Err(Error::unsupported(format!(
                    "pivot queries can only sort by non-pivot dimensions, got {:?}",
                    s.name
                )));
            }
        }

        Ok(Some(PivotPlan {
            pivot_on: std::mem::take(&mut qry.pivot_on),
            sort: std::mem::take(&mut qry.sort),
            limit: qry.limit.take(),
            offset: qry.offset.take(),
        }))
    }

    /// Resolve output names against the compiled underlying query.
    pub fn output_names(&self, ast: &Ast<'_>) -> Result<PivotNames> {
        let display = ast.query().use_display_names;
        let name_of = |name: &str| -> Result<String> {
            let f = ast.root.field(name).ok_or_else(|| {
                Error::validation(format!("pivot field {:?} not found in query", name))
            })?;
            if display && !f.display_name.is_empty() {
                Ok(f.display_name.clone())
            } else {
                Ok(f.name.clone())
            }
        };

        let mut names = PivotNames::default();
        for f in &ast.root.dim_fields {
            if self.pivot_on.contains(&f.name) {
                continue;
            }
            names.group_by.push(name_of(&f.name)?);
        }
        for p in &self.pivot_on {
            names.on.push(name_of(p)?);
        }
        for f in &ast.root.measure_fields {
            names.measures.push(name_of(&f.name)?);
        }
        for s in &self.sort {
            names.sort.push((name_of(&s.name)?, s.desc));
        }
        Ok(names)
    }

    /// The DuckDB `PIVOT` statement over `from`, a table or parenthesized select.
    pub fn sql(&self, names: &PivotNames, from: &str) -> Result<String> {
        if names.on.is_empty() || names.measures.is_empty() {
            return Err(Error::validation("pivot has no columns or measures"));
        }
        let d = Dialect::DuckDb;

        let on: Vec<String> = names.on.iter().map(|n| d.escape_identifier(n)).collect();
        let using: Vec<String> = names
            .measures
            .iter()
            .map(|m| {
                let id = d.escape_identifier(m);
                format!("{} AS {}", d.any_value_expression(&id), id)
            })
            .collect();

        let mut sql = format!("PIVOT {} ON {} USING {}", from, on.join(", "), using.join(", "));
        if !names.group_by.is_empty() {
            let group: Vec<String> = names.group_by.iter().map(|n| d.escape_identifier(n)).collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&group.join(", "));
        }
        if !names.sort.is_empty() {
            let order: Vec<String> = names
                .sort
                .iter()
                .map(|(n, desc)| d.order_by_expression(n, *desc))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        Ok(sql)
    }
}
