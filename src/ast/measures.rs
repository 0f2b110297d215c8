//! Measure resolution and materialization.
//!
//! A measure is added to the node that needs it, recursing into inner
//! selects until it reaches one that can evaluate it:
//!
//! - simple measures evaluate against the underlying table
//! - derived measures evaluate where their referenced measures are in scope
//!   in exactly one inner select
//! - time comparison measures evaluate on a node joining `base` and
//!   `comparison` selects

use std::borrow::Cow;

use super::{Builder, FieldNode, FromClause, Join, JoinType, SelectNode};
use crate::error::{Error, Result};
use crate::model::{Measure, MeasureCompute, MeasureSpec, MeasureType};
use crate::sql::SqlDialect;

const BASE_ALIAS: &str = "base";
const COMPARISON_ALIAS: &str = "comparison";

impl<'a> Builder<'a> {
    /// The spec for a query measure, synthesizing one for computed measures.
    pub(crate) fn resolve_measure(&self, qm: &Measure, visible: bool) -> Result<Cow<'a, MeasureSpec>> {
        let Some(compute) = &qm.compute else {
            return Ok(Cow::Borrowed(self.lookup_measure(&qm.name, visible)?));
        };

        self.check_name_for_computed_field(&qm.name)?;

        let spec = match compute {
            MeasureCompute::Count(true) => MeasureSpec {
                name: qm.name.clone(),
                display_name: "Count".to_string(),
                expression: "COUNT(*)".to_string(),
                ..Default::default()
            },
            MeasureCompute::Count(false) => {
                return Err(Error::validation("must specify a compute operation"));
            }
            MeasureCompute::CountDistinct { dimension } => {
                let dim = self.lookup_dimension(dimension, visible)?;
                let expr = self.dialect.metrics_view_dimension_expression(&dim)?;
                MeasureSpec {
                    name: qm.name.clone(),
                    display_name: format!("Unique {}", dim.display_name_or_name()),
                    expression: format!("COUNT(DISTINCT {})", expr),
                    ..Default::default()
                }
            }
            MeasureCompute::ComparisonValue { measure } => {
                let m = self.lookup_measure(measure, visible)?;
                MeasureSpec {
                    name: qm.name.clone(),
                    display_name: format!("{} (prev)", m.display_name_or_name()),
                    expression: self.member(COMPARISON_ALIAS, &m.name),
                    measure_type: MeasureType::TimeComparison,
                    referenced_measures: vec![m.name.clone()],
                    ..Default::default()
                }
            }
            MeasureCompute::ComparisonDelta { measure } => {
                let m = self.lookup_measure(measure, visible)?;
                MeasureSpec {
                    name: qm.name.clone(),
                    display_name: format!("{} (Δ)", m.display_name_or_name()),
                    expression: format!(
                        "{} - {}",
                        self.member(BASE_ALIAS, &m.name),
                        self.member(COMPARISON_ALIAS, &m.name)
                    ),
                    measure_type: MeasureType::TimeComparison,
                    referenced_measures: vec![m.name.clone()],
                    ..Default::default()
                }
            }
            MeasureCompute::ComparisonRatio { measure } => {
                let m = self.lookup_measure(measure, visible)?;
                let base = self.member(BASE_ALIAS, &m.name);
                let comparison = self.member(COMPARISON_ALIAS, &m.name);
                MeasureSpec {
                    name: qm.name.clone(),
                    display_name: format!("{} (Δ%)", m.display_name_or_name()),
                    expression: self
                        .dialect
                        .safe_divide_expression(&format!("{} - {}", base, comparison), &comparison),
                    measure_type: MeasureType::TimeComparison,
                    referenced_measures: vec![m.name.clone()],
                    ..Default::default()
                }
            }
            MeasureCompute::PercentOfTotal { measure, total } => {
                let m = self.lookup_measure(measure, visible)?;
                let Some(total) = total else {
                    return Err(Error::validation(format!(
                        "totals not computed for {}",
                        measure
                    )));
                };
                MeasureSpec {
                    name: qm.name.clone(),
                    display_name: format!("{} (Σ%)", m.display_name_or_name()),
                    expression: format!(
                        "{}/{:.6}",
                        self.dialect.escape_identifier(&m.name),
                        total
                    ),
                    measure_type: MeasureType::Derived,
                    referenced_measures: vec![m.name.clone()],
                    ..Default::default()
                }
            }
            MeasureCompute::Uri { dimension } => {
                let dim = self.lookup_dimension(dimension, visible)?;
                if dim.uri.is_empty() {
                    return Err(Error::validation(format!(
                        "`uri` not set for the dimension {}",
                        dimension
                    )));
                }
                MeasureSpec {
                    name: qm.name.clone(),
                    display_name: format!("URI for {}", dim.display_name_or_name()),
                    expression: self.any_in_group(&dim.uri),
                    ..Default::default()
                }
            }
            MeasureCompute::ComparisonTime { .. } => {
                return Err(Error::unsupported(
                    "comparison_time measures can only be queried directly",
                ));
            }
        };

        Ok(Cow::Owned(spec))
    }

    /// Add `m` to `n`, reshaping the tree below `n` as needed.
    pub(crate) fn add_measure_field(&self, n: &mut SelectNode, m: &MeasureSpec) -> Result<()> {
        // Already added as a referenced measure of a derived measure.
        if n.has_measure(&m.name) {
            return Ok(());
        }

        self.check_required_dimensions(m)?;

        match m.measure_type {
            MeasureType::Simple => self.add_simple_measure(n, m),
            MeasureType::Derived => self.add_derived_measure(n, m),
            MeasureType::TimeComparison => self.add_time_comparison_measure(n, m),
        }
    }

    fn add_simple_measure(&self, n: &mut SelectNode, m: &MeasureSpec) -> Result<()> {
        if n.is_table() {
            let expr = self.sql_for_measure(n, m)?;
            n.measure_fields.push(measure_field(m, expr));
            return Ok(());
        }

        let inner = n
            .inner_mut()
            .ok_or_else(|| Error::unsupported("cannot add a measure to an inline select"))?;
        if !inner.has_measure(&m.name) {
            self.add_simple_measure(inner, m)?;
        }
        self.add_pass_through(n, m);
        Ok(())
    }

    fn add_derived_measure(&self, n: &mut SelectNode, m: &MeasureSpec) -> Result<()> {
        if !m.per_dimensions.is_empty() {
            return Err(Error::unsupported("support for \"per\" not implemented"));
        }

        // Referenced names must exist in only one sub-select, so push below the comparison join.
        if n.comparison().is_some() {
            if let Some(inner) = n.inner_mut() {
                if !inner.has_measure(&m.name) {
                    self.add_derived_measure(inner, m)?;
                }
            }
            self.add_pass_through(n, m);
            return Ok(());
        }

        // A spine join makes dimension names ambiguous.
        if matches!(n.join(), Some(Join::Spine(_))) {
            self.wrap_select(n, self.generate_identifier());
        }

        self.add_referenced_measures_to_scope(n, &m.referenced_measures)?;

        let mut expr = self.sql_for_measure(n, m)?;
        if n.group {
            expr = self.any_in_group(&expr);
        }
        n.measure_fields.push(measure_field(m, expr));
        Ok(())
    }

    fn add_time_comparison_measure(&self, n: &mut SelectNode, m: &MeasureSpec) -> Result<()> {
        self.ensure_comparison_join(n)?;
        self.add_referenced_measures_to_scope(n, &m.referenced_measures)?;

        let mut expr = self.sql_for_measure(n, m)?;
        if n.group {
            expr = self.any_in_group(&expr);
        }
        n.measure_fields.push(measure_field(m, expr));
        Ok(())
    }

    /// Expose the comparison range's actual time value for a time-floored
    /// dimension as measure `name`.
    pub(crate) fn add_comparison_time_measure(
        &self,
        n: &mut SelectNode,
        name: &str,
        dimension: &str,
    ) -> Result<()> {
        if n.has_measure(name) {
            return Ok(());
        }
        self.check_name_for_computed_field(name)?;

        // Comparison dimension fields are shifted onto the base range, so take the unshifted expression.
        let expr = match self.query.dimensions.iter().position(|qd| qd.name == dimension) {
            Some(i) => self.dim_fields[i].expr.clone(),
            None => {
                let dim = self.lookup_dimension(dimension, true)?;
                self.dialect.metrics_view_dimension_expression(&dim)?
            }
        };

        self.ensure_comparison_join(n)?;

        let FromClause::Select {
            join: Join::Comparison { node, .. },
            ..
        } = &mut n.from
        else {
            return Err(Error::unsupported("comparison join not found"));
        };
        if !node.is_table() {
            return Err(Error::unsupported(
                "comparison_time is not supported together with a spine",
            ));
        }
        node.measure_fields.push(FieldNode {
            name: name.to_string(),
            display_name: format!("{} (prev)", dimension),
            expr: self.any_in_group(&expr),
            ..Default::default()
        });

        let mut outer = self.member(COMPARISON_ALIAS, name);
        if n.group {
            outer = self.any_in_group(&outer);
        }
        n.measure_fields.push(FieldNode {
            name: name.to_string(),
            display_name: format!("{} (prev)", dimension),
            expr: outer,
            ..Default::default()
        });
        Ok(())
    }

    /// Wrap `n` under `base` and full join the comparison range's select, if not done yet.
    fn ensure_comparison_join(&self, n: &mut SelectNode) -> Result<()> {
        if n.comparison().is_some() {
            return Ok(());
        }
        if self.query.comparison_time_range.is_none() {
            return Err(Error::validation("comparison time range not provided"));
        }

        self.wrap_select(n, BASE_ALIAS.to_string());
        let comparison = self.build_base_select(COMPARISON_ALIAS.to_string(), true)?;
        if let FromClause::Select { join, .. } = &mut n.from {
            *join = Join::Comparison {
                node: Box::new(comparison),
                join_type: JoinType::Full,
            };
        }

        for f in &mut n.dim_fields {
            f.expr = format!(
                "COALESCE({}, {})",
                f.expr,
                self.member(COMPARISON_ALIAS, &f.name)
            );
        }
        Ok(())
    }

    /// Bring `refs` into scope below `n` without projecting them in `n`.
    ///
    /// With a comparison join they are added to both sides; otherwise to the
    /// single inner select, so unqualified references are unambiguous.
    fn add_referenced_measures_to_scope(&self, n: &mut SelectNode, refs: &[String]) -> Result<()> {
        if refs.is_empty() {
            return Ok(());
        }

        if n.is_table() {
            self.wrap_select(n, self.generate_identifier());
        }

        for r in refs {
            let m = self.lookup_measure(r, false)?;
            let FromClause::Select { inner, join } = &mut n.from else {
                return Err(Error::unsupported(
                    "cannot bring measures into scope of an inline select",
                ));
            };
            self.add_measure_field(inner, m)?;
            if let Join::Comparison { node, .. } = join {
                self.add_measure_field(node, m)?;
            }
        }
        Ok(())
    }

    /// Pass `m` through from `n`'s inner select.
    fn add_pass_through(&self, n: &mut SelectNode, m: &MeasureSpec) {
        let inner_alias = n.inner().map(|i| i.alias.clone()).unwrap_or_default();
        let mut expr = self.member(&inner_alias, &m.name);
        if n.group {
            expr = self.any_in_group(&expr);
        }
        n.measure_fields.push(measure_field(m, expr));
    }

    /// The measure expression, with its window clause if any.
    fn sql_for_measure(&self, n: &SelectNode, m: &MeasureSpec) -> Result<String> {
        let Some(window) = &m.window else {
            return Ok(m.expression.clone());
        };

        // Without partitioning, ordering and framing don't matter.
        if !window.partition {
            return Ok(format!("{} OVER ()", m.expression));
        }

        let mut order = Vec::with_capacity(window.order_by.len());
        for sel in &window.order_by {
            let f = self.find_field_for_dimension(n, sel).ok_or_else(|| {
                Error::validation(format!(
                    "dimension {:?} required by window measure {:?} not found in query",
                    sel.name, m.name
                ))
            })?;
            order.push((f, sel.desc));
        }

        let partition: Vec<&str> = n
            .dim_fields
            .iter()
            .filter(|f| !order.iter().any(|(of, _)| of.name == f.name))
            .map(|f| f.expr.as_str())
            .collect();

        let mut clauses = Vec::new();
        if !partition.is_empty() {
            clauses.push(format!("PARTITION BY {}", partition.join(", ")));
        }
        if !order.is_empty() {
            let items: Vec<String> = order
                .iter()
                .map(|(f, desc)| {
                    if *desc {
                        format!("{} DESC", f.expr)
                    } else {
                        f.expr.clone()
                    }
                })
                .collect();
            clauses.push(format!("ORDER BY {}", items.join(", ")));
        }
        if !window.frame_expression.is_empty() {
            clauses.push(window.frame_expression.clone());
        }

        Ok(format!("{} OVER ({})", m.expression, clauses.join(" ")))
    }
}

fn measure_field(m: &MeasureSpec, expr: String) -> FieldNode {
    FieldNode {
        name: m.name.clone(),
        display_name: m.display_name_or_name().to_string(),
        expr,
        auto_unnest: false,
        treat_null_as: if m.treat_nulls_as.is_empty() {
            None
        } else {
            Some(m.treat_nulls_as.clone())
        },
    }
}
