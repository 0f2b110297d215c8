//! The structured query accepted by the compiler.

use serde::{Deserialize, Serialize};

use super::expression::Expression;
use super::time::{Spine, TimeGrain, TimeRange};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Query {
    pub metrics_view: String,
    pub dimensions: Vec<Dimension>,
    pub measures: Vec<Measure>,
    pub pivot_on: Vec<String>,
    pub spine: Option<Spine>,
    pub sort: Vec<Sort>,
    pub time_range: Option<TimeRange>,
    pub comparison_time_range: Option<TimeRange>,
    #[serde(rename = "where")]
    pub where_clause: Option<Expression>,
    pub having: Option<Expression>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub time_zone: String,
    pub use_display_names: bool,
    pub rows: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<DimensionCompute>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionCompute {
    TimeFloor { dimension: String, grain: TimeGrain },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<MeasureCompute>,
}

/// A computed measure. Exactly one kind per measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureCompute {
    Count(bool),
    CountDistinct { dimension: String },
    ComparisonValue { measure: String },
    ComparisonDelta { measure: String },
    ComparisonRatio { measure: String },
    PercentOfTotal {
        measure: String,
        #[serde(default)]
        total: Option<f64>,
    },
    Uri { dimension: String },
    ComparisonTime { dimension: String },
}

impl MeasureCompute {
    /// The view field the computation reads, if any.
    pub fn underlying_field(&self) -> Option<&str> {
        match self {
            MeasureCompute::Count(_) => None,
            MeasureCompute::CountDistinct { dimension }
            | MeasureCompute::Uri { dimension }
            | MeasureCompute::ComparisonTime { dimension } => Some(dimension),
            MeasureCompute::ComparisonValue { measure }
            | MeasureCompute::ComparisonDelta { measure }
            | MeasureCompute::ComparisonRatio { measure }
            | MeasureCompute::PercentOfTotal { measure, .. } => Some(measure),
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            MeasureCompute::ComparisonValue { .. }
                | MeasureCompute::ComparisonDelta { .. }
                | MeasureCompute::ComparisonRatio { .. }
                | MeasureCompute::ComparisonTime { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sort {
    pub name: String,
    #[serde(default)]
    pub desc: bool,
}

impl Dimension {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            compute: None,
        }
    }

    pub fn time_floor(name: impl Into<String>, dimension: impl Into<String>, grain: TimeGrain) -> Self {
        Self {
            name: name.into(),
            compute: Some(DimensionCompute::TimeFloor {
                dimension: dimension.into(),
                grain,
            }),
        }
    }

    /// The view dimension this query dimension reads.
    pub fn underlying_name(&self) -> &str {
        match &self.compute {
            Some(DimensionCompute::TimeFloor { dimension, .. }) => dimension,
            None => &self.name,
        }
    }
}

impl Measure {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            compute: None,
        }
    }

    pub fn computed(name: impl Into<String>, compute: MeasureCompute) -> Self {
        Self {
            name: name.into(),
            compute: Some(compute),
        }
    }
}

impl Sort {
    pub fn asc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desc: false,
        }
    }

    pub fn desc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desc: true,
        }
    }
}

impl Query {
    /// Check combinations of options that can never compile.
    pub fn validate(&self) -> Result<()> {
        if self.rows {
            if !self.dimensions.is_empty() {
                return Err(Error::validation(
                    "dimensions not supported when rows is set, all model columns will be returned",
                ));
            }
            if !self.measures.is_empty() {
                return Err(Error::validation(
                    "measures not supported when rows is set, all model columns will be returned",
                ));
            }
            if !self.sort.is_empty() {
                return Err(Error::validation("sort not supported when rows is set"));
            }
            if self.comparison_time_range.is_some() {
                return Err(Error::validation(
                    "comparison_time_range not supported when rows is set",
                ));
            }
            if self.having.is_some() {
                return Err(Error::validation("having not supported when rows is set"));
            }
            if !self.pivot_on.is_empty() {
                return Err(Error::validation("pivot_on not supported when rows is set"));
            }
        }

        if let (Some(tr), Some(ctr)) = (&self.time_range, &self.comparison_time_range) {
            if tr.time_dimension != ctr.time_dimension {
                return Err(Error::validation(
                    "time_dimension in time_range and comparison_time_range must match",
                ));
            }
        }

        for m in &self.measures {
            if let Some(MeasureCompute::Count(false)) = m.compute {
                return Err(Error::validation(format!(
                    "invalid measure {:?}: must specify a compute operation",
                    m.name
                )));
            }
        }

        for (name, v) in [("limit", self.limit), ("offset", self.offset)] {
            if matches!(v, Some(n) if n < 0) {
                return Err(Error::validation(format!("{} must not be negative", name)));
            }
        }

        Ok(())
    }

    /// Every view field the query touches, deduplicated in first-seen order.
    pub fn analyze_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        let mut add = |f: &str| {
            if !f.is_empty() && !fields.iter().any(|x| x == f) {
                fields.push(f.to_string());
            }
        };

        for d in &self.dimensions {
            add(d.underlying_name());
        }
        for m in &self.measures {
            match &m.compute {
                None => add(&m.name),
                Some(c) => {
                    if let Some(f) = c.underlying_field() {
                        add(f)
                    }
                }
            }
        }
        if let Some(td) = self
            .time_range
            .as_ref()
            .and_then(|tr| tr.time_dimension.as_deref())
        {
            add(td);
        }
        if let Some(w) = &self.where_clause {
            for n in w.referenced_names() {
                add(&n);
            }
        }

        fields
    }
}
