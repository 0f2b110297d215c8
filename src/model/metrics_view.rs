//! Resolved metrics view definitions.

use serde::{Deserialize, Serialize};

use super::time::TimeGrain;
use crate::error::{Error, Result};

/// A metrics view: dimensions and measures over a single table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MetricsViewSpec {
    pub name: String,
    pub connector: String,
    pub database: String,
    pub database_schema: String,
    pub table: String,
    pub time_dimension: String,
    pub smallest_time_grain: TimeGrain,
    pub watermark_expression: String,
    pub first_day_of_week: u32,
    pub first_month_of_year: u32,
    pub dimensions: Vec<DimensionSpec>,
    pub measures: Vec<MeasureSpec>,
    /// Cache results. Unset means enabled unless the view is streaming.
    pub cache_enabled: Option<bool>,
    pub cache_key_sql: String,
    /// Whether the underlying table receives continuous appends.
    pub streaming: bool,
    pub annotations: Vec<AnnotationSpec>,
}

/// A table of time-stamped notes shown alongside some of the view's measures.
///
/// The table needs `time` and `description` columns. `time_end` and
/// `duration` (a grain name) are optional and declared by the flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AnnotationSpec {
    pub name: String,
    pub database: String,
    pub database_schema: String,
    pub table: String,
    /// Measures the annotation applies to.
    pub measures: Vec<String>,
    pub has_time_end: bool,
    pub has_duration: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DimensionSpec {
    pub name: String,
    pub display_name: String,
    pub column: String,
    pub expression: String,
    pub unnest: bool,
    pub uri: String,
    pub lookup_table: String,
    pub lookup_key_column: String,
    pub lookup_value_column: String,
    pub lookup_default_expression: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MeasureType {
    #[default]
    Simple,
    Derived,
    TimeComparison,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MeasureSpec {
    pub name: String,
    pub display_name: String,
    pub expression: String,
    #[serde(rename = "type")]
    pub measure_type: MeasureType,
    pub window: Option<MeasureWindow>,
    pub per_dimensions: Vec<DimensionSelector>,
    pub required_dimensions: Vec<DimensionSelector>,
    pub referenced_measures: Vec<String>,
    pub treat_nulls_as: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MeasureWindow {
    pub partition: bool,
    pub order_by: Vec<DimensionSelector>,
    pub frame_expression: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DimensionSelector {
    pub name: String,
    pub time_grain: TimeGrain,
    pub desc: bool,
}

/// Lookup (dictionary) metadata of a dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupMeta {
    pub table: String,
    pub key_column: String,
    pub value_column: String,
    pub default_expression: String,
}

impl DimensionSpec {
    pub fn column(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            ..Default::default()
        }
    }

    pub fn expression(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
            ..Default::default()
        }
    }

    pub fn lookup(&self) -> Option<LookupMeta> {
        if self.lookup_table.is_empty() {
            return None;
        }
        Some(LookupMeta {
            table: self.lookup_table.clone(),
            key_column: self.lookup_key_column.clone(),
            value_column: self.lookup_value_column.clone(),
            default_expression: self.lookup_default_expression.clone(),
        })
    }

    pub fn display_name_or_name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }
}

impl MeasureSpec {
    pub fn simple(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
            ..Default::default()
        }
    }

    pub fn derived(
        name: impl Into<String>,
        expression: impl Into<String>,
        referenced_measures: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
            measure_type: MeasureType::Derived,
            referenced_measures: referenced_measures.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn display_name_or_name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }
}

impl MetricsViewSpec {
    pub fn dimension(&self, name: &str) -> Option<&DimensionSpec> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn measure(&self, name: &str) -> Option<&MeasureSpec> {
        self.measures.iter().find(|m| m.name == name)
    }

    /// Look up a dimension. The time dimension resolves even when not listed.
    pub fn lookup_dimension(&self, name: &str) -> Result<DimensionSpec> {
        if name.is_empty() {
            return Err(Error::validation("received empty dimension name"));
        }
        if let Some(d) = self.dimension(name) {
            return Ok(d.clone());
        }
        if name == self.time_dimension {
            return Ok(DimensionSpec::column(name));
        }
        Err(Error::validation(format!("dimension {:?} not found", name)))
    }

    pub fn lookup_measure(&self, name: &str) -> Result<&MeasureSpec> {
        self.measure(name)
            .ok_or_else(|| Error::validation(format!("measure {:?} not found", name)))
    }

    /// First day of week, defaulting to Monday.
    pub fn first_day_of_week(&self) -> u32 {
        if self.first_day_of_week == 0 {
            1
        } else {
            self.first_day_of_week
        }
    }

    /// First month of year, defaulting to January.
    pub fn first_month_of_year(&self) -> u32 {
        if self.first_month_of_year == 0 {
            1
        } else {
            self.first_month_of_year
        }
    }
}
