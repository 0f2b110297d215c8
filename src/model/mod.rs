//! Data model: queries, expressions, metrics views and security policies.

pub mod expression;
pub mod metrics_view;
pub mod query;
pub mod security;
pub mod time;
pub mod value;

pub use expression::{Condition, Expression, Operator, Subquery};
pub use metrics_view::{
    AnnotationSpec, DimensionSelector, DimensionSpec, LookupMeta, MeasureSpec, MeasureType,
    MeasureWindow, MetricsViewSpec,
};
pub use query::{Dimension, DimensionCompute, Measure, MeasureCompute, Query, Sort};
pub use security::{ResolvedSecurity, Security, SkipSecurity};
pub use time::{IsoDuration, Spine, TimeGrain, TimeRange, TimeSpine, WhereSpine};
pub use value::Value;
