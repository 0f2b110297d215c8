//! # metricsview
//!
//! Compiles metrics view queries into dialect-correct SQL.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │     Query + MetricsViewSpec + Security + Dialect         │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [query passes: caps, pivot, time ranges, totals]
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Ast (SelectNode tree)                │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [ast passes: comparisons, limits, dialect fixes]
//! ┌─────────────────────────────────────────────────────────┐
//! │                 SQL + positional args                    │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [executor]
//! ┌─────────────────────────────────────────────────────────┐
//! │                      OlapStore                           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`] - queries, expressions, metrics views and security policies
//! - [`ast`] - the select tree, its builder and the SQL serializer
//! - [`sql`] - dialects
//! - [`executor`] - the rewrite pipeline and query execution
//! - [`config`] - executor settings
//!
//! ## Example
//!
//! ```ignore
//! use metricsview::prelude::*;
//!
//! let ast = Ast::new(&view, &ResolvedSecurity::open(), &query, Dialect::DuckDb)?;
//! let (sql, args) = ast.sql()?;
//! ```

pub mod ast;
pub mod config;
pub mod error;
pub mod executor;
pub mod model;
pub mod sql;

pub use error::{Error, Result};

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::ast::Ast;
    pub use crate::config::{ExecutorSettings, Settings};
    pub use crate::error::{Error, Result};
    pub use crate::executor::{Executor, OlapStore, QueryResult, Statement};
    pub use crate::model::{
        Dimension, DimensionSpec, Expression, Measure, MeasureCompute, MeasureSpec,
        MetricsViewSpec, Query, ResolvedSecurity, Security, Sort, TimeGrain, TimeRange, Value,
    };
    pub use crate::sql::{Dialect, SqlDialect};
}
