//! SQL dialects and syntax checking.
//!
//! - [`dialect`] - OLAP dialect implementations
//! - [`validate`] - sqlparser-based syntax validation of emitted SQL

pub mod dialect;
pub mod validate;

pub use dialect::{Dialect, SqlDialect, Unnest};
pub use validate::validate_sql;
