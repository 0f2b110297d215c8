//! Shared helper functions for SQL dialect implementations.
//!
//! This module provides reusable building blocks that dialects can compose
//! to implement the `SqlDialect` trait with minimal duplication.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::model::TimeGrain;

// =============================================================================
// Identifier Quoting
// =============================================================================

/// Quote identifier with double quotes (ANSI style). Empty stays empty.
/// Used by: all dialects
pub fn quote_double(ident: &str) -> String {
    if ident.is_empty() {
        return String::new();
    }
    format!("\"{}\"", ident.replace('"', "\"\""))
}

// =============================================================================
// String Quoting
// =============================================================================

/// Quote string with single quotes (standard SQL).
/// Used by: all dialects
pub fn quote_string_single(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

// =============================================================================
// Time
// =============================================================================

/// Upper case date_trunc unit for a grain.
pub fn date_trunc_unit(grain: TimeGrain) -> &'static str {
    match grain {
        TimeGrain::Unspecified => "",
        TimeGrain::Millisecond => "MILLISECOND",
        TimeGrain::Second => "SECOND",
        TimeGrain::Minute => "MINUTE",
        TimeGrain::Hour => "HOUR",
        TimeGrain::Day => "DAY",
        TimeGrain::Week => "WEEK",
        TimeGrain::Month => "MONTH",
        TimeGrain::Quarter => "QUARTER",
        TimeGrain::Year => "YEAR",
    }
}

/// Offset that moves a custom week or fiscal year start onto the natural one.
///
/// Returns `(amount, unit)` where unit is `DAY` or `MONTH`.
pub fn calendar_shift(
    grain: TimeGrain,
    first_day_of_week: u32,
    first_month_of_year: u32,
) -> Option<(u32, &'static str)> {
    match grain {
        TimeGrain::Week if first_day_of_week > 1 => Some((8 - first_day_of_week, "DAY")),
        TimeGrain::Year if first_month_of_year > 1 => Some((13 - first_month_of_year, "MONTH")),
        _ => None,
    }
}

/// Second precision RFC 3339.
pub fn rfc3339(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Nanosecond precision RFC 3339, trailing zeros trimmed.
pub fn rfc3339_nano(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Format a float the way SQL literals expect, keeping a decimal point.
pub fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}
