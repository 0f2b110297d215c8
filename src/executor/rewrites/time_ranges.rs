//! Resolution of relative time ranges to absolute bounds.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::model::{IsoDuration, Query, TimeRange};

impl Executor {
    /// Resolve the base and comparison time ranges of `qry`.
    ///
    /// Relative ranges anchor on `execution_time`, else on the watermark of
    /// their time dimension. Timestamps are only fetched when needed.
    pub(crate) async fn rewrite_query_time_ranges(
        &self,
        qry: &mut Query,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        for tr in [&mut qry.time_range, &mut qry.comparison_time_range]
            .into_iter()
            .flatten()
        {
            self.resolve_relative_time_range(tr, execution_time).await?;
        }
        Ok(())
    }

    /// Resolve one time range, fetching timestamps only when it needs an anchor.
    pub(crate) async fn resolve_relative_time_range(
        &self,
        tr: &mut TimeRange,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if tr.is_resolved() {
            return Ok(());
        }
        let needs_anchor = tr.expression.is_none()
            && tr.end.is_none()
            && (tr.iso_duration.is_some() || (tr.iso_offset.is_some() && tr.start.is_none()));
        let anchor = match (tr.end, execution_time) {
            (Some(end), _) => Some(end),
            (None, Some(t)) => Some(t),
            (None, None) if !needs_anchor => None,
            (None, None) => {
                let td = tr.time_dimension.clone().unwrap_or_default();
                let ts = self.timestamps(&td).await?;
                Some(ts.watermark.or(ts.max).unwrap_or(ts.now))
            }
        };
        resolve_time_range(
            tr,
            anchor,
            self.metrics_view.first_day_of_week(),
            self.metrics_view.first_month_of_year(),
        )
    }
}

/// Resolve `tr` in place.
///
/// An ISO duration counts back from `end`, or from `anchor` without one.
/// An ISO offset then moves both bounds back, and a round-to grain truncates
/// them.
pub fn resolve_time_range(
    tr: &mut TimeRange,
    anchor: Option<DateTime<Utc>>,
    first_day_of_week: u32,
    first_month_of_year: u32,
) -> Result<()> {
    if let Some(expr) = &tr.expression {
        return Err(Error::unsupported(format!(
            "time range expressions are not supported: {:?}",
            expr
        )));
    }
    if tr.is_resolved() {
        return Ok(());
    }

    let out_of_range = || Error::validation("time range is out of bounds");

    if let Some(d) = tr.iso_duration.take() {
        let d = IsoDuration::parse(&d)?;
        let end = tr.end.or(anchor).ok_or_else(|| {
            Error::validation("cannot resolve an ISO duration without an end or anchor time")
        })?;
        tr.end = Some(end);
        if tr.start.is_none() {
            tr.start = Some(d.sub_from(end).ok_or_else(out_of_range)?);
        }
    }

    if let Some(o) = tr.iso_offset.take() {
        let o = IsoDuration::parse(&o)?;
        if tr.start.is_none() && tr.end.is_none() {
            tr.end = anchor;
        }
        for t in [&mut tr.start, &mut tr.end].into_iter().flatten() {
            *t = o.sub_from(*t).ok_or_else(out_of_range)?;
        }
    }

    let grain = std::mem::take(&mut tr.round_to_grain);
    if grain.is_specified() {
        for t in [&mut tr.start, &mut tr.end].into_iter().flatten() {
            *t = grain.truncate(*t, first_day_of_week, first_month_of_year);
        }
    }

    debug!(start = ?tr.start, end = ?tr.end, "resolved time range");
    Ok(())
}
