//! Row caps for interactive queries.

use tracing::debug;

use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::model::Query;

impl Executor {
    /// Apply `interactive_rows_limit` to `qry`, returning the cap to enforce on
    /// the result. Without a cap the query is left alone.
    pub(crate) fn rewrite_query_enforce_caps(&self, qry: &mut Query) -> Result<Option<i64>> {
        enforce_caps(qry, self.settings.interactive_rows_limit)
    }
}

/// A query without a limit fetches one row past `cap` so an oversized
/// result is detected instead of silently truncated.
pub fn enforce_caps(qry: &mut Query, cap: i64) -> Result<Option<i64>> {
    if cap <= 0 {
        return Ok(None);
    }

    match qry.limit {
        None => {
            debug!(cap, "limiting uncapped query");
            qry.limit = Some(cap + 1);
        }
        Some(limit) if limit > cap => {
            return Err(Error::validation(format!(
                "query limit of {} exceeds the maximum of {} rows",
                limit, cap
            )));
        }
        Some(_) => {}
    }
    Ok(Some(cap))
}
