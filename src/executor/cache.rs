//! Cache keys for query results.

use chrono::SecondsFormat;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Result, ResultExt};
use crate::executor::{Executor, Statement};

/// SHA-256 of the JSON encoding of `value`, as 64 lowercase hex characters.
pub fn compute_hash<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

impl Executor {
    /// A key that changes whenever the view's results may change, or `None`
    /// when results must not be cached.
    ///
    /// Streaming views cache only when enabled explicitly and key on their
    /// watermark. Other views key on `cache_key_sql`, or cache until the
    /// view itself changes.
    pub async fn cache_key(&self) -> Result<Option<String>> {
        let mv = &self.metrics_view;
        match mv.cache_enabled {
            Some(false) => return Ok(None),
            None if mv.streaming => return Ok(None),
            _ => {}
        }

        if mv.cache_key_sql.is_empty() {
            if !mv.streaming {
                return Ok(Some(String::new()));
            }
            let ts = self.timestamps("").await?;
            let key = ts
                .watermark
                .map(|w| w.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default();
            return Ok(Some(key));
        }

        let res = self
            .execute(Statement::new(mv.cache_key_sql.clone(), Vec::new()))
            .await
            .context("failed to execute cache key query")?;
        let key = res.first_value().cloned().unwrap_or_default();
        compute_hash(&key).map(Some)
    }
}
