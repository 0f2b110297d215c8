//! TOML-based configuration for the query executor.
//!
//! Supports a config file (metricsview.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [executor]
//! interactive_timeout = "3m"
//! export_timeout = "${EXPORT_TIMEOUT}"
//! interactive_rows_limit = 10000
//!
//! [executor.comparisons]
//! approximate = true
//! approximate_cte = false
//! two_phase = true
//! two_phase_limit = 250
//!
//! [executor.druid]
//! exactify_topn = true
//! exactify_topn_limit = 250
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid duration format: {0}")]
    InvalidDuration(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Executor configuration.
    pub executor: ExecutorSettings,
}

/// Settings that gate the rewrite passes and bound sub-query execution.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Time budget for interactive queries (e.g., "3m", "30s").
    pub interactive_timeout: String,

    /// Time budget for exports.
    pub export_timeout: String,

    /// Maximum rows an interactive query may return (0 = unlimited).
    pub interactive_rows_limit: i64,

    /// Limit pushdown into join children.
    pub limit_pushdown: bool,

    /// Concurrent checks when validating a metrics view.
    pub validate_concurrency: usize,

    /// Upper bound on bins generated for a time spine.
    pub time_spine_max_bins: usize,

    /// Comparison query settings.
    pub comparisons: ComparisonSettings,

    /// Druid specific settings.
    pub druid: DruidSettings,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            interactive_timeout: "3m".to_string(),
            export_timeout: "5m".to_string(),
            interactive_rows_limit: 0,
            limit_pushdown: true,
            validate_concurrency: 10,
            time_spine_max_bins: 1000,
            comparisons: ComparisonSettings::default(),
            druid: DruidSettings::default(),
        }
    }
}

/// Comparison query settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ComparisonSettings {
    /// Turn FULL comparison joins into LEFT/RIGHT joins with pushed down limits.
    pub approximate: bool,

    /// Promote the sorted side of an approximate comparison to a CTE.
    pub approximate_cte: bool,

    /// Execute the sorted side first and inline its rows.
    pub two_phase: bool,

    /// Largest limit for which two-phase execution applies.
    pub two_phase_limit: i64,
}

impl Default for ComparisonSettings {
    fn default() -> Self {
        Self {
            approximate: true,
            approximate_cte: false,
            two_phase: true,
            two_phase_limit: 250,
        }
    }
}

/// Druid specific settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DruidSettings {
    /// Probe TopN dimension values first so the outer query is exact.
    pub exactify_topn: bool,

    /// Largest limit for which the preliminary TopN runs.
    pub exactify_topn_limit: i64,
}

impl Default for DruidSettings {
    fn default() -> Self {
        Self {
            exactify_topn: false,
            exactify_topn_limit: 250,
        }
    }
}

impl ExecutorSettings {
    /// Interactive timeout with environment variables expanded.
    pub fn interactive_timeout(&self) -> Result<Duration, SettingsError> {
        parse_duration(&expand_env_vars(&self.interactive_timeout)?)
    }

    /// Export timeout with environment variables expanded.
    pub fn export_timeout(&self) -> Result<Duration, SettingsError> {
        parse_duration(&expand_env_vars(&self.export_timeout)?)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.interactive_timeout()?;
        self.export_timeout()?;
        if self.interactive_rows_limit < 0 {
            return Err(SettingsError::InvalidConfig(
                "interactive_rows_limit must not be negative".to_string(),
            ));
        }
        if self.validate_concurrency == 0 {
            return Err(SettingsError::InvalidConfig(
                "validate_concurrency must be at least 1".to_string(),
            ));
        }
        if self.time_spine_max_bins == 0 {
            return Err(SettingsError::InvalidConfig(
                "time_spine_max_bins must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse settings from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(content)?;
        settings.executor.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `METRICSVIEW_CONFIG`
    /// 2. `./metricsview.toml`
    /// 3. `~/.config/metricsview/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("METRICSVIEW_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("metricsview.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("metricsview").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }
}

/// Parse a duration such as "250ms", "30s", "5m" or "1h".
pub fn parse_duration(s: &str) -> Result<Duration, SettingsError> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| SettingsError::InvalidDuration(s.to_string()))?;
    let (num, unit) = s.split_at(split);
    let n: u64 = num
        .parse()
        .map_err(|_| SettingsError::InvalidDuration(s.to_string()))?;

    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(SettingsError::InvalidDuration(s.to_string())),
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if !(ch.is_alphanumeric() || ch == '_') {
                    break;
                }
                var_name.push(ch);
                chars.next();
            }
            if var_name.is_empty() {
                // Lone $
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
