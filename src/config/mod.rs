//! Configuration for the executor.
//!
//! Handles the settings file, environment variables, and duration parsing.

mod settings;

pub use settings::{
    expand_env_vars, parse_duration, ComparisonSettings, DruidSettings, ExecutorSettings,
    Settings, SettingsError,
};
