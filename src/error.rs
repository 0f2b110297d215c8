//! Crate-wide error type.

use std::time::Duration;

use thiserror::Error;

use crate::config::SettingsError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while compiling or executing a metrics view query.
#[derive(Debug, Error)]
pub enum Error {
    /// The query or its use of the metrics view is malformed.
    #[error("{0}")]
    Validation(String),

    /// The security policy denies access to the view or a field.
    #[error("action not allowed")]
    Forbidden,

    /// The request is well formed but not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The target dialect cannot express the request.
    #[error("dialect {dialect}: {message}")]
    Dialect {
        dialect: &'static str,
        message: String,
    },

    /// A statement failed in the OLAP store.
    #[error("query execution failed: {0}")]
    Execution(String),

    /// A statement exceeded its time budget.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    /// An error with an added message prefix.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The Druid native search path cannot handle this query.
    #[error("native search is not available for this query")]
    NativeSearchUnavailable,
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    pub fn dialect(dialect: &'static str, msg: impl Into<String>) -> Self {
        Error::Dialect {
            dialect,
            message: msg.into(),
        }
    }

    pub fn execution(msg: impl std::fmt::Display) -> Self {
        Error::Execution(msg.to_string())
    }

    /// Wrap this error with a message prefix.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error (or any error it wraps) is a security denial.
    pub fn is_forbidden(&self) -> bool {
        matches!(self.root(), Error::Forbidden)
    }
}

/// Adds `context` to results carrying the crate error.
pub trait ResultExt<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T>;

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|e| e.context(f()))
    }
}
