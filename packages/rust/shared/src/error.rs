//! Error types for seoscope.
//!
//! Library crates use [`SeoscopeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all seoscope operations.
#[derive(Debug, thiserror::Error)]
pub enum SeoscopeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Invalid caller input (e.g. empty seed URL, empty URL set).
    #[error("input error: {message}")]
    Input { message: String },

    /// A crawler, ranker, or analysis provider failed.
    #[error("{stage} failed: {message}")]
    Collaborator { stage: String, message: String },

    /// Persistent store read/write/corruption error.
    #[error("storage error: {0}")]
    Storage(String),

    /// The persistent store refused a write because it is full.
    #[error("storage quota exceeded writing {key}: needed {needed} bytes, {available} available")]
    QuotaExceeded {
        key: String,
        needed: u64,
        available: u64,
    },

    /// The run was aborted by the caller.
    #[error("run cancelled")]
    Cancelled,

    /// A stage was asked to make a transition its state machine forbids.
    #[error("invalid stage transition for {stage}: {from} -> {to}")]
    InvalidTransition {
        stage: String,
        from: String,
        to: String,
    },

    /// JSON encoding or decoding error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SeoscopeError>;

impl SeoscopeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an input error from any displayable message.
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input {
            message: msg.into(),
        }
    }

    /// Attribute a failure to the named pipeline stage.
    pub fn collaborator(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Collaborator {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures of the persistent store. These are always
    /// recovered inside the cache and never reach a run's caller.
    pub fn is_cache_io(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::QuotaExceeded { .. })
    }

    /// True when a store write was refused for lack of space.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

impl From<serde_json::Error> for SeoscopeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = SeoscopeError::config("missing cache path");
        assert_eq!(err.to_string(), "config error: missing cache path");

        let err = SeoscopeError::collaborator("technical", "provider returned 429");
        assert_eq!(err.to_string(), "technical failed: provider returned 429");
    }

    #[test]
    fn cache_io_classification() {
        let quota = SeoscopeError::QuotaExceeded {
            key: "k".into(),
            needed: 10,
            available: 2,
        };
        assert!(quota.is_cache_io());
        assert!(quota.is_quota_exceeded());
        assert!(SeoscopeError::Storage("disk gone".into()).is_cache_io());
        assert!(!SeoscopeError::Cancelled.is_cache_io());
        assert!(!SeoscopeError::input("empty").is_quota_exceeded());
    }
}
