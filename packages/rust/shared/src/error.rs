//! Error types for Treeward.
//!
//! Library crates use [`TreewardError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Treeward operations.
#[derive(Debug, thiserror::Error)]
pub enum TreewardError {
    /// A persisted artifact (technique graph, checkpoint) does not exist.
    #[error("{what} not found at {path:?}")]
    NotFound { what: &'static str, path: PathBuf },

    /// A persisted artifact exists but cannot be parsed or violates its schema.
    #[error("corrupt data at {path:?}: {message}")]
    Corrupt { path: PathBuf, message: String },

    /// Embedding model failure (load, inference, or shape mismatch).
    #[error("embedding model error: {0}")]
    Model(String),

    /// Illegal workflow stage transition. Always a logic error.
    #[error("cannot transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// A checkpoint exists but is not safe to resume from.
    #[error("checkpoint cannot be resumed: {reason}")]
    InvalidResume { reason: String },

    /// External stage collaborator (agent bridge) failure.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input validation error (bad checkpoint name, missing project dir, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TreewardError>;

impl TreewardError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a corrupt-data error for the file at `path`.
    pub fn corrupt(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for the file at `path`.
    pub fn not_found(what: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::NotFound {
            what,
            path: path.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors that signal a broken state-machine invariant.
    ///
    /// These must reach the caller; the orchestrator never records them as an
    /// ordinary stage failure.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::InvalidResume { .. }
        )
    }
}
