//! Error types for Worldforge.
//!
//! Library crates use [`WorldforgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Worldforge operations.
#[derive(Debug, thiserror::Error)]
pub enum WorldforgeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Batch or input rejected before any side effect.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A rulebook with the same title already exists.
    #[error("duplicate title: a rulebook named '{title}' already exists")]
    DuplicateTitle { title: String },

    /// Upload (or link resolution) failed after the retry budget was spent.
    #[error("upload failed after {attempts} attempt(s): {source}")]
    Upload {
        attempts: u32,
        #[source]
        source: Box<WorldforgeError>,
    },

    /// Structured extraction failed after the retry budget was spent.
    #[error("extraction failed after {attempts} attempt(s): {source}")]
    Extraction {
        attempts: u32,
        #[source]
        source: Box<WorldforgeError>,
    },

    /// The aggregate world record could not be created or updated.
    #[error("world assembly error: {0}")]
    WorldAssembly(String),

    /// Network/HTTP error talking to the uploader or extractor.
    #[error("network error: {0}")]
    Network(String),

    /// An upstream service refused the request for a reason retrying won't fix.
    #[error("rejected by upstream (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// An external call did not answer within the per-call timeout.
    #[error("timed out after {secs}s: {operation}")]
    Timeout { operation: String, secs: u64 },

    /// Response parsing error (malformed JSON, unexpected shape).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A background worker panicked or was cancelled.
    #[error("worker error: {0}")]
    Worker(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, WorldforgeError>;

impl WorldforgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
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

    /// Whether another attempt of the same call could succeed.
    ///
    /// Input problems (validation, duplicates, missing records, config) fail
    /// the same way every time and are not retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_)
            | Self::Timeout { .. }
            | Self::Parse { .. }
            | Self::Storage(_)
            | Self::Io { .. } => true,
            Self::Upload { source, .. } | Self::Extraction { source, .. } => {
                source.is_retryable()
            }
            Self::Config { .. }
            | Self::Validation { .. }
            | Self::DuplicateTitle { .. }
            | Self::Rejected { .. }
            | Self::WorldAssembly(_)
            | Self::NotFound(_)
            | Self::Worker(_) => false,
        }
    }
}
