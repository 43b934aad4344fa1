//! Error types for flowrun
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Flowrun error types
#[derive(Error, Debug)]
pub enum Error {
    /// Bad graph, reference or definition, rejected before anything runs
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation not legal in the experiment's current status
    #[error("Experiment {name} is {status}")]
    InvalidState {
        /// Experiment name
        name: String,
        /// Current status, rendered as its display name
        status: String,
    },

    /// Lookup of an unknown experiment or run
    #[error("Not found: {0}")]
    NotFound(String),

    /// A line exceeded its execution budget; the worker was killed
    #[error("Line {line_number} timed out after {timeout:?}; worker terminated")]
    WorkerTimeout {
        /// Line that was executing
        line_number: usize,
        /// Configured per-line timeout
        timeout: Duration,
    },

    /// The isolated worker died or broke protocol while running a line
    #[error("Worker crashed: {0}")]
    WorkerCrash(String),

    /// Replay mode found no recording for this call (never falls back to live)
    #[error("No recorded result for tool '{tool}' (key {key}, occurrence {occurrence})\nRe-run in recording mode to capture it.")]
    RecordNotFound {
        /// Tool identity
        tool: String,
        /// Call key (`sha256:<hex>`)
        key: String,
        /// Occurrence index within the logical run
        occurrence: u64,
    },

    /// Call-store lock could not be acquired in time
    #[error("Lock {path} still held after {waited:?}")]
    LockContention {
        /// Lock file path
        path: PathBuf,
        /// How long acquisition waited
        waited: Duration,
    },

    /// Work was canceled before it finished
    #[error("Canceled")]
    Canceled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Payload-free classification of an [`Error`].
///
/// Per-line and per-node failure records carry the kind so callers can
/// branch on it after the original error has been rendered to text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// See [`Error::Validation`]
    Validation,
    /// See [`Error::InvalidState`]
    InvalidState,
    /// See [`Error::NotFound`]
    NotFound,
    /// See [`Error::WorkerTimeout`]
    WorkerTimeout,
    /// See [`Error::WorkerCrash`]
    WorkerCrash,
    /// See [`Error::RecordNotFound`]
    RecordNotFound,
    /// See [`Error::LockContention`]
    LockContention,
    /// See [`Error::Canceled`]
    Canceled,
    /// IO failures
    Io,
    /// JSON failures
    Json,
    /// Anything else, including errors raised by flow or tool code
    Other,
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::WorkerTimeout { .. } => ErrorKind::WorkerTimeout,
            Self::WorkerCrash(_) => ErrorKind::WorkerCrash,
            Self::RecordNotFound { .. } => ErrorKind::RecordNotFound,
            Self::LockContention { .. } => ErrorKind::LockContention,
            Self::Canceled => ErrorKind::Canceled,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Json,
            Self::Other(_) => ErrorKind::Other,
        }
    }
}
