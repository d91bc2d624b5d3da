//! Error types for strata.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Main error type for strata.
#[derive(Error, Debug)]
pub enum StrataError {
    // Pipeline errors
    #[error(transparent)]
    Parse(#[from] crate::builder::parser::ParseError),

    #[error(transparent)]
    Graph(#[from] crate::builder::graph::GraphError),

    #[error(transparent)]
    Build(#[from] crate::builder::executor::BuildError),

    #[error(transparent)]
    Cache(#[from] crate::builder::store::CacheError),

    // Image errors
    #[error("Image not found: {image}")]
    ImageNotFound { image: String },

    #[error("Ambiguous image reference '{image}' ({count} matches)")]
    AmbiguousImage { image: String, count: usize },

    #[error("Invalid image descriptor at {path:?}: {reason}")]
    InvalidDescriptor { path: PathBuf, reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification of an error, used to pick CLI exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The pipeline text itself is invalid
    Definition,
    /// The pipeline is well formed but references something that cannot
    /// be resolved
    Resolution,
    /// A stage was executed and failed
    Execution,
    /// The snapshot store misbehaved
    Cache,
    Internal,
}

impl ErrorKind {
    /// Validation problems exit with 2, runtime failures with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Definition | ErrorKind::Resolution => 2,
            _ => 1,
        }
    }
}

impl StrataError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Create an IoError with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError {
            path: path.into(),
            source,
        }
    }

    /// Classify this error for exit-code selection.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse(_) | Self::Graph(_) => ErrorKind::Definition,
            Self::Build(err) => err.kind(),
            Self::Cache(_) => ErrorKind::Cache,
            Self::ImageNotFound { .. } | Self::AmbiguousImage { .. } => ErrorKind::Resolution,
            Self::InvalidConfig { .. } => ErrorKind::Definition,
            Self::InvalidDescriptor { .. } | Self::IoError { .. } => ErrorKind::Internal,
            Self::Internal(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }
}
