//! Error types for the devatlas server.
//!
//! One crate-wide enum: every subsystem reports through [`Error`], and the
//! variants preserve the recovery classification (transient vs fatal) that
//! the indexer and agent runtime act on.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level server error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Path not reachable: {path}: {source}")]
    PathUnreachable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File too large: {path} ({size} bytes)")]
    FileTooLarge { path: PathBuf, size: u64 },

    #[error("Unsupported file type: {0}")]
    Unsupported(PathBuf),

    #[error("Embedding request failed (transient): {0}")]
    EmbeddingTransient(String),

    #[error("Embedding request failed: {0}")]
    EmbeddingFatal(String),

    #[error("Vector store unreachable: {0}")]
    VectorUnavailable(String),

    #[error("Vector store rejected request: {0}")]
    VectorRejected(String),

    #[error("Metadata conflict: {0}")]
    MetadataConflict(String),

    #[error("Metadata store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Completion provider error: {0}")]
    Provider(String),

    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    #[error("Tool '{tool}' repeated {count} identical calls; refusing further retries")]
    LoopDetected { tool: String, count: u32 },

    #[error("{what} timed out after {seconds}s")]
    Timeout { what: String, seconds: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for failures worth retrying with backoff (network blips,
    /// temporarily unreachable services). Fatal classifications and
    /// logic errors return false.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingTransient(_) | Self::VectorUnavailable(_)
        )
    }

    /// Returns a machine-readable error code for tool results and frames.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_INVALID",
            Self::PathUnreachable { .. } => "PATH_UNREACHABLE",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::Unsupported(_) => "UNSUPPORTED_FILE",
            Self::EmbeddingTransient(_) => "EMBEDDING_TRANSIENT",
            Self::EmbeddingFatal(_) => "EMBEDDING_FATAL",
            Self::VectorUnavailable(_) => "VECTOR_UNAVAILABLE",
            Self::VectorRejected(_) => "VECTOR_REJECTED",
            Self::MetadataConflict(_) => "METADATA_CONFLICT",
            Self::Store(_) => "STORE_ERROR",
            Self::Provider(_) => "PROVIDER_ERROR",
            Self::Tool { .. } => "TOOL_FAILURE",
            Self::LoopDetected { .. } => "LOOP_DETECTED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::EmbeddingTransient("503".into()).is_transient());
        assert!(Error::VectorUnavailable("connect refused".into()).is_transient());
        assert!(!Error::EmbeddingFatal("bad response".into()).is_transient());
        assert!(!Error::VectorRejected("dim mismatch".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Cancelled.code(), "CANCELLED");
        assert_eq!(
            Error::Timeout { what: "tool".into(), seconds: 30 }.code(),
            "TIMEOUT"
        );
    }
}
