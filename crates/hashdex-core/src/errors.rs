//! Error types for the hashdex core library.

use std::path::PathBuf;

/// Top-level error enum for the hashdex core library.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Unknown index kind: {0}")]
    UnknownKind(String),

    #[error("Index kind {0} is being rebuilt and cannot be read")]
    RebuildPending(String),

    #[error("Export failed for {path}: {message}")]
    Export { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl IndexError {
    /// True for faults of a persistent table (as opposed to bad input or
    /// programming errors). Callers recover from these by rebuilding the
    /// affected index kind.
    pub fn is_storage_fault(&self) -> bool {
        matches!(
            self,
            IndexError::Storage(_) | IndexError::Sqlite(_) | IndexError::Io(_)
        )
    }
}

pub type IndexResult<T> = Result<T, IndexError>;
