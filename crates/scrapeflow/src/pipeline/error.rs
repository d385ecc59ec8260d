use std::path::PathBuf;

use thiserror::Error;

use crate::db::DatabaseError;
use crate::error::{ArtifactError, StorageError};

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Job outcome has no artifact to persist")]
    NoArtifact,

    #[error("Artifact could not be parsed: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Database write failed: {0}")]
    Database(#[from] DatabaseError),
}

impl PersistError {
    /// A malformed artifact stays malformed; only database hiccups are worth
    /// another attempt. Inserts are keyed by natural key, so retries are safe.
    pub fn is_retryable(&self) -> bool {
        match self {
            PersistError::Database(e) => e.is_retryable(),
            PersistError::NoArtifact | PersistError::Artifact(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Nothing to archive in '{0}'")]
    EmptySource(PathBuf),

    #[error("Archive I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No free archive name for '{0}'")]
    NameExhausted(String),

    #[error("Zip packaging failed: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Upload failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Archive bookkeeping failed: {0}")]
    Database(#[from] DatabaseError),

    #[error("Archive metadata encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl ArchiveError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ArchiveError::Io { .. } | ArchiveError::Zip(_) => true,
            ArchiveError::Storage(e) => e.is_retryable(),
            ArchiveError::Database(e) => e.is_retryable(),
            ArchiveError::EmptySource(_)
            | ArchiveError::NameExhausted(_)
            | ArchiveError::Json(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineWarning {
    ArtifactCleanupFailed { path: String, error: String },
    ChildArtifactSkipped { path: String, error: String },
    ItemRejected { key: Option<String>, error: String },
}
