//! Error types for sqm-store.

use std::path::PathBuf;

/// Result type for sqm-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in sqm-store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Failed to create a cache directory.
    #[error("Failed to create cache directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write a cache entry.
    #[error("Failed to write cache entry {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to remove a cache entry.
    #[error("Failed to remove cache entry {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
