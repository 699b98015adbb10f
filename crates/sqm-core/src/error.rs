//! Error types for sqm-core.
//!
//! Most failures inside the engine are not errors at all: an unparseable data
//! file is logged and skipped, a busy cache lock makes the process read-only,
//! and a corrupt cache entry reads as a miss. What remains is reported through
//! [`Error`].
//!
//! | Error | Typical cause | Handling |
//! |-------|---------------|----------|
//! | [`Error::Store`] | Cache directory not writable | Fault, see [`Error::is_fault`] |
//! | [`Error::Io`] | Data file vanished or unreadable | Skipped during reconciliation, else a fault |
//! | [`Error::InvalidDataFile`] | No `msas` header or no readings | Skipped during scans |
//! | [`Error::UnknownStation`] | Bad station id in a query | Report to the caller |
//! | [`Error::Internal`] | A fault caught by [`crate::StationRegistry::guard`] | Cache optionally cleared |

use std::path::PathBuf;

use crate::config::ConfigError;

/// Result type for sqm-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in sqm-core.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Error from the cache storage layer.
    #[error("Cache error: {0}")]
    Store(#[from] sqm_store::Error),

    /// Failed to read a data file or directory.
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file is not a parseable SQM data file.
    #[error("Not a valid SQM data file {path}: {reason}")]
    InvalidDataFile { path: PathBuf, reason: String },

    /// A value in a query could not be parsed.
    #[error("Invalid value: {0}")]
    Parse(#[from] sqm_types::ParseError),

    /// No station with this id exists under the data root.
    #[error("Unknown station: {0}")]
    UnknownStation(String),

    /// The data root does not exist or is not a directory.
    #[error("Data directory not found: {0}")]
    DataDirectory(PathBuf),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A failure whose details are kept out of responses.
    #[error("Internal error")]
    Internal,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true for failures of the cache or the filesystem, as opposed
    /// to a bad request or bad configuration.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Io { .. } | Self::Internal)
    }

    pub(crate) fn invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidDataFile {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
