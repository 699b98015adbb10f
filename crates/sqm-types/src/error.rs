//! Error types for value parsing in sqm-types.

use thiserror::Error;

/// Errors that can occur when parsing SQM values from text.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The string is not a recognised local datetime.
    #[error("Invalid datetime: '{0}'")]
    InvalidDatetime(String),

    /// The string is not a `YYYY-MM-DD` date.
    #[error("Invalid date: '{0}'")]
    InvalidDate(String),

    /// The string is not a numeric reading value.
    #[error("Invalid reading value: '{0}'")]
    InvalidValue(String),

    /// Unknown twilight type.
    #[error("Invalid twilight type: '{0}' (expected civil, nautical, astronomical or night)")]
    InvalidTwilight(String),

    /// The string is not a UTC offset.
    #[error("Invalid UTC offset: '{0}'")]
    InvalidOffset(String),
}

/// Result type alias using sqm-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
