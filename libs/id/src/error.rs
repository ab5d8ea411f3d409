//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing its separator.
    #[error("ID missing '{0}' separator")]
    MissingSeparator(char),

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// The UUID portion of a volume ID is invalid.
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),

    /// A run spec path segment violates the naming rules.
    #[error("invalid path segment '{segment}': {message}")]
    InvalidSegment { segment: String, message: String },

    /// The ID format is invalid.
    #[error("invalid ID format: {message}")]
    InvalidFormat { message: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error indicates a prefix mismatch.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }

    pub(crate) fn format(message: impl Into<String>) -> Self {
        IdError::InvalidFormat {
            message: message.into(),
        }
    }
}
