//! Error types for endpoint parsing.

use thiserror::Error;

/// Errors that can occur when parsing an endpoint string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// The endpoint string is empty.
    #[error("endpoint cannot be empty")]
    Empty,

    /// Wrong number of `:`-separated tokens.
    #[error("expected host:port or host:port:username:password, got {count} field(s)")]
    FieldCount { count: usize },

    /// The host token is empty.
    #[error("endpoint host cannot be empty")]
    EmptyHost,

    /// The port token is not a port number in 1..=65535.
    #[error("invalid port '{value}': expected a number between 1 and 65535")]
    InvalidPort { value: String },
}

impl FormatError {
    /// Returns true if this error is about the shape of the input rather than
    /// the value of a single field.
    pub fn is_shape_error(&self) -> bool {
        matches!(self, FormatError::Empty | FormatError::FieldCount { .. })
    }
}
