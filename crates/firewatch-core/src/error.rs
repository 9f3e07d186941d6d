//! Errors raised while turning wire scalars and stored hashes into domain values.

use thiserror::Error;

/// A field that could not become a domain value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The field parsed but its value is unusable
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },

    /// The field could not be parsed at all
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

impl DomainError {
    /// Creates a parse error for the named field.
    pub fn parse(field: &str, reason: impl std::fmt::Display) -> Self {
        Self::ParseError {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result alias for conversions in this crate.
pub type DomainResult<T> = Result<T, DomainError>;
