//! Error types shared across the CareSync crates.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the synchronization and access-control engine.
///
/// `Forbidden` deliberately covers both "subject does not exist" and "subject
/// exists but is not accessible"; callers must not be able to distinguish the
/// two.
#[derive(Debug, Error)]
pub enum Error {
    /// Access denied, or the target does not exist for this caller.
    #[error("{0}")]
    Forbidden(String),

    /// Structurally invalid input (malformed action, unknown field, ...).
    #[error("{0}")]
    IllegalInput(String),

    /// A table or registration does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Storage-layer failure. Not retried; logged and propagated.
    #[error("database error: {0}")]
    Database(String),
}

impl Error {
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn illegal_input(message: impl Into<String>) -> Self {
        Self::IllegalInput(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    /// The single denial used for subject lookups. The message must not leak
    /// whether the subject exists.
    pub fn subject_forbidden(subject: &str) -> Self {
        Self::Forbidden(format!(
            "user {} not found or access forbidden",
            subject
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_denial_does_not_reveal_existence() {
        let missing = Error::subject_forbidden("nobody");
        let hidden = Error::subject_forbidden("nobody");
        assert_eq!(missing.to_string(), hidden.to_string());
    }
}
