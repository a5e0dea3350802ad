//! Error types for the push crate.

use thiserror::Error;

/// Result type alias for push operations.
pub type Result<T> = std::result::Result<T, PushError>;

/// How a failed delivery should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushRetryClass {
    /// Transient failure; retry the update later.
    Retryable,
    /// The device token is gone; drop its registration.
    DropRegistration,
    /// Malformed request; retrying will not help.
    Permanent,
}

/// Errors that can occur while delivering push messages.
#[derive(Debug, Error)]
pub enum PushError {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Error response from the push service
    #[error("push service error ({status}): {message}")]
    Service { status: u16, message: String },

    /// Invalid request (bad token format, oversized payload, ...)
    #[error("invalid push request: {0}")]
    InvalidRequest(String),
}

impl PushError {
    pub fn service(status: u16, message: impl Into<String>) -> Self {
        Self::Service {
            status,
            message: message.into(),
        }
    }

    /// Classify for retry policy. `UNREGISTERED` and `SENDER_ID_MISMATCH`
    /// mean the token will never work again.
    pub fn retry_class(&self) -> PushRetryClass {
        match self {
            Self::Service { status, message } => {
                if message.contains("UNREGISTERED") || message.contains("SENDER_ID_MISMATCH") {
                    return PushRetryClass::DropRegistration;
                }
                match *status {
                    404 | 410 => PushRetryClass::DropRegistration,
                    408 | 429 | 500..=599 => PushRetryClass::Retryable,
                    _ => PushRetryClass::Permanent,
                }
            }
            Self::Http(_) => PushRetryClass::Retryable,
            Self::InvalidRequest(_) => PushRetryClass::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_token_drops_registration() {
        let err = PushError::service(400, "error UNREGISTERED for token");
        assert_eq!(err.retry_class(), PushRetryClass::DropRegistration);
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = PushError::service(503, "unavailable");
        assert_eq!(err.retry_class(), PushRetryClass::Retryable);
    }
}
