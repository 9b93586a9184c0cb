//! Typed error handling for delivery operations.
//!
//! Distinguishes permanent failures (5xx, don't retry) from temporary ones
//! (4xx, retry with backoff) from system errors (spool I/O, internal bugs).

use thiserror::Error;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Permanent failure that should not be retried.
    #[error("permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// Temporary failure that can be retried with backoff.
    #[error("temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    /// System-level error (I/O, spool, internal).
    #[error("system error: {0}")]
    System(#[from] SystemError),
}

/// Permanent errors that should not be retried.
#[derive(Debug, Error)]
pub enum PermanentError {
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("message rejected: {0}")]
    MessageRejected(String),

    #[error("message too large: {0}")]
    MessageTooLarge(String),
}

/// Temporary errors that should be retried with exponential backoff.
#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("server busy: {0}")]
    ServerBusy(String),

    #[error("rate limited, retry after {0:?}")]
    RateLimited(std::time::Duration),

    #[error("temporary SMTP error: {0}")]
    SmtpTemporary(String),
}

/// System-level errors that indicate internal problems rather than a
/// recipient- or message-specific outcome.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("spool error: {0}")]
    Spool(#[from] embermail_spool::error::SpoolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no route for recipient: {0}")]
    NoRoute(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Returns `true` if this error is permanent and should not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Returns `true` if this is a system error.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_predicates_are_mutually_exclusive() {
        let error = DeliveryError::Temporary(TemporaryError::ServerBusy("busy".to_string()));
        assert!(error.is_temporary());
        assert!(!error.is_permanent());
        assert!(!error.is_system());

        let error = DeliveryError::Permanent(PermanentError::InvalidRecipient(
            "user@example.com".to_string(),
        ));
        assert!(error.is_permanent());
        assert!(!error.is_temporary());

        let error = DeliveryError::System(SystemError::Internal("oops".to_string()));
        assert!(error.is_system());
        assert!(!error.is_permanent());
    }

    #[test]
    fn spool_error_converts_to_system() {
        let spool_err = embermail_spool::error::SpoolError::Internal("lock poisoned".to_string());
        let error: DeliveryError = SystemError::from(spool_err).into();
        assert!(error.is_system());
    }
}
