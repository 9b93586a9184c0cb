//! Error types for the embermail-smtp server.
//!
//! This module provides typed error handling for SMTP server operations including
//! connection handling, TLS upgrades, and protocol operations.

use std::io;

use embermail_common::status::{EnhancedStatusCode, Status};
use thiserror::Error;

/// Errors that can occur during connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O error during connection operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error sending data to client.
    #[error("Failed to send data: {0}")]
    Send(String),

    /// Error receiving data from client.
    #[error("Failed to receive data: {0}")]
    Receive(String),

    /// Connection was closed by peer.
    #[error("Connection closed by peer")]
    Closed,

    /// Formatting error while preparing response.
    #[error("Response formatting error: {0}")]
    Format(#[from] std::fmt::Error),
}

/// Errors that can occur during TLS operations.
#[derive(Debug, Error)]
pub enum TlsError {
    /// I/O error during TLS operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to load TLS certificate.
    #[error("Failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to load TLS private key.
    #[error("Failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// A negotiated session is missing protocol info rustls should always
    /// populate post-handshake.
    #[error("negotiated connection is missing {0}")]
    ProtocolInfoMissing(String),

    /// TLS handshake or upgrade failed.
    #[error("TLS upgrade failed: {0}")]
    UpgradeFailed(String),

    /// Rustls library error.
    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

/// Specialized `Result` type for connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Specialized `Result` type for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// A single typed, coded error a command handler raises. The dispatcher maps
/// this to exactly one wire response; `close` marks responses that must be
/// followed by closing the connection (fatal / anti-injection cases).
#[derive(Debug, Error)]
#[error("{status} {message}")]
pub struct CommandError {
    pub status: Status,
    pub enhanced: Option<EnhancedStatusCode>,
    pub message: String,
    pub close: bool,
}

impl CommandError {
    #[must_use]
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            enhanced: None,
            message: message.into(),
            close: false,
        }
    }

    #[must_use]
    pub const fn with_enhanced(mut self, enhanced: EnhancedStatusCode) -> Self {
        self.enhanced = Some(enhanced);
        self
    }

    #[must_use]
    pub const fn closing(mut self) -> Self {
        self.close = true;
        self
    }

    /// syntax (500/501/555): the command line itself is malformed.
    #[must_use]
    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(Status::SyntaxError, message)
            .with_enhanced(EnhancedStatusCode::SYNTAX_ERROR)
    }

    /// sequence (503): the command is not valid in the current state.
    #[must_use]
    pub fn sequence(message: impl Into<String>) -> Self {
        Self::new(Status::InvalidCommandSequence, message)
            .with_enhanced(EnhancedStatusCode::INVALID_COMMAND)
    }

    /// policy (530/553/5.7.x): rejected by configured policy (auth required,
    /// relay denied).
    #[must_use]
    pub fn policy(status: Status, message: impl Into<String>) -> Self {
        Self::new(status, message).with_enhanced(EnhancedStatusCode::POLICY_REJECTED)
    }

    /// quota (452/552): size or recipient-count limit exceeded.
    #[must_use]
    pub fn quota(status: Status, message: impl Into<String>) -> Self {
        Self::new(status, message).with_enhanced(EnhancedStatusCode::MESSAGE_TOO_BIG)
    }

    /// recipients (452): the per-transaction recipient cap was reached.
    #[must_use]
    pub fn too_many_recipients(message: impl Into<String>) -> Self {
        Self::new(Status::TooManyRecipients, message).with_enhanced(EnhancedStatusCode::TOO_MANY_RECIPIENTS)
    }

    /// transient-local (451): a local, retryable failure while processing.
    #[must_use]
    pub fn transient_local(message: impl Into<String>) -> Self {
        Self::new(Status::ActionUnavailable, message)
    }

    pub const fn is_permanent(&self) -> bool {
        self.status.is_permanent()
    }

    pub const fn is_temporary(&self) -> bool {
        self.status.is_temporary()
    }
}

/// Errors raised while conducting an AUTH PLAIN/LOGIN exchange.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("client cancelled the exchange")]
    Cancelled,
    #[error("response was not valid base64")]
    NotBase64,
    #[error("decoded response was not valid UTF-8")]
    NotUtf8,
    #[error("PLAIN response did not contain the expected NUL-separated fields")]
    MalformedPlain,
    #[error("credentials rejected")]
    InvalidCredentials,
    #[error("too many failed attempts, locked out for {remaining_secs}s")]
    LockedOut { remaining_secs: u64 },
}

impl AuthError {
    /// Whether this should be reported as a hard credential failure (535)
    /// rather than a lockout (454).
    #[must_use]
    pub const fn is_credential_failure(&self) -> bool {
        !matches!(self, Self::LockedOut { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::Send("timeout".to_string());
        assert_eq!(err.to_string(), "Failed to send data: timeout");

        let err = ConnectionError::Closed;
        assert_eq!(err.to_string(), "Connection closed by peer");
    }

    #[test]
    fn test_tls_error_display() {
        let err = TlsError::KeyLoad {
            path: "/path/to/key.pem".to_string(),
            reason: "invalid format".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to load TLS private key from /path/to/key.pem: invalid format"
        );

        let err = TlsError::UpgradeFailed("handshake error".to_string());
        assert_eq!(err.to_string(), "TLS upgrade failed: handshake error");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        let conn_err: ConnectionError = io_err.into();
        assert!(matches!(conn_err, ConnectionError::Io(_)));
    }

    #[test]
    fn test_format_error_conversion() {
        let fmt_err = std::fmt::Error;
        let conn_err: ConnectionError = fmt_err.into();
        assert!(matches!(conn_err, ConnectionError::Format(_)));
    }
}
