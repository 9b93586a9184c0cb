//! Business context for an SMTP session and for a spooled message's
//! delivery lifecycle.
//!
//! [`Context`] carries everything a session handler or command
//! interceptor needs beyond the pure protocol state already tracked by the
//! finite state machine: the peer address, TLS/authentication status,
//! free-form metadata set by embedding applications, and the envelope under
//! construction. [`DeliveryContext`] is the analogous record kept by the
//! delivery engine for a single spooled message as it is retried across
//! recipients.

use std::net::SocketAddr;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;

/// Per-connection business context.
///
/// Distinct from the FSM's own state (see `embermail_smtp::session_state`)
/// so that protocol transitions stay pure while validation results,
/// capability negotiation, and embedder-supplied metadata live here.
#[derive(Debug, Default, Clone)]
pub struct Context {
    /// Client identifier presented via EHLO/HELO.
    pub id: String,
    /// `true` once the client has negotiated ESMTP (EHLO rather than HELO).
    pub extended: bool,
    /// Mail transaction state: sender, recipients, and MAIL/RCPT parameters.
    pub envelope: Envelope,
    /// Address of the connecting peer, if known (absent for piped tests).
    pub peer: Option<SocketAddr>,
    /// Identity the session authenticated as via AUTH, if any.
    pub authenticated_as: Option<String>,
    /// `true` once STARTTLS has completed and the session is encrypted.
    pub tls_active: bool,
    /// Free-form metadata set by `CommandInterceptor`/`EventHook`
    /// implementations; never interpreted by the engine itself.
    pub metadata: AHashMap<String, String>,
    /// Opaque identifier correlating this session with spool entries and
    /// audit log lines, independent of the EHLO identifier.
    pub tracking_id: Option<String>,
}

impl Context {
    /// Returns the EHLO/HELO client identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the reverse-path (MAIL FROM) as a display string, or an
    /// empty string if no transaction is in progress or the sender is null.
    #[must_use]
    pub fn sender(&self) -> String {
        self.envelope
            .sender()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    /// Returns the accumulated forward-paths (RCPT TO) as display strings.
    #[must_use]
    pub fn recipients(&self) -> Vec<String> {
        self.envelope
            .recipients()
            .iter()
            .map(|entry| entry.address.to_string())
            .collect()
    }
}

/// Outcome of a single delivery attempt against one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Queued, not yet attempted.
    Pending,
    /// Currently claimed by a worker.
    InFlight,
    /// Accepted by the remote (or local) destination.
    Delivered,
    /// Rejected in a way that will not improve on retry.
    Failed,
    /// Retry window exhausted without a terminal response.
    Expired,
}

impl DeliveryStatus {
    /// `true` for statuses that will never transition further.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Expired)
    }

    /// `true` if this status warrants a failure DSN (`Failed` or `Expired`).
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Expired)
    }
}

/// Record of one delivery attempt for a single recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// The recipient this attempt targeted.
    pub recipient: String,
    /// Outcome of the attempt.
    pub status: DeliveryStatus,
    /// Remote server response text, if any was received.
    pub response: Option<String>,
    /// Unix timestamp (seconds) the attempt completed.
    pub attempted_at_unix: i64,
}

/// Delivery-lifecycle context tracked alongside a spooled message.
///
/// Unlike [`Context`], which lives only for the duration of an SMTP
/// session, a `DeliveryContext` persists in the spool and accumulates
/// attempts across retries, potentially spanning hours.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryContext {
    /// Spool entry identifier this context belongs to.
    pub message_id: String,
    /// Envelope sender, preserved for DSN generation.
    pub sender: Option<String>,
    /// All attempts made so far, oldest first.
    pub attempts: Vec<DeliveryAttempt>,
}

impl DeliveryContext {
    /// Appends a delivery attempt to the history.
    pub fn record(&mut self, attempt: DeliveryAttempt) {
        self.attempts.push(attempt);
    }

    /// Returns the most recent status recorded for a given recipient.
    #[must_use]
    pub fn last_status_for(&self, recipient: &str) -> Option<DeliveryStatus> {
        self.attempts
            .iter()
            .rev()
            .find(|attempt| attempt.recipient == recipient)
            .map(|attempt| attempt.status)
    }

    /// Returns `true` if every recipient has reached a terminal status.
    #[must_use]
    pub fn is_complete(&self, recipients: &[String]) -> bool {
        recipients
            .iter()
            .all(|r| self.last_status_for(r).is_some_and(DeliveryStatus::is_terminal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_defaults_empty() {
        let ctx = Context::default();
        assert_eq!(ctx.id(), "");
        assert_eq!(ctx.sender(), "");
        assert!(ctx.recipients().is_empty());
    }

    #[test]
    fn delivery_status_classification() {
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(DeliveryStatus::Expired.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(!DeliveryStatus::InFlight.is_terminal());

        assert!(DeliveryStatus::Failed.is_failure());
        assert!(DeliveryStatus::Expired.is_failure());
        assert!(!DeliveryStatus::Delivered.is_failure());
    }

    #[test]
    fn delivery_context_tracks_last_status() {
        let mut ctx = DeliveryContext {
            message_id: "01J0EXAMPLE".to_string(),
            sender: Some("sender@example.com".to_string()),
            ..Default::default()
        };

        ctx.record(DeliveryAttempt {
            recipient: "a@example.com".to_string(),
            status: DeliveryStatus::InFlight,
            response: None,
            attempted_at_unix: 1,
        });
        ctx.record(DeliveryAttempt {
            recipient: "a@example.com".to_string(),
            status: DeliveryStatus::Delivered,
            response: Some("250 OK".to_string()),
            attempted_at_unix: 2,
        });

        assert_eq!(
            ctx.last_status_for("a@example.com"),
            Some(DeliveryStatus::Delivered)
        );
        assert_eq!(ctx.last_status_for("missing@example.com"), None);
        assert!(ctx.is_complete(&["a@example.com".to_string()]));
    }
}
