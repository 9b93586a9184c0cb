//! The outbound relay seam: everything the delivery service needs to hand a
//! single recipient off to a collaborator that actually speaks SMTP to the
//! outside world. This crate never dials a socket itself; a relay is
//! supplied by the embedder.

use std::path::PathBuf;

use async_trait::async_trait;
use embermail_common::status::{EnhancedStatusCode, Status};

use crate::error::DeliveryError;

/// Everything a [`MailRelay`] needs to attempt delivery of one message to
/// one recipient.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    /// The HELO/EHLO identifier of the original receiving session.
    pub client_id: String,
    /// The envelope sender; `None` for the null reverse-path.
    pub sender: Option<String>,
    /// The single recipient this attempt targets.
    pub recipient: String,
    /// Path to the raw message bytes on disk.
    pub message_path: PathBuf,
}

/// The result of one relay attempt against one recipient.
#[derive(Debug, Clone)]
pub enum RelayOutcome {
    /// The remote server accepted the message for this recipient.
    Accepted,
    /// The remote server (or a local policy check) rejected the recipient
    /// permanently; retrying will not help.
    Permanent {
        status: Status,
        code: EnhancedStatusCode,
        reason: String,
    },
    /// The remote server rejected the recipient temporarily, or the attempt
    /// failed for a reason that may succeed on retry.
    Transient {
        status: Status,
        code: EnhancedStatusCode,
        reason: String,
    },
}

/// Outbound SMTP relay seam. Implementations own MX resolution, connection
/// pooling, and TLS — none of which this crate concerns itself with.
#[async_trait]
pub trait MailRelay: Send + Sync {
    /// Attempt delivery of one recipient. Returns `Err` only for errors that
    /// are not a property of the recipient or message (e.g. the relay
    /// itself is unreachable or misconfigured); recipient-level and
    /// message-level failures are reported via [`RelayOutcome`].
    async fn relay(&self, request: RelayRequest) -> Result<RelayOutcome, DeliveryError>;
}
