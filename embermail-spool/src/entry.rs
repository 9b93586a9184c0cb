//! Durable spool entry types: what the transaction processor submits, and
//! what a [`crate::backend::BackingStore`] persists and hands back to the
//! delivery service.

use std::{
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use embermail_common::envelope::{DsnReturn, RecipientEntry};
use serde::{Deserialize, Serialize};

use crate::types::SpooledMessageId;

/// Current Unix timestamp in seconds, saturating to `0` on clock errors.
#[must_use]
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// A recipient together with the locality classification the transaction
/// processor assigned it at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientDisposition {
    pub entry: RecipientEntry,
    /// Whether `entry.address`'s domain matched a configured local domain.
    pub local: bool,
}

/// What the transaction processor hands the spool once a message's body has
/// been fully received and written to a temporary file. The backing store
/// turns this into a durable [`SpoolEntry`] by assigning an id and an
/// initial retry schedule.
#[derive(Debug, Clone)]
pub struct SpoolSubmission {
    /// The envelope sender; `None` for the null reverse-path (`MAIL FROM:<>`).
    pub sender: Option<String>,
    pub recipients: Vec<RecipientDisposition>,
    /// Path to the raw, already-persisted message bytes.
    pub message_path: PathBuf,
    pub message_len: usize,
    /// The session's HELO/EHLO identifier.
    pub client_id: String,
    pub authenticated_as: Option<String>,
    pub ret: Option<DsnReturn>,
    pub envid: Option<String>,
    pub received_at_unix: i64,
}

/// Per-recipient delivery progress, updated in place as delivery attempts
/// are made against an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientStatus {
    pub disposition: RecipientDisposition,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    Pending,
    Delivered,
    PermanentFailure,
}

/// A durable record: everything needed to resume or retry delivery after a
/// process restart. Metadata is serialized alongside the raw message bytes
/// under the same [`SpooledMessageId`] stem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolEntry {
    pub id: SpooledMessageId,
    pub sender: Option<String>,
    pub recipients: Vec<RecipientStatus>,
    pub message_path: PathBuf,
    pub message_len: usize,
    pub client_id: String,
    pub authenticated_as: Option<String>,
    pub ret: Option<DsnReturn>,
    pub envid: Option<String>,
    pub received_at_unix: i64,
    pub attempts: u32,
    pub next_attempt_at_unix: i64,
}

impl SpoolEntry {
    /// Builds a fresh entry from a submission, due for first attempt now.
    #[must_use]
    pub fn from_submission(id: SpooledMessageId, submission: SpoolSubmission) -> Self {
        let recipients = submission
            .recipients
            .into_iter()
            .map(|disposition| RecipientStatus {
                disposition,
                outcome: DeliveryOutcome::Pending,
            })
            .collect();

        Self {
            id,
            sender: submission.sender,
            recipients,
            message_path: submission.message_path,
            message_len: submission.message_len,
            client_id: submission.client_id,
            authenticated_as: submission.authenticated_as,
            ret: submission.ret,
            envid: submission.envid,
            received_at_unix: submission.received_at_unix,
            attempts: 0,
            next_attempt_at_unix: submission.received_at_unix,
        }
    }

    /// Recipients still awaiting a terminal delivery outcome.
    pub fn pending_recipients(&self) -> impl Iterator<Item = &RecipientStatus> {
        self.recipients
            .iter()
            .filter(|r| r.outcome == DeliveryOutcome::Pending)
    }

    #[must_use]
    pub fn is_fully_resolved(&self) -> bool {
        self.recipients
            .iter()
            .all(|r| r.outcome != DeliveryOutcome::Pending)
    }
}

#[cfg(test)]
mod tests {
    use embermail_common::{address::Address, envelope::NotifyFlags};

    use super::*;

    fn recipient(addr: &str, local: bool) -> RecipientDisposition {
        let mailbox = mailparse::addrparse(addr).unwrap().remove(0);
        RecipientDisposition {
            entry: RecipientEntry {
                address: Address::from(mailbox),
                notify: NotifyFlags::default_on_failure(),
                orcpt: None,
            },
            local,
        }
    }

    #[test]
    fn from_submission_marks_all_recipients_pending() {
        let submission = SpoolSubmission {
            sender: Some("sender@example.com".to_string()),
            recipients: vec![recipient("alice@example.com", true)],
            message_path: PathBuf::from("/tmp/does-not-matter.eml"),
            message_len: 42,
            client_id: "client.example.com".to_string(),
            authenticated_as: None,
            ret: None,
            envid: None,
            received_at_unix: now_unix(),
        };

        let entry = SpoolEntry::from_submission(SpooledMessageId::generate(), submission);
        assert_eq!(entry.attempts, 0);
        assert!(!entry.is_fully_resolved());
        assert_eq!(entry.pending_recipients().count(), 1);
    }
}
