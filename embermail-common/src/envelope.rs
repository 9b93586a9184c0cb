//! Mail envelope: reverse-path, forward-paths, and the ESMTP parameters
//! negotiated with them (SIZE, BODY, SMTPUTF8, RET, ENVID, NOTIFY, ORCPT).

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// Declared `BODY=` parameter on MAIL FROM (RFC 6152).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BodyType {
    /// No BODY parameter was given; 7-bit data assumed.
    #[default]
    SevenBit,
    /// `BODY=8BITMIME`.
    EightBitMime,
    /// `BODY=BINARYMIME` (RFC 3030), only legal alongside CHUNKING/BDAT.
    Binarymime,
}

/// Declared `RET=` parameter on MAIL FROM (RFC 3461), controlling how much
/// of a bounced message a DSN should quote back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DsnReturn {
    /// `RET=FULL`: quote the entire original message.
    Full,
    /// `RET=HDRS`: quote headers only.
    Headers,
}

/// Per-recipient `NOTIFY=` flags (RFC 3461 section 4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotifyFlags {
    /// `NEVER` — suppress all DSNs for this recipient. Mutually exclusive
    /// with the other three flags; callers enforce that at parse time.
    pub never: bool,
    pub success: bool,
    pub failure: bool,
    pub delay: bool,
}

impl NotifyFlags {
    /// The RFC 3461 default when no NOTIFY parameter is given: a DSN on
    /// failure only.
    #[must_use]
    pub const fn default_on_failure() -> Self {
        Self {
            never: false,
            success: false,
            failure: true,
            delay: false,
        }
    }

    #[must_use]
    pub const fn wants_failure(self) -> bool {
        !self.never && self.failure
    }

    #[must_use]
    pub const fn wants_success(self) -> bool {
        !self.never && self.success
    }

    #[must_use]
    pub const fn wants_delay(self) -> bool {
        !self.never && self.delay
    }
}

/// Parameters accepted on the MAIL FROM command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailParameters {
    /// `SIZE=` — the client's declared message size in octets.
    pub size: Option<usize>,
    /// `BODY=` — defaults to 7-bit when absent.
    pub body: BodyType,
    /// `SMTPUTF8` — internationalized mailbox/header support requested.
    pub smtputf8: bool,
    /// `RET=` — DSN content preference.
    pub ret: Option<DsnReturn>,
    /// `ENVID=` — opaque envelope identifier echoed back in DSNs.
    pub envid: Option<String>,
}

/// A single accepted forward-path along with its RCPT TO parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientEntry {
    pub address: Address,
    /// `NOTIFY=` flags; defaults to failure-only per RFC 3461.
    pub notify: NotifyFlags,
    /// `ORCPT=` — original recipient, for DSNs traversing an alias/forward.
    pub orcpt: Option<String>,
}

/// Mail transaction state: sender, recipients, and negotiated parameters.
///
/// Tracks the running count of message-body octets received so far so the
/// session can enforce the declared `SIZE=` (or the server's configured
/// maximum) without buffering the whole message first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    sender: Option<Address>,
    mail_parameters: MailParameters,
    recipients: Vec<RecipientEntry>,
    received_bytes: usize,
}

impl Envelope {
    /// Returns a reference to the envelope sender, if MAIL FROM has been
    /// accepted. `None` both before MAIL FROM and for the null reverse-path
    /// (`MAIL FROM:<>`).
    #[inline]
    #[must_use]
    pub const fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    /// Returns a mutable handle to the sender slot.
    #[inline]
    #[must_use]
    pub const fn sender_mut(&mut self) -> &mut Option<Address> {
        &mut self.sender
    }

    /// Returns the parameters negotiated on MAIL FROM.
    #[inline]
    #[must_use]
    pub const fn mail_parameters(&self) -> &MailParameters {
        &self.mail_parameters
    }

    /// Returns a mutable handle to the MAIL FROM parameters.
    #[inline]
    #[must_use]
    pub const fn mail_parameters_mut(&mut self) -> &mut MailParameters {
        &mut self.mail_parameters
    }

    /// Returns the recipients accumulated so far via RCPT TO.
    #[inline]
    #[must_use]
    pub fn recipients(&self) -> &[RecipientEntry] {
        &self.recipients
    }

    /// Adds a recipient accepted via RCPT TO.
    pub fn push_recipient(&mut self, entry: RecipientEntry) {
        self.recipients.push(entry);
    }

    /// Number of recipients accepted in the current transaction.
    #[inline]
    #[must_use]
    pub fn recipient_count(&self) -> usize {
        self.recipients.len()
    }

    /// The declared message size from `SIZE=`, if the client sent one.
    #[inline]
    #[must_use]
    pub const fn declared_size(&self) -> Option<usize> {
        self.mail_parameters.size
    }

    /// Bytes of message data received so far during DATA/BDAT.
    #[inline]
    #[must_use]
    pub const fn received_bytes(&self) -> usize {
        self.received_bytes
    }

    /// Adds to the running received-byte count, returning the new total.
    pub const fn add_received_bytes(&mut self, n: usize) -> usize {
        self.received_bytes += n;
        self.received_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_parser;

    fn addr(path: &str) -> Address {
        let mailbox = address_parser::parse_forward_path(path).unwrap();
        Address::from(
            mailparse::addrparse(&mailbox.to_string())
                .unwrap()
                .remove(0),
        )
    }

    #[test]
    fn empty_envelope_has_no_sender_or_recipients() {
        let envelope = Envelope::default();
        assert!(envelope.sender().is_none());
        assert_eq!(envelope.recipient_count(), 0);
        assert_eq!(envelope.declared_size(), None);
    }

    #[test]
    fn tracks_sender_and_recipients() {
        let mut envelope = Envelope::default();
        *envelope.sender_mut() = Some(addr("<sender@example.com>"));
        envelope.push_recipient(RecipientEntry {
            address: addr("<rcpt@example.com>"),
            notify: NotifyFlags::default_on_failure(),
            orcpt: None,
        });

        assert!(envelope.sender().is_some());
        assert_eq!(envelope.recipient_count(), 1);
    }

    #[test]
    fn tracks_declared_size_and_received_bytes() {
        let mut envelope = Envelope::default();
        envelope.mail_parameters_mut().size = Some(1024);
        assert_eq!(envelope.declared_size(), Some(1024));

        assert_eq!(envelope.add_received_bytes(100), 100);
        assert_eq!(envelope.add_received_bytes(50), 150);
        assert_eq!(envelope.received_bytes(), 150);
    }

    #[test]
    fn notify_flags_default_is_failure_only() {
        let flags = NotifyFlags::default_on_failure();
        assert!(flags.wants_failure());
        assert!(!flags.wants_success());
        assert!(!flags.wants_delay());
    }

    #[test]
    fn notify_never_suppresses_all() {
        let flags = NotifyFlags {
            never: true,
            success: true,
            failure: true,
            delay: true,
        };
        assert!(!flags.wants_failure());
        assert!(!flags.wants_success());
        assert!(!flags.wants_delay());
    }
}
