//! The delivery service: turns one claimed [`SpoolEntry`] into a terminal
//! action against the backing store (complete, reschedule, or fail
//! permanently) by attempting each still-pending recipient in turn.

use std::sync::Arc;

use embermail_common::domain::Domain;
use embermail_spool::{backend::BackingStore, entry::SpoolEntry};

use crate::{
    config::RetryPolicy,
    dsn::{self, DiagnosticKind, DsnConfig, RecipientFailure},
    error::{DeliveryError, SystemError},
    mailbox::{LocalMailboxStore, SentMessageStore},
    rate_limiter::RateLimiter,
    relay::{MailRelay, RelayOutcome, RelayRequest},
    routing::RoutingPolicy,
};

/// Per-recipient attempt result for one claim round.
enum Attempt {
    Delivered,
    Permanent(RecipientFailure),
    Transient,
}

/// Drives recipient-level delivery attempts and resolves the entry-level
/// outcome against the spool.
pub struct DeliveryService {
    spool: Arc<dyn BackingStore>,
    routing: Arc<dyn RoutingPolicy>,
    mailboxes: Arc<dyn LocalMailboxStore>,
    relay: Arc<dyn MailRelay>,
    archive: Arc<dyn SentMessageStore>,
    rate_limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    dsn: DsnConfig,
}

impl DeliveryService {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spool: Arc<dyn BackingStore>,
        routing: Arc<dyn RoutingPolicy>,
        mailboxes: Arc<dyn LocalMailboxStore>,
        relay: Arc<dyn MailRelay>,
        archive: Arc<dyn SentMessageStore>,
        rate_limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        dsn: DsnConfig,
    ) -> Self {
        Self {
            spool,
            routing,
            mailboxes,
            relay,
            archive,
            rate_limiter,
            retry,
            dsn,
        }
    }

    /// Processes one claimed entry to completion: attempts every pending
    /// recipient, then resolves the entry against the backing store.
    ///
    /// # Errors
    /// Returns an error only for failures that prevent resolving the entry
    /// at all (spool I/O, message unreadable); per-recipient failures are
    /// captured in the outcome and never propagated as `Err`.
    pub async fn process_entry(&self, entry: &SpoolEntry) -> Result<(), DeliveryError> {
        let message = tokio::fs::read(&entry.message_path)
            .await
            .map_err(SystemError::Io)?;

        let mut permanent_failures = Vec::new();
        let mut any_transient = false;

        for status in entry.pending_recipients() {
            let address = status.disposition.entry.address.to_string();
            let domain = address.rsplit('@').next().filter(|d| !d.is_empty()).map(Domain::new);

            let attempt = match domain {
                Some(domain) if self.routing.is_local(&domain) => {
                    self.deliver_local(&address, &message).await
                }
                Some(_) => self.deliver_remote(entry, &address).await,
                None => Attempt::Permanent(RecipientFailure {
                    recipient: address,
                    reason: "recipient address has no domain part".to_string(),
                    diagnostic: DiagnosticKind::Internal,
                }),
            };

            match attempt {
                Attempt::Delivered => {
                    let _ = self.archive.archive(entry.id.to_string().as_str(), &message).await;
                }
                Attempt::Permanent(failure) => permanent_failures.push(failure),
                Attempt::Transient => any_transient = true,
            }
        }

        self.resolve(entry, permanent_failures, any_transient).await
    }

    async fn deliver_local(&self, address: &str, message: &[u8]) -> Attempt {
        match self.mailboxes.deliver(address, message).await {
            Ok(()) => Attempt::Delivered,
            Err(DeliveryError::Permanent(err)) => Attempt::Permanent(RecipientFailure {
                recipient: address.to_string(),
                reason: err.to_string(),
                diagnostic: DiagnosticKind::Internal,
            }),
            Err(_) => Attempt::Transient,
        }
    }

    async fn deliver_remote(&self, entry: &SpoolEntry, address: &str) -> Attempt {
        let domain = address
            .rsplit('@')
            .next()
            .filter(|d| !d.is_empty())
            .map_or_else(|| Domain::new(address), Domain::new);

        if let Err(_wait) = self.rate_limiter.check_rate_limit(&domain) {
            return Attempt::Transient;
        }

        let request = RelayRequest {
            client_id: entry.client_id.clone(),
            sender: entry.sender.clone(),
            recipient: address.to_string(),
            message_path: entry.message_path.clone(),
        };

        match self.relay.relay(request).await {
            Ok(RelayOutcome::Accepted) => Attempt::Delivered,
            Ok(RelayOutcome::Permanent { reason, .. }) => Attempt::Permanent(RecipientFailure {
                recipient: address.to_string(),
                reason,
                diagnostic: DiagnosticKind::Smtp,
            }),
            Ok(RelayOutcome::Transient { .. }) | Err(DeliveryError::Temporary(_)) => Attempt::Transient,
            Err(DeliveryError::Permanent(err)) => Attempt::Permanent(RecipientFailure {
                recipient: address.to_string(),
                reason: err.to_string(),
                diagnostic: DiagnosticKind::Internal,
            }),
            Err(_) => Attempt::Transient,
        }
    }

    async fn resolve(
        &self,
        entry: &SpoolEntry,
        mut permanent_failures: Vec<RecipientFailure>,
        any_transient: bool,
    ) -> Result<(), DeliveryError> {
        let exhausted = any_transient && !self.retry.should_retry(entry.attempts + 1);

        if exhausted {
            for status in entry.pending_recipients() {
                let address = status.disposition.entry.address.to_string();
                if permanent_failures.iter().any(|f| f.recipient == address) {
                    continue;
                }
                permanent_failures.push(RecipientFailure {
                    recipient: address,
                    reason: "retry attempts exhausted".to_string(),
                    diagnostic: DiagnosticKind::Internal,
                });
            }
        }
        let transient_remains = any_transient && !exhausted;
        let had_permanent_failures = !permanent_failures.is_empty();

        if had_permanent_failures {
            if self.dsn.enabled {
                if let Some(submission) = dsn::generate(entry, &permanent_failures, &self.dsn).await? {
                    self.spool.enqueue(submission).await.map_err(SystemError::Spool)?;
                }
            }
            let reasons: Vec<(String, String)> = permanent_failures
                .into_iter()
                .map(|f| (f.recipient, f.reason))
                .collect();
            self.spool
                .fail_permanent(&entry.id, &reasons)
                .await
                .map_err(SystemError::Spool)?;
        }

        if transient_remains {
            let next_at = embermail_spool::entry::now_unix()
                + i64::try_from(self.retry.backoff(entry.attempts).as_secs()).unwrap_or(i64::MAX);
            self.spool
                .reschedule(&entry.id, next_at, entry.attempts + 1)
                .await
                .map_err(SystemError::Spool)?;
        } else if !had_permanent_failures {
            // Nothing transient remains and nothing was marked permanent:
            // every recipient in this round was delivered.
            self.spool.complete(&entry.id).await.map_err(SystemError::Spool)?;
        }

        Ok(())
    }
}
