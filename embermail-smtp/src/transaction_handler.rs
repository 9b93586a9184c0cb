//! The `TransactionProcessor` SPI: the seam between the protocol dispatcher
//! and whatever consumes accepted mail (by default, the spool).
//!
//! `from`/`to` simply validate and record; `data` consumes a bounded channel
//! of body-byte chunks fed by the session's reader task, persists them to a
//! temporary file, classifies each recipient as local or remote against the
//! configured local domains, and hands the result to a `BackingStore`.
//! `done` releases whatever temporary resources the processor acquired.

use std::{
    path::PathBuf,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use embermail_common::{
    address::Address,
    context::Context,
    envelope::{MailParameters, RecipientEntry},
    status::Status,
};
use embermail_spool::{RecipientDisposition, SpoolSubmission};
use tokio::{io::AsyncWriteExt, sync::mpsc};

use crate::error::CommandError;

/// Hooks invoked by the session dispatcher at each stage of a mail
/// transaction. An embedder may substitute its own implementation (content
/// filtering, archival) ahead of or instead of [`DefaultTransactionProcessor`],
/// as long as it honours the same per-verb contract the dispatcher expects.
#[async_trait]
pub trait TransactionProcessor: Send + Sync {
    /// Called once MAIL FROM has been accepted into the envelope.
    async fn from(
        &self,
        ctx: &mut Context,
        sender: Option<&Address>,
        params: &MailParameters,
    ) -> Result<(), CommandError>;

    /// Called once a single RCPT TO has been accepted into the envelope.
    async fn to(&self, ctx: &mut Context, recipient: &RecipientEntry) -> Result<(), CommandError>;

    /// Consumes the message body, delivered as a stream of chunks over
    /// `chunks` (the session's reader task sends until DATA's terminator or
    /// BDAT's LAST chunk closes the channel). `declared_size` is the
    /// client's `SIZE=` parameter, if given.
    async fn data(
        &self,
        ctx: &mut Context,
        chunks: mpsc::Receiver<Vec<u8>>,
        declared_size: Option<usize>,
    ) -> Result<(), CommandError>;

    /// Releases resources acquired for this transaction (temp files, locks).
    /// Called exactly once per transaction, including on error paths.
    async fn done(&self, ctx: &mut Context);
}

/// Whether `domain` matches one of the server's configured local domains
/// (case-insensitive, exact match — no wildcard subdomains).
#[must_use]
pub fn is_local_domain(domain: &str, local_domains: &[String]) -> bool {
    local_domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
}

/// Tees accepted transactions to a [`embermail_spool::BackingStore`], the
/// engine's default behaviour absent an embedder-supplied processor.
pub struct DefaultTransactionProcessor {
    spool: Arc<dyn embermail_spool::BackingStore>,
    local_domains: Vec<String>,
    temp_dir: PathBuf,
}

impl DefaultTransactionProcessor {
    #[must_use]
    pub fn new(
        spool: Arc<dyn embermail_spool::BackingStore>,
        local_domains: Vec<String>,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            spool,
            local_domains,
            temp_dir,
        }
    }
}

#[async_trait]
impl TransactionProcessor for DefaultTransactionProcessor {
    async fn from(
        &self,
        _ctx: &mut Context,
        _sender: Option<&Address>,
        _params: &MailParameters,
    ) -> Result<(), CommandError> {
        Ok(())
    }

    async fn to(&self, _ctx: &mut Context, _recipient: &RecipientEntry) -> Result<(), CommandError> {
        Ok(())
    }

    async fn data(
        &self,
        ctx: &mut Context,
        mut chunks: mpsc::Receiver<Vec<u8>>,
        declared_size: Option<usize>,
    ) -> Result<(), CommandError> {
        let named = tempfile::Builder::new()
            .prefix("embermail-")
            .tempfile_in(&self.temp_dir)
            .map_err(|e| CommandError::transient_local(format!("cannot open spool temp file: {e}")))?;
        let (std_file, temp_path) = named.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let mut written = 0usize;
        while let Some(chunk) = chunks.recv().await {
            written += chunk.len();
            if let Some(max) = declared_size {
                if written > max {
                    return Err(CommandError::quota(
                        Status::ExceededStorage,
                        "message exceeds declared SIZE",
                    ));
                }
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| CommandError::transient_local(format!("spool write failed: {e}")))?;
        }
        file.flush()
            .await
            .map_err(|e| CommandError::transient_local(format!("spool flush failed: {e}")))?;
        drop(file);
        let message_path = temp_path
            .keep()
            .map_err(|e| CommandError::transient_local(format!("cannot persist spool file: {e}")))?;

        let recipients = ctx
            .envelope
            .recipients()
            .iter()
            .map(|entry| {
                let rendered = entry.address.to_string();
                let domain = rendered.rsplit('@').next().unwrap_or_default();
                RecipientDisposition {
                    local: is_local_domain(domain, &self.local_domains),
                    entry: entry.clone(),
                }
            })
            .collect();

        let received_at_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        let submission = SpoolSubmission {
            sender: ctx.envelope.sender().map(ToString::to_string),
            recipients,
            message_path,
            message_len: written,
            client_id: ctx.id.clone(),
            authenticated_as: ctx.authenticated_as.clone(),
            ret: ctx.envelope.mail_parameters().ret,
            envid: ctx.envelope.mail_parameters().envid.clone(),
            received_at_unix,
        };

        self.spool
            .enqueue(submission)
            .await
            .map(|_id| ())
            .map_err(|e| CommandError::transient_local(format!("spool enqueue failed: {e}")))
    }

    async fn done(&self, _ctx: &mut Context) {}
}

/// A processor that accepts every transaction and discards the body,
/// letting an embedder run the protocol layer without wiring a spool.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransactionProcessor;

#[async_trait]
impl TransactionProcessor for NoopTransactionProcessor {
    async fn from(
        &self,
        _ctx: &mut Context,
        _sender: Option<&Address>,
        _params: &MailParameters,
    ) -> Result<(), CommandError> {
        Ok(())
    }

    async fn to(&self, _ctx: &mut Context, _recipient: &RecipientEntry) -> Result<(), CommandError> {
        Ok(())
    }

    async fn data(
        &self,
        _ctx: &mut Context,
        mut chunks: mpsc::Receiver<Vec<u8>>,
        _declared_size: Option<usize>,
    ) -> Result<(), CommandError> {
        while chunks.recv().await.is_some() {}
        Ok(())
    }

    async fn done(&self, _ctx: &mut Context) {}
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn local_domain_match_is_case_insensitive() {
        let domains = vec!["Example.com".to_string()];
        assert!(is_local_domain("example.COM", &domains));
        assert!(!is_local_domain("other.com", &domains));
    }
}
