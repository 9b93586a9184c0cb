//! The storage-and-lock interface both backends implement: [`BackingStore`].
//!
//! A spool entry is durable (metadata and raw message bytes survive a
//! process restart) and lock-guarded (a worker may only act on an entry
//! while holding its lock, acquired via `claim_due`).

use async_trait::async_trait;

use crate::{
    entry::SpoolSubmission,
    error::Result,
    types::SpooledMessageId,
};

pub use crate::entry::SpoolEntry;

/// A single recipient's terminal failure reason, keyed by the rendered
/// address, as recorded by [`BackingStore::fail_permanent`].
pub type PermanentFailure = (String, String);

/// Storage and lock operations common to every spool backend (in-memory or
/// file-based). Implementors must release a held lock on every exit path,
/// including panics: `claim_due` hands out ownership, and every subsequent
/// call on that id (`complete`, `reschedule`, `fail_permanent`) both acts
/// and releases.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Atomically persists `submission`, assigning a fresh id and an
    /// initial `next_attempt_at` of now.
    async fn enqueue(&self, submission: SpoolSubmission) -> Result<SpooledMessageId>;

    /// Returns up to `limit` entries whose `next_attempt_at` has passed and
    /// for which `worker_token` has successfully acquired the lock.
    async fn claim_due(&self, worker_token: &str, limit: usize) -> Result<Vec<SpoolEntry>>;

    /// Removes an entry (and its raw message bytes) entirely. Releases the
    /// entry's lock.
    async fn complete(&self, id: &SpooledMessageId) -> Result<()>;

    /// Updates an entry's attempt count and due time, then releases its
    /// lock for the next `claim_due` round.
    async fn reschedule(&self, id: &SpooledMessageId, next_at_unix: i64, new_attempts: u32) -> Result<()>;

    /// Records terminal failures for the named recipients, releases the
    /// entry's lock, and removes the entry once every recipient has a
    /// resolved outcome. Does not itself synthesize the DSN; the delivery
    /// service does that from the reasons returned here.
    async fn fail_permanent(
        &self,
        id: &SpooledMessageId,
        per_recipient_reasons: &[PermanentFailure],
    ) -> Result<()>;
}
