use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::memory::MemoryBackingStore;
use crate::{
    backend::{BackingStore, PermanentFailure, SpoolEntry},
    entry::SpoolSubmission,
    types::SpooledMessageId,
};

/// Testing utilities wrapped around a memory-backed store.
///
/// This adds test-specific functionality like waiting for a message to be
/// spooled, useful where an integration test has no other signal that a
/// background `enqueue` call has landed.
#[derive(Clone)]
pub struct TestBackingStore {
    pub(crate) inner: MemoryBackingStore,
    notify: Arc<Notify>,
}

impl Default for TestBackingStore {
    fn default() -> Self {
        Self {
            inner: MemoryBackingStore::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl TestBackingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next message to be enqueued.
    pub async fn wait_for_spool(&self) {
        self.notify.notified().await;
    }

    /// Wait for the entry count to reach `expected`, with a timeout.
    ///
    /// # Errors
    /// Returns an error if the timeout is reached before the expected count.
    pub async fn wait_for_count(
        &self,
        expected: usize,
        timeout: std::time::Duration,
    ) -> crate::Result<()> {
        tokio::time::timeout(timeout, async {
            loop {
                if self.inner.len() >= expected {
                    return;
                }
                self.notify.notified().await;
            }
        })
        .await
        .map_err(|e| crate::SpoolError::Internal(format!("timeout waiting for entries: {e}")))?;
        Ok(())
    }

    /// Number of entries currently in the store.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner.len()
    }
}

#[async_trait]
impl BackingStore for TestBackingStore {
    async fn enqueue(&self, submission: SpoolSubmission) -> crate::Result<SpooledMessageId> {
        let id = self.inner.enqueue(submission).await?;
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn claim_due(&self, worker_token: &str, limit: usize) -> crate::Result<Vec<SpoolEntry>> {
        self.inner.claim_due(worker_token, limit).await
    }

    async fn complete(&self, id: &SpooledMessageId) -> crate::Result<()> {
        self.inner.complete(id).await
    }

    async fn reschedule(
        &self,
        id: &SpooledMessageId,
        next_at_unix: i64,
        new_attempts: u32,
    ) -> crate::Result<()> {
        self.inner.reschedule(id, next_at_unix, new_attempts).await
    }

    async fn fail_permanent(
        &self,
        id: &SpooledMessageId,
        per_recipient_reasons: &[PermanentFailure],
    ) -> crate::Result<()> {
        self.inner.fail_permanent(id, per_recipient_reasons).await
    }
}
