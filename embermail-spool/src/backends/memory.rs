use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use crate::{
    SpoolError,
    backend::{BackingStore, PermanentFailure},
    entry::{DeliveryOutcome, SpoolEntry, SpoolSubmission, now_unix},
    types::SpooledMessageId,
};

/// A lock is stale (and may be reclaimed by a new worker) once it has been
/// held this long without being released.
const LOCK_TTL_SECS: i64 = 300;

struct Slot {
    entry: SpoolEntry,
    lock_owner: Option<String>,
    lock_acquired_unix: i64,
}

/// In-memory backing store implementation.
///
/// This is the reference shape for the key-value-backed spool described for
/// multi-node deployments: entries live in a map, and the lock is a field
/// on the same record with TTL-based reclamation rather than a real
/// networked compare-and-set. Primarily intended for single-node use and
/// testing.
///
/// # Capacity Management
/// The store can be configured with a maximum capacity to prevent unbounded
/// memory growth. When capacity is reached, `enqueue` fails.
///
/// # Concurrency
/// Uses an `RwLock` for interior mutability. A real multi-node deployment
/// wants a networked KV store behind the same [`BackingStore`] interface.
#[derive(Clone)]
pub struct MemoryBackingStore {
    slots: Arc<RwLock<HashMap<SpooledMessageId, Slot>>>,
    capacity: Option<usize>,
}

impl std::fmt::Debug for MemoryBackingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackingStore")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl MemoryBackingStore {
    /// Create a new empty memory-backed store with unlimited capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            capacity: None,
        }
    }

    /// Create a new memory-backed store with a capacity limit
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            capacity: Some(capacity),
        }
    }

    /// Get the current number of entries in the store
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the configured capacity (None = unlimited)
    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl Default for MemoryBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn enqueue(&self, submission: SpoolSubmission) -> crate::Result<SpooledMessageId> {
        let id = SpooledMessageId::generate();

        if let Some(cap) = self.capacity
            && self.len() >= cap
        {
            return Err(SpoolError::Internal(format!(
                "spool capacity exceeded: {}/{cap} entries",
                self.len()
            )));
        }

        let entry = SpoolEntry::from_submission(id.clone(), submission);
        self.slots.write()?.insert(
            id.clone(),
            Slot {
                entry,
                lock_owner: None,
                lock_acquired_unix: 0,
            },
        );

        Ok(id)
    }

    async fn claim_due(&self, worker_token: &str, limit: usize) -> crate::Result<Vec<SpoolEntry>> {
        let now = now_unix();
        let mut slots = self.slots.write()?;

        let mut due: Vec<_> = slots
            .iter()
            .filter(|(_, slot)| slot.entry.next_attempt_at_unix <= now)
            .map(|(id, slot)| (id.clone(), slot.entry.next_attempt_at_unix))
            .collect();
        due.sort_by_key(|(_, next_at)| *next_at);

        let mut claimed = Vec::new();
        for (id, _) in due {
            if claimed.len() >= limit {
                break;
            }
            let Some(slot) = slots.get_mut(&id) else {
                continue;
            };
            let lock_free = slot.lock_owner.is_none() || now - slot.lock_acquired_unix > LOCK_TTL_SECS;
            if lock_free {
                slot.lock_owner = Some(worker_token.to_string());
                slot.lock_acquired_unix = now;
                claimed.push(slot.entry.clone());
            }
        }

        Ok(claimed)
    }

    async fn complete(&self, id: &SpooledMessageId) -> crate::Result<()> {
        self.slots
            .write()?
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SpoolError::NotFound(id.clone()))
    }

    async fn reschedule(
        &self,
        id: &SpooledMessageId,
        next_at_unix: i64,
        new_attempts: u32,
    ) -> crate::Result<()> {
        let mut slots = self.slots.write()?;
        let slot = slots.get_mut(id).ok_or_else(|| SpoolError::NotFound(id.clone()))?;
        slot.entry.next_attempt_at_unix = next_at_unix;
        slot.entry.attempts = new_attempts;
        slot.lock_owner = None;
        Ok(())
    }

    async fn fail_permanent(
        &self,
        id: &SpooledMessageId,
        per_recipient_reasons: &[PermanentFailure],
    ) -> crate::Result<()> {
        let mut slots = self.slots.write()?;
        let slot = slots.get_mut(id).ok_or_else(|| SpoolError::NotFound(id.clone()))?;

        for status in &mut slot.entry.recipients {
            let rendered = status.disposition.entry.address.to_string();
            if per_recipient_reasons.iter().any(|(addr, _)| *addr == rendered) {
                status.outcome = DeliveryOutcome::PermanentFailure;
            }
        }
        slot.lock_owner = None;

        if slot.entry.is_fully_resolved() {
            slots.remove(id);
        }

        Ok(())
    }
}
