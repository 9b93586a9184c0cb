//! The spooler worker pool: a fixed number of claim loops that pull due
//! entries from the spool and drive each through the [`DeliveryService`].

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use embermail_common::{internal, tracing, Signal};
use embermail_spool::backend::BackingStore;
use embermail_tracing::traced;
use tokio::sync::Notify;

use crate::{config::DeliveryConfig, service::DeliveryService};

/// Runs `worker_concurrency` independent claim loops against the spool,
/// sharing a single debounced wake-up so a fresh enqueue or an ETRN request
/// can cut a worker's poll interval short.
pub struct WorkerPool {
    spool: Arc<dyn BackingStore>,
    service: Arc<DeliveryService>,
    config: DeliveryConfig,
    wakeup: Arc<Notify>,
    last_trigger_ms: Arc<AtomicU64>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(spool: Arc<dyn BackingStore>, service: Arc<DeliveryService>, config: DeliveryConfig) -> Self {
        Self {
            spool,
            service,
            config,
            wakeup: Arc::new(Notify::new()),
            last_trigger_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wakes every idle worker early. Debounced by `trigger_cooldown_ms` so a
    /// burst of enqueues collapses into a single wake-up. Call this after a
    /// new spool entry is written, or on receipt of an ETRN command.
    pub fn trigger(&self) {
        let now = now_ms();
        let last = self.last_trigger_ms.load(Ordering::Relaxed);
        if !past_cooldown(now, last, self.config.trigger_cooldown_ms) {
            return;
        }
        self.last_trigger_ms.store(now, Ordering::Relaxed);
        self.wakeup.notify_waiters();
    }

    /// Runs every worker until `shutdown` carries [`Signal::Shutdown`].
    /// Workers never abandon a claimed batch mid-flight; they simply stop
    /// claiming new work once shutdown is observed. If that drain does not
    /// finish within `shutdown_timeout`, remaining workers are aborted.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all))]
    pub async fn serve(&self, shutdown: tokio::sync::broadcast::Receiver<Signal>) -> anyhow::Result<()> {
        internal!("Starting {} delivery workers", self.config.worker_concurrency);

        let handles: Vec<_> = (0..self.config.worker_concurrency)
            .map(|index| {
                tokio::spawn(Self::run_worker(
                    index,
                    self.spool.clone(),
                    self.service.clone(),
                    self.wakeup.clone(),
                    self.config.poll_interval(),
                    self.config.batch_size,
                    shutdown.resubscribe(),
                ))
            })
            .collect();

        let joined = tokio::time::timeout(
            self.config.shutdown_timeout(),
            futures_util::future::join_all(handles),
        )
        .await;

        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(err) = result {
                        tracing::error!("delivery worker panicked: {err}");
                    }
                }
            }
            Err(_) => {
                tracing::warn!("delivery worker pool did not drain within the shutdown ceiling");
            }
        }

        Ok(())
    }

    async fn run_worker(
        index: usize,
        spool: Arc<dyn BackingStore>,
        service: Arc<DeliveryService>,
        wakeup: Arc<Notify>,
        poll_interval: Duration,
        batch_size: usize,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) {
        let token = format!("delivery-worker-{index}-{}", ulid::Ulid::new());
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if !matches!(sig, Ok(Signal::Shutdown | Signal::Finalised) | Err(_)) {
                        continue;
                    }
                    internal!(level = INFO, "delivery worker {index} shutting down");
                    break;
                }
                _ = ticker.tick() => {}
                () = wakeup.notified() => {}
            }

            match spool.claim_due(&token, batch_size).await {
                Ok(entries) if entries.is_empty() => {}
                Ok(entries) => {
                    for entry in &entries {
                        if let Err(err) = service.process_entry(entry).await {
                            tracing::error!(entry = %entry.id, error = %err, "failed to resolve delivery entry");
                        }
                    }
                }
                Err(err) => tracing::error!(worker = index, error = %err, "failed to claim due entries"),
            }
        }
    }
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

const fn past_cooldown(now_ms: u64, last_ms: u64, cooldown_ms: u64) -> bool {
    now_ms.saturating_sub(last_ms) >= cooldown_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_trigger_within_cooldown_is_suppressed() {
        assert!(!past_cooldown(1_100, 1_000, 500));
    }

    #[test]
    fn trigger_after_cooldown_elapses_is_allowed() {
        assert!(past_cooldown(1_600, 1_000, 500));
    }

    #[test]
    fn first_trigger_with_zero_last_is_allowed() {
        assert!(past_cooldown(500, 0, 500));
    }
}
