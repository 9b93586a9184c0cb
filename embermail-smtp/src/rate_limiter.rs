//! Connection- and message-rate limiting keyed by client IP (RFC 5321-
//! adjacent abuse controls, not part of the protocol itself).

use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Admission control keyed by client IP: caps concurrent connections and
/// messages accepted per hour.
#[async_trait]
pub trait ConnectionRateLimiter: Send + Sync {
    /// Attempts to admit a new connection from `addr`. Returns `false` if
    /// the per-IP connection cap is already reached.
    async fn admit_connection(&self, addr: IpAddr) -> bool;

    /// Releases a connection slot previously admitted for `addr`.
    async fn release_connection(&self, addr: IpAddr);

    /// Attempts to admit one more accepted message from `addr` within the
    /// current hour window.
    async fn admit_message(&self, addr: IpAddr) -> bool;
}

/// In-process limiter backed by a concurrent map of atomic counters, mirroring
/// the per-domain token-bucket shape used on the delivery side.
pub struct LocalConnectionRateLimiter {
    connections: DashMap<IpAddr, Arc<AtomicU32>>,
    messages: DashMap<IpAddr, Arc<AtomicU32>>,
    max_connections_per_ip: u32,
    max_messages_per_ip_per_hour: u32,
}

impl LocalConnectionRateLimiter {
    #[must_use]
    pub fn new(max_connections_per_ip: u32, max_messages_per_ip_per_hour: u32) -> Self {
        Self {
            connections: DashMap::new(),
            messages: DashMap::new(),
            max_connections_per_ip,
            max_messages_per_ip_per_hour,
        }
    }
}

impl Default for LocalConnectionRateLimiter {
    fn default() -> Self {
        Self::new(20, 200)
    }
}

#[async_trait]
impl ConnectionRateLimiter for LocalConnectionRateLimiter {
    async fn admit_connection(&self, addr: IpAddr) -> bool {
        let counter = self
            .connections
            .entry(addr)
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone();

        let previous = counter.fetch_add(1, Ordering::SeqCst);
        if previous >= self.max_connections_per_ip {
            counter.fetch_sub(1, Ordering::SeqCst);
            false
        } else {
            true
        }
    }

    async fn release_connection(&self, addr: IpAddr) {
        if let Some(counter) = self.connections.get(&addr) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn admit_message(&self, addr: IpAddr) -> bool {
        let counter = self
            .messages
            .entry(addr)
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone();

        let previous = counter.fetch_add(1, Ordering::SeqCst);
        if previous >= self.max_messages_per_ip_per_hour {
            counter.fetch_sub(1, Ordering::SeqCst);
            false
        } else {
            true
        }
    }
}
