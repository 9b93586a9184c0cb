//! Outbound delivery: turns spooled messages into terminal per-recipient
//! outcomes (local delivery, relay, retry, or DSN) and the worker pool that
//! drives the spool's claim loop.

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod dsn;
pub mod error;
pub mod mailbox;
pub mod rate_limiter;
pub mod relay;
pub mod routing;
pub mod service;
pub mod worker;

pub use config::{DeliveryConfig, RetryPolicy};
pub use dsn::{DiagnosticKind, DsnConfig, RecipientFailure};
pub use error::{DeliveryError, PermanentError, SystemError, TemporaryError};
pub use mailbox::{FileMailboxStore, LocalMailboxStore, NullSentMessageStore, SentMessageStore};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use relay::{MailRelay, RelayOutcome, RelayRequest};
pub use routing::{RoutingPolicy, StaticRoutingPolicy};
pub use service::DeliveryService;
pub use worker::WorkerPool;
