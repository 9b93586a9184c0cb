pub mod address;
pub mod address_parser;
pub mod audit;
pub mod context;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod message;
pub mod mime;
pub mod status;
pub mod traits;

pub use context::{Context, DeliveryAttempt, DeliveryContext, DeliveryStatus};
pub use domain::Domain;
pub use tracing;

/// Process-wide lifecycle signal, broadcast to every listener and worker pool
/// so they can drain in-flight sessions before the process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop accepting new work and begin a graceful drain.
    Shutdown,
    /// The drain has completed; it is safe to exit.
    Finalised,
}
