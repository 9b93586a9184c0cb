#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod backend;
pub mod backends;
pub mod config;
pub mod entry;
pub mod error;
pub mod types;

pub use backend::BackingStore;
pub use backends::{FileBackingStore, MemoryBackingStore, TestBackingStore};
pub use config::{MemoryConfig, SpoolConfig};
pub use entry::{DeliveryOutcome, RecipientDisposition, RecipientStatus, SpoolEntry, SpoolSubmission};
pub use error::{Result, SerializationError, SpoolError, ValidationError};
pub use types::SpooledMessageId;
