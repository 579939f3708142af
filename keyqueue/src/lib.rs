//! Key-partitioned FIFO work queue with lease-based claims.
//!
//! Producers `push` messages under a key. A consumer `claim`s the oldest
//! unclaimed key, gets every message buffered for it, and must `acknowledge`
//! the claim with its token. Claims left unacknowledged past the lease window
//! are released by the [`Reaper`] and the key becomes claimable again.

mod config;
mod coordinator;
pub mod core;
mod errors;
mod reaper;


pub use crate::config::{QueueConfig, QueueConfigBuilder, DEFAULT_LEASE_WINDOW_MS};
pub use crate::coordinator::{KeyQueue, QueueStats};
pub use crate::core::{ClaimEnd, ClaimToken, ClaimedPack, Release};
pub use crate::errors::QueueError;
pub use crate::reaper::{Reaper, REAPER_THREAD_NAME};
