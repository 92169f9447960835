//! Background synchronization.
//!
//! This module provides:
//! - `RetryQueue`: durable queue of failed requests, replayed on drain
//! - `SyncScheduler`: periodic `SyncSignal`s that trigger queue drains,
//!   favorites refresh and auxiliary maintenance; `SYNC_NOW` sends the
//!   same signal one-shot

pub mod queue;
pub mod scheduler;

pub use queue::{
    DrainReport, FileQueueStore, MemoryQueueStore, QueueStore, RequestOptions, RetryEntry,
    RetryQueue,
};
pub use scheduler::{SyncScheduler, SyncSignal, SyncTag, Trigger};
