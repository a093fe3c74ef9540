//! The local durable store: guest cache plus the check-in outbox.
//!
//! Backed by `SQLite` so pending entries and cached guest data survive
//! process restarts. `enqueue` either succeeds or fails with a
//! [`StoreError`] the caller can distinguish from business-rule errors;
//! nothing in here silently drops an entry.

mod storage;

pub use storage::{OutboxEntry, RejectedCheckin, StationStore, StoreError};
