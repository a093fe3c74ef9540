//! Operator-station side of the Usher check-in engine.
//!
//! Everything here runs on the front-desk device. The [`store`] module is
//! the local durable store (guest cache + outbox); [`producer`] is the
//! operator-facing check-in action; [`dispatcher`] drains the outbox to
//! the reconciliation daemon through a [`transport`] implementation.
//!
//! The design commitment is that capture never blocks on connectivity:
//! when the network is down (or flaky enough to time out), a check-in
//! lands in the outbox and the dispatcher delivers it later, at least
//! once. The server's resolver is idempotent, so redelivery is safe.

pub mod dispatcher;
pub mod producer;
pub mod store;
pub mod transport;

pub use dispatcher::{DispatcherConfig, SyncDispatcher, SyncHandle, SyncTrigger};
pub use producer::{CheckinOutcome, CheckinProducer, ProducerError};
pub use store::{OutboxEntry, RejectedCheckin, StationStore, StoreError};
pub use transport::{HttpSyncTransport, SyncTransport, TransportError};
