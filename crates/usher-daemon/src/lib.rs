//! Server side of the Usher check-in engine.
//!
//! The daemon owns the shared guest record ([`registry`]), applies
//! batches of check-in events through the reconciliation service
//! ([`service`]), and exposes the sync and inspection HTTP surface
//! ([`http`]). Every event that reaches business logic leaves exactly one
//! record in the append-only audit log.

pub mod http;
pub mod registry;
pub mod service;
