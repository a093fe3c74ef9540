//! The operator-facing check-in action.
//!
//! Capture must never be blocked by connectivity: when the station is
//! offline, or a direct submission fails on transport, the event lands in
//! the outbox with origin `offline` and the operator sees success. Only a
//! local storage fault or an explicit business rejection from a direct
//! submission is surfaced.
//!
//! The already-checked-in guard here is a client-side convenience working
//! off the cache; the server's resolver remains the final arbiter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};
use usher_core::checkin::{CheckinEvent, Origin};
use usher_core::guest::Guest;

use crate::store::{StationStore, StoreError};
use crate::transport::{SyncTransport, TransportError};

/// How a check-in was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckinOutcome {
    /// Delivered directly to the reconciliation service.
    Submitted,
    /// Queued in the outbox for a later sync cycle.
    Queued {
        /// The outbox entry id.
        entry_id: String,
    },
}

/// Errors surfaced to the operator from a check-in.
#[derive(Debug, Error)]
pub enum ProducerError {
    /// The cache already shows an arrival for this guest.
    #[error("guest already checked in at {checked_in_at}")]
    AlreadyCheckedIn {
        /// Cached arrival time.
        checked_in_at: DateTime<Utc>,
    },

    /// The local durable store failed; the event is NOT captured.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A direct submission was rejected by business rules; queueing it
    /// would never succeed.
    #[error("check-in rejected by server: {reason}")]
    Rejected {
        /// Server-reported reason.
        reason: String,
    },
}

/// The check-in action.
pub struct CheckinProducer<T> {
    store: Arc<StationStore>,
    transport: Arc<T>,
    connectivity: watch::Receiver<bool>,
    operator_id: String,
    request_timeout: Duration,
}

impl<T: SyncTransport> CheckinProducer<T> {
    /// Creates a producer.
    #[must_use]
    pub fn new(
        store: Arc<StationStore>,
        transport: Arc<T>,
        connectivity: watch::Receiver<bool>,
        operator_id: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            connectivity,
            operator_id: operator_id.into(),
            request_timeout,
        }
    }

    /// Records an arrival for `guest` observed at `observed_at`.
    ///
    /// # Errors
    ///
    /// Returns [`ProducerError::AlreadyCheckedIn`] when the cache shows an
    /// arrival, [`ProducerError::Store`] on a local storage fault, and
    /// [`ProducerError::Rejected`] when a direct submission is refused by
    /// business rules. Transport trouble is never an error here.
    pub async fn check_in(
        &self,
        guest: &Guest,
        observed_at: DateTime<Utc>,
    ) -> Result<CheckinOutcome, ProducerError> {
        // Prefer the freshest cache row over the caller's snapshot.
        let cached = self.store.lookup_guest_by_email(&guest.email)?;
        let current = cached.as_ref().unwrap_or(guest);
        if let Some(at) = current.checked_in_at {
            return Err(ProducerError::AlreadyCheckedIn { checked_in_at: at });
        }

        if *self.connectivity.borrow() {
            match self.try_direct(current, observed_at).await {
                DirectResult::Delivered => {
                    self.store
                        .mark_checked_in(&current.email, observed_at, Origin::Remote)?;
                    return Ok(CheckinOutcome::Submitted);
                },
                DirectResult::Rejected { reason } => {
                    return Err(ProducerError::Rejected { reason });
                },
                DirectResult::Degrade => {},
            }
        }

        // Offline path: durable capture, optimistic cache update.
        let mut event = CheckinEvent::new(&current.email, observed_at, Origin::Local);
        event.guest_id = Some(current.id.clone());
        let entry_id = self.store.enqueue(&event, &self.operator_id)?;
        self.store
            .mark_checked_in(&current.email, observed_at, Origin::Local)?;
        debug!(guest = %current.email, entry_id = %entry_id, "check-in queued for sync");
        Ok(CheckinOutcome::Queued { entry_id })
    }

    async fn try_direct(&self, guest: &Guest, observed_at: DateTime<Utc>) -> DirectResult {
        let mut event = CheckinEvent::new(&guest.email, observed_at, Origin::Remote);
        event.guest_id = Some(guest.id.clone());

        let submission = tokio::time::timeout(
            self.request_timeout,
            self.transport.submit_batch(std::slice::from_ref(&event)),
        )
        .await;

        match submission {
            Ok(Ok(response)) => {
                if let Some(failure) = response
                    .failed
                    .iter()
                    .find(|f| f.guest_email == guest.email)
                {
                    if failure.reason.is_retryable() {
                        debug!(guest = %guest.email, "direct submission failed transiently, queueing");
                        DirectResult::Degrade
                    } else {
                        DirectResult::Rejected {
                            reason: failure.reason.as_str().to_string(),
                        }
                    }
                } else {
                    DirectResult::Delivered
                }
            },
            Ok(Err(TransportError::Unauthorized)) => {
                // A bad credential is an operator-visible configuration
                // problem, not connectivity; don't hide it in the outbox.
                DirectResult::Rejected {
                    reason: "unauthorized".to_string(),
                }
            },
            Ok(Err(error)) => {
                warn!(guest = %guest.email, error = %error, "direct submission failed, degrading to outbox");
                DirectResult::Degrade
            },
            Err(_elapsed) => {
                warn!(guest = %guest.email, "direct submission timed out, degrading to outbox");
                DirectResult::Degrade
            },
        }
    }
}

enum DirectResult {
    Delivered,
    Rejected { reason: String },
    Degrade,
}
