//! The sync dispatcher: drains the outbox to the reconciliation daemon.
//!
//! A single worker owns the drain-and-submit cycle, so a sync is never in
//! flight concurrently with itself. Both the periodic timer and the
//! connectivity-regained edge funnel through a capacity-1 trigger channel
//! with `try_send`: a trigger arriving while a drain is in flight is
//! coalesced, not queued.
//!
//! The dispatcher performs no conflict logic. It batches, submits, and
//! settles the outbox from the per-event outcomes the server reports:
//! accepted events (applied or resolved duplicates) are removed, retryable
//! failures stay queued, unretryable failures are dead-lettered for
//! operator follow-up. Whole-request failures (transport faults, rate
//! limiting) leave the outbox untouched and back off exponentially.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use usher_core::checkin::{CheckinEvent, FailureReason, SyncResponse};
use usher_core::retry::BackoffConfig;

use crate::store::{OutboxEntry, StationStore};
use crate::transport::SyncTransport;

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Periodic sync interval.
    pub sync_interval: Duration,

    /// Backoff applied between failed cycles.
    pub backoff: BackoffConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
        }
    }
}

impl DispatcherConfig {
    /// Builds dispatcher timings from station configuration.
    #[must_use]
    pub fn from_station(config: &usher_core::config::StationConfig) -> Self {
        Self {
            sync_interval: config.sync_interval,
            backoff: config.backoff.clone(),
        }
    }

    /// Creates a configuration with short timings for testing.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            sync_interval: Duration::from_millis(50),
            backoff: BackoffConfig::Fixed {
                delay: Duration::from_millis(20),
            },
        }
    }
}

/// What prompted a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// The periodic timer fired.
    Periodic,
    /// Connectivity was regained.
    ConnectivityRegained,
    /// An explicit request (operator action, shutdown flush).
    Manual,
}

/// Handle used to request a sync from outside the worker.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncTrigger>,
}

impl SyncHandle {
    /// Requests a sync cycle. A request arriving while one is already
    /// pending or in flight is coalesced.
    pub fn request_sync(&self, trigger: SyncTrigger) {
        if self.tx.try_send(trigger).is_err() {
            debug!(?trigger, "sync trigger coalesced");
        }
    }
}

/// Result of one drain cycle, mainly for tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing pending.
    Idle,
    /// Station is offline; nothing attempted.
    Offline,
    /// Backoff window still open; nothing attempted.
    Deferred,
    /// A batch was submitted and the outbox settled.
    Completed {
        /// Entries removed after acceptance (applied or duplicate).
        delivered: usize,
        /// Entries dead-lettered after an unretryable rejection.
        dead_lettered: usize,
        /// Entries left queued for the next cycle.
        retained: usize,
    },
    /// The whole request failed; entries remain queued.
    Retrying,
    /// The local store failed mid-cycle.
    Faulted,
}

/// The outbox drain worker.
pub struct SyncDispatcher<T> {
    store: Arc<StationStore>,
    transport: Arc<T>,
    config: DispatcherConfig,
    connectivity: watch::Receiver<bool>,
    rx: mpsc::Receiver<SyncTrigger>,
    consecutive_failures: u32,
    next_attempt_after: Option<Instant>,
}

impl<T: SyncTransport> SyncDispatcher<T> {
    /// Creates a dispatcher and its trigger handle.
    #[must_use]
    pub fn new(
        store: Arc<StationStore>,
        transport: Arc<T>,
        connectivity: watch::Receiver<bool>,
        config: DispatcherConfig,
    ) -> (Self, SyncHandle) {
        // Capacity 1: a pending trigger already guarantees a future cycle.
        let (tx, rx) = mpsc::channel(1);
        (
            Self {
                store,
                transport,
                config,
                connectivity,
                rx,
                consecutive_failures: 0,
                next_attempt_after: None,
            },
            SyncHandle { tx },
        )
    }

    /// Runs the worker until every [`SyncHandle`] is dropped.
    pub async fn run(mut self) {
        info!(interval = ?self.config.sync_interval, "sync dispatcher started");
        let mut interval = tokio::time::interval(self.config.sync_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut connectivity = self.connectivity.clone();

        loop {
            // Resolve the wake reason first so the select borrows end
            // before the cycle runs.
            let trigger = tokio::select! {
                _ = interval.tick() => Some(SyncTrigger::Periodic),
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        info!("connectivity signal closed, sync dispatcher stopping");
                        break;
                    }
                    if *connectivity.borrow() {
                        Some(SyncTrigger::ConnectivityRegained)
                    } else {
                        None
                    }
                },
                requested = self.rx.recv() => {
                    match requested {
                        Some(requested) => Some(requested),
                        None => {
                            info!("all sync handles dropped, sync dispatcher stopping");
                            break;
                        },
                    }
                },
            };

            if let Some(trigger) = trigger {
                self.run_once(trigger).await;
            }
        }
    }

    /// Runs a single drain cycle.
    ///
    /// Exposed so embedders and tests can drive cycles directly; `run`
    /// calls this from the worker loop.
    pub async fn run_once(&mut self, trigger: SyncTrigger) -> CycleOutcome {
        if !*self.connectivity.borrow() {
            debug!(?trigger, "skipping sync: offline");
            return CycleOutcome::Offline;
        }

        // The periodic timer respects the backoff window; an explicit
        // trigger or a connectivity edge means conditions changed.
        if trigger == SyncTrigger::Periodic {
            if let Some(after) = self.next_attempt_after {
                if Instant::now() < after {
                    debug!("skipping sync: backing off");
                    return CycleOutcome::Deferred;
                }
            }
        }

        let pending = match self.store.list_pending() {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "failed to read outbox");
                return CycleOutcome::Faulted;
            },
        };
        if pending.is_empty() {
            return CycleOutcome::Idle;
        }

        let checks: Vec<CheckinEvent> = pending.iter().map(|entry| entry.event.clone()).collect();
        debug!(?trigger, batch = checks.len(), "submitting sync batch");

        match self.transport.submit_batch(&checks).await {
            Ok(response) => {
                self.consecutive_failures = 0;
                self.next_attempt_after = None;
                let outcome = self.settle(&pending, &response);
                // Opportunistic read-back: the server just reconciled, so
                // pick up the authoritative guest record while we have it.
                self.refresh_cache().await;
                outcome
            },
            Err(e) => {
                self.consecutive_failures += 1;
                let delay = self
                    .config
                    .backoff
                    .delay_for_attempt(self.consecutive_failures);
                self.next_attempt_after = Some(Instant::now() + delay);
                if e.is_retryable() {
                    warn!(
                        error = %e,
                        attempt = self.consecutive_failures,
                        retry_in = ?delay,
                        "sync cycle failed, will retry"
                    );
                } else {
                    // Unauthorized or undecodable response: entries stay
                    // queued, but this needs operator attention, not just
                    // patience.
                    error!(error = %e, "sync cycle failed unretryably; check station configuration");
                }
                CycleOutcome::Retrying
            },
        }
    }

    /// Best-effort guest cache refresh; failure never affects the cycle.
    async fn refresh_cache(&self) {
        match self.transport.fetch_guests().await {
            Ok(guests) => {
                if let Err(e) = self.store.cache_guests(&guests) {
                    warn!(error = %e, "failed to write refreshed guest cache");
                } else {
                    debug!(guests = guests.len(), "guest cache refreshed");
                }
            },
            Err(e) => {
                debug!(error = %e, "guest cache refresh skipped");
            },
        }
    }

    /// Settles the outbox from per-event outcomes.
    fn settle(&self, pending: &[OutboxEntry], response: &SyncResponse) -> CycleOutcome {
        let failed_by_email: HashMap<&str, FailureReason> = response
            .failed
            .iter()
            .map(|f| (f.guest_email.as_str(), f.reason))
            .collect();

        let mut delivered = 0usize;
        let mut dead_lettered = 0usize;
        let mut retained = 0usize;

        for entry in pending {
            match failed_by_email.get(entry.event.guest_email.as_str()) {
                Some(reason) if reason.is_retryable() => {
                    retained += 1;
                },
                Some(reason) => {
                    if let Err(e) = self.store.record_rejected(entry, reason.as_str()) {
                        error!(entry = %entry.id, error = %e, "failed to dead-letter entry");
                        retained += 1;
                        continue;
                    }
                    if let Err(e) = self.store.remove(&entry.id) {
                        error!(entry = %entry.id, error = %e, "failed to remove dead-lettered entry");
                    }
                    dead_lettered += 1;
                    warn!(
                        guest = %entry.event.guest_email,
                        reason = reason.as_str(),
                        "check-in dead-lettered for operator follow-up"
                    );
                },
                None => {
                    // Accepted (applied or resolved duplicate). Flag first
                    // so an interrupted removal can't cause resubmission.
                    if let Err(e) = self.store.mark_delivered(&entry.id) {
                        error!(entry = %entry.id, error = %e, "failed to flag delivered entry");
                        retained += 1;
                        continue;
                    }
                    if let Err(e) = self.store.remove(&entry.id) {
                        error!(entry = %entry.id, error = %e, "failed to remove delivered entry");
                    }
                    delivered += 1;
                },
            }
        }

        info!(delivered, dead_lettered, retained, "sync cycle settled");
        CycleOutcome::Completed {
            delivered,
            dead_lettered,
            retained,
        }
    }
}
