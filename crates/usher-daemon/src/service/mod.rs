//! The reconciliation service.
//!
//! Stateless per call: [`ReconciliationService::apply`] takes a batch of
//! check-in events and decides, event by event in arrival order, which
//! become authoritative. The decision itself lives in
//! `usher_core::resolve`; this module owns the read/CAS-write loop around
//! it, the audit append for every event that reaches business logic, and
//! the best-effort invitation linkage for applied arrivals.
//!
//! Events are processed sequentially in batch order, which serializes
//! same-guest events within a batch. Across concurrent batches the
//! registry's compare-and-set protects each guest: a resolution computed
//! against a stale read never lands, it re-reads and re-resolves.
//!
//! Because the dispatcher delivers at least once, the resolver treats a
//! resubmitted event as an equal-timestamp duplicate: no state change, a
//! fresh equivalent audit record, and a success classification, so replays
//! are invisible to guest state and to the response shape.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use usher_core::audit::{AuditLogError, AuditOutcome, AuditRecord, SqliteAuditLog};
use usher_core::checkin::{CheckinEvent, FailedCheck, FailureReason};
use usher_core::resolve::{self, Decision, ExistingCheckin};

use crate::registry::SqliteGuestRegistry;

/// Bounded retries for the per-guest CAS loop. Contention this deep means
/// something is livelocked; give the dispatcher a retryable failure.
const MAX_CAS_ATTEMPTS: u32 = 5;

/// Fatal service errors: the whole batch fails and the dispatcher retries.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The audit log rejected an append; without the audit trail no
    /// outcome may be reported as durable.
    #[error("audit log error: {0}")]
    Audit(#[from] AuditLogError),
}

/// Per-event disposition reported back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    /// The event became the authoritative check-in.
    Applied,
    /// A conflict was detected; existing state kept. Still a success.
    Superseded,
    /// The event failed.
    Failed(FailureReason),
}

/// Outcome of one event in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOutcome {
    /// Email the event referenced.
    pub guest_email: String,
    /// What happened to it.
    pub disposition: EventDisposition,
}

/// Outcome of a whole batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Per-event outcomes, in batch order.
    pub outcomes: Vec<EventOutcome>,
}

impl BatchOutcome {
    /// Events that were applied or resolved as duplicates.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // batch sizes fit in u32
    pub fn success_count(&self) -> u32 {
        self.outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o.disposition,
                    EventDisposition::Applied | EventDisposition::Superseded
                )
            })
            .count() as u32
    }

    /// Events that changed guest state.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // batch sizes fit in u32
    pub fn applied_count(&self) -> u32 {
        self.outcomes
            .iter()
            .filter(|o| o.disposition == EventDisposition::Applied)
            .count() as u32
    }

    /// Failures, in batch order.
    #[must_use]
    pub fn failed(&self) -> Vec<FailedCheck> {
        self.outcomes
            .iter()
            .filter_map(|o| match o.disposition {
                EventDisposition::Failed(reason) => Some(FailedCheck {
                    guest_email: o.guest_email.clone(),
                    reason,
                }),
                _ => None,
            })
            .collect()
    }
}

/// The reconciliation service.
pub struct ReconciliationService {
    registry: Arc<SqliteGuestRegistry>,
    audit: Arc<SqliteAuditLog>,
}

impl ReconciliationService {
    /// Creates a service over the given registry and audit log.
    #[must_use]
    pub fn new(registry: Arc<SqliteGuestRegistry>, audit: Arc<SqliteAuditLog>) -> Self {
        Self { registry, audit }
    }

    /// Applies a batch of check-in events on behalf of `actor`.
    ///
    /// Every event that reaches business logic yields exactly one audit
    /// record, whether or not it changed state. Events failing validation
    /// never reach business logic and yield none.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] only when the audit log itself fails; the
    /// dispatcher then retries the whole batch, which is safe because
    /// application is idempotent.
    pub fn apply(&self, checks: &[CheckinEvent], actor: &str) -> Result<BatchOutcome, ServiceError> {
        let mut outcomes = Vec::with_capacity(checks.len());
        for event in checks {
            let disposition = self.process_event(event, actor)?;
            outcomes.push(EventOutcome {
                guest_email: event.guest_email.clone(),
                disposition,
            });
        }
        Ok(BatchOutcome { outcomes })
    }

    fn process_event(
        &self,
        event: &CheckinEvent,
        actor: &str,
    ) -> Result<EventDisposition, ServiceError> {
        // Validation faults never reach business logic: no audit record.
        if let Err(e) = event.validate() {
            debug!(error = %e, "rejecting malformed check-in event");
            return Ok(EventDisposition::Failed(FailureReason::InvalidEmail));
        }

        for _attempt in 0..MAX_CAS_ATTEMPTS {
            let guest = match self.registry.find_by_email(&event.guest_email) {
                Ok(Some(guest)) => guest,
                Ok(None) => {
                    self.audit.append(&AuditRecord::new(
                        &event.guest_email,
                        event.checked_in_at,
                        event.origin,
                        actor,
                        AuditOutcome::Rejected,
                    ))?;
                    return Ok(EventDisposition::Failed(FailureReason::GuestNotFound));
                },
                Err(e) => {
                    warn!(guest = %event.guest_email, error = %e, "guest lookup failed");
                    return Ok(EventDisposition::Failed(FailureReason::Internal));
                },
            };

            let existing = match (guest.checked_in_at, guest.checkin_origin) {
                (Some(at), Some(origin)) => Some(ExistingCheckin { at, origin }),
                // A checked-in row without an origin predates this engine;
                // treat its origin as online so it is never displaced by an
                // equal-timestamp offline event.
                (Some(at), None) => Some(ExistingCheckin {
                    at,
                    origin: usher_core::checkin::Origin::Remote,
                }),
                (None, _) => None,
            };

            let decision = resolve::resolve(existing, event.checked_in_at, event.origin);
            match decision {
                Decision::Keep { conflict } => {
                    self.audit.append(
                        &AuditRecord::new(
                            &event.guest_email,
                            event.checked_in_at,
                            event.origin,
                            actor,
                            AuditOutcome::Superseded,
                        )
                        .with_conflict(conflict),
                    )?;
                    debug!(
                        guest = %event.guest_email,
                        reason = conflict.reason.as_str(),
                        "check-in superseded"
                    );
                    return Ok(EventDisposition::Superseded);
                },
                Decision::Apply { conflict } => {
                    let landed = match self.registry.try_apply_checkin(
                        &guest.id,
                        existing.map(|e| e.at),
                        event.checked_in_at,
                        event.origin,
                    ) {
                        Ok(landed) => landed,
                        Err(e) => {
                            warn!(guest = %event.guest_email, error = %e, "check-in update failed");
                            return Ok(EventDisposition::Failed(FailureReason::Internal));
                        },
                    };
                    if !landed {
                        // Lost the race against a concurrent batch;
                        // re-read and re-resolve.
                        debug!(guest = %event.guest_email, "check-in CAS missed, retrying");
                        continue;
                    }

                    let mut record = AuditRecord::new(
                        &event.guest_email,
                        event.checked_in_at,
                        event.origin,
                        actor,
                        AuditOutcome::Applied,
                    );
                    if let Some(conflict) = conflict {
                        record = record.with_conflict(conflict);
                    }
                    self.audit.append(&record)?;

                    self.link_invitation(&guest.id, event);
                    debug!(
                        guest = %event.guest_email,
                        at = %event.checked_in_at,
                        origin = %event.origin,
                        "check-in applied"
                    );
                    return Ok(EventDisposition::Applied);
                },
            }
        }

        warn!(
            guest = %event.guest_email,
            attempts = MAX_CAS_ATTEMPTS,
            "check-in contention exhausted retries"
        );
        Ok(EventDisposition::Failed(FailureReason::Internal))
    }

    /// Best-effort downstream linkage: stamp the guest's invitation with
    /// the arrival. Failure never invalidates the check-in outcome.
    fn link_invitation(&self, guest_id: &str, event: &CheckinEvent) {
        match self
            .registry
            .link_invitation_arrival(guest_id, event.checked_in_at)
        {
            Ok(true) => {},
            Ok(false) => {
                debug!(guest = %event.guest_email, "no invitation to link for arrival");
            },
            Err(e) => {
                warn!(guest = %event.guest_email, error = %e, "invitation linkage failed");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use usher_core::checkin::Origin;
    use usher_core::guest::Guest;
    use usher_core::resolve::ConflictReason;

    use super::*;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 14, h, m, 0).unwrap()
    }

    fn event(email: &str, at: DateTime<Utc>, origin: Origin) -> CheckinEvent {
        CheckinEvent::new(email, at, origin)
    }

    fn setup() -> (ReconciliationService, Arc<SqliteGuestRegistry>, Arc<SqliteAuditLog>) {
        let registry = Arc::new(SqliteGuestRegistry::in_memory().unwrap());
        registry
            .upsert_guest(&Guest::new("g-1", "ada@example.com", "Ada"))
            .unwrap();
        let audit = Arc::new(SqliteAuditLog::in_memory().unwrap());
        (
            ReconciliationService::new(Arc::clone(&registry), Arc::clone(&audit)),
            registry,
            audit,
        )
    }

    #[test]
    fn first_checkin_applies_without_conflict() {
        let (service, registry, audit) = setup();
        let outcome = service
            .apply(&[event("ada@example.com", ts(10, 0), Origin::Remote)], "op-1")
            .unwrap();

        assert_eq!(outcome.success_count(), 1);
        assert_eq!(outcome.applied_count(), 1);
        assert!(outcome.failed().is_empty());

        let guest = registry.find_by_email("ada@example.com").unwrap().unwrap();
        assert_eq!(guest.checked_in_at, Some(ts(10, 0)));
        assert!(guest.is_consistent());

        let records = audit.read_from(0, 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AuditOutcome::Applied);
        assert!(!records[0].is_conflict());
        assert_eq!(records[0].actor, "op-1");
    }

    #[test]
    fn earlier_offline_arrival_replaces_existing() {
        // Event A {10:00, online}, then event B {09:58, offline}: after A
        // the guest shows 10:00; after B the earlier offline arrival wins.
        let (service, registry, audit) = setup();
        service
            .apply(&[event("ada@example.com", ts(10, 0), Origin::Remote)], "op-1")
            .unwrap();
        let outcome = service
            .apply(&[event("ada@example.com", ts(9, 58), Origin::Local)], "op-1")
            .unwrap();
        assert_eq!(outcome.applied_count(), 1);

        let guest = registry.find_by_email("ada@example.com").unwrap().unwrap();
        assert_eq!(guest.checked_in_at, Some(ts(9, 58)));

        let records = audit.read_from(0, 10).unwrap();
        assert_eq!(records.len(), 2);
        let conflict = records[1].conflict.unwrap();
        assert_eq!(conflict.reason, ConflictReason::OlderOffline);
        assert_eq!(conflict.existing_at, ts(10, 0));
        assert_eq!(
            conflict.resolution,
            usher_core::resolve::ConflictResolution::ReplacedExisting
        );
    }

    #[test]
    fn later_event_is_superseded_not_failed() {
        let (service, registry, _audit) = setup();
        service
            .apply(&[event("ada@example.com", ts(9, 58), Origin::Local)], "op-1")
            .unwrap();
        let outcome = service
            .apply(&[event("ada@example.com", ts(10, 5), Origin::Remote)], "op-1")
            .unwrap();

        // Counted as success, reported as non-applying.
        assert_eq!(outcome.success_count(), 1);
        assert_eq!(outcome.applied_count(), 0);
        assert!(outcome.failed().is_empty());

        let guest = registry.find_by_email("ada@example.com").unwrap().unwrap();
        assert_eq!(guest.checked_in_at, Some(ts(9, 58)));
    }

    #[test]
    fn duplicate_resubmission_is_idempotent() {
        // Event C repeats an already-applied (guest, timestamp, origin)
        // triple: no state change, a fresh audit record, still a success.
        let (service, registry, audit) = setup();
        let repeated = event("ada@example.com", ts(9, 58), Origin::Local);
        service.apply(std::slice::from_ref(&repeated), "op-1").unwrap();

        let before = registry.find_by_email("ada@example.com").unwrap().unwrap();
        let outcome = service.apply(std::slice::from_ref(&repeated), "op-1").unwrap();
        let after = registry.find_by_email("ada@example.com").unwrap().unwrap();

        assert_eq!(outcome.success_count(), 1);
        assert_eq!(outcome.applied_count(), 0);
        assert_eq!(before, after);

        let records = audit.read_from(0, 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].outcome, AuditOutcome::Superseded);
        assert_eq!(records[1].conflict_reason(), Some(ConflictReason::Duplicate));
    }

    #[test]
    fn equal_timestamp_prefers_online_in_both_orders() {
        let at = ts(10, 0);

        // offline first, online second.
        let (service, registry, _) = setup();
        service
            .apply(&[event("ada@example.com", at, Origin::Local)], "op-1")
            .unwrap();
        service
            .apply(&[event("ada@example.com", at, Origin::Remote)], "op-1")
            .unwrap();
        let guest = registry.find_by_email("ada@example.com").unwrap().unwrap();
        assert_eq!(guest.checkin_origin, Some(Origin::Remote));

        // online first, offline second.
        let (service, registry, _) = setup();
        service
            .apply(&[event("ada@example.com", at, Origin::Remote)], "op-1")
            .unwrap();
        service
            .apply(&[event("ada@example.com", at, Origin::Local)], "op-1")
            .unwrap();
        let guest = registry.find_by_email("ada@example.com").unwrap().unwrap();
        assert_eq!(guest.checkin_origin, Some(Origin::Remote));
        assert_eq!(guest.checked_in_at, Some(at));
    }

    #[test]
    fn unknown_guest_fails_unretryably_and_is_audited() {
        let (service, _, audit) = setup();
        let outcome = service
            .apply(&[event("ghost@example.com", ts(10, 0), Origin::Local)], "op-1")
            .unwrap();

        let failed = outcome.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reason, FailureReason::GuestNotFound);
        assert!(!failed[0].reason.is_retryable());

        let records = audit.read_from(0, 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AuditOutcome::Rejected);
    }

    #[test]
    fn malformed_event_fails_without_audit_record() {
        let (service, _, audit) = setup();
        let outcome = service
            .apply(&[event("not-an-email", ts(10, 0), Origin::Local)], "op-1")
            .unwrap();

        assert_eq!(outcome.failed()[0].reason, FailureReason::InvalidEmail);
        assert_eq!(audit.stats().unwrap().record_count, 0);
    }

    #[test]
    fn every_considered_event_is_audited_exactly_once() {
        let (service, registry, audit) = setup();
        registry
            .upsert_guest(&Guest::new("g-2", "grace@example.com", "Grace"))
            .unwrap();

        let batch = vec![
            event("ada@example.com", ts(10, 0), Origin::Remote),
            event("grace@example.com", ts(10, 1), Origin::Local),
            event("ada@example.com", ts(10, 2), Origin::Local), // superseded
            event("ghost@example.com", ts(10, 3), Origin::Local), // rejected
        ];
        service.apply(&batch, "op-1").unwrap();

        assert_eq!(audit.stats().unwrap().record_count, 4);
    }

    #[test]
    fn same_guest_events_in_one_batch_are_serialized_in_order() {
        let (service, registry, _) = setup();
        let outcome = service
            .apply(
                &[
                    event("ada@example.com", ts(10, 0), Origin::Remote),
                    event("ada@example.com", ts(9, 58), Origin::Local),
                    event("ada@example.com", ts(10, 30), Origin::Local),
                ],
                "op-1",
            )
            .unwrap();

        assert_eq!(outcome.success_count(), 3);
        assert_eq!(outcome.applied_count(), 2);

        let guest = registry.find_by_email("ada@example.com").unwrap().unwrap();
        assert_eq!(guest.checked_in_at, Some(ts(9, 58)));
    }

    #[test]
    fn applied_arrival_links_invitation_best_effort() {
        let (service, registry, _) = setup();
        registry.upsert_invitation("inv-1", "g-1", "ABC123").unwrap();

        service
            .apply(&[event("ada@example.com", ts(10, 0), Origin::Remote)], "op-1")
            .unwrap();
        assert_eq!(registry.invitation_arrival("g-1").unwrap(), Some(ts(10, 0)));
    }

    #[test]
    fn missing_invitation_does_not_affect_outcome() {
        let (service, _, _) = setup();
        let outcome = service
            .apply(&[event("ada@example.com", ts(10, 0), Origin::Remote)], "op-1")
            .unwrap();
        assert_eq!(outcome.applied_count(), 1);
    }
}
