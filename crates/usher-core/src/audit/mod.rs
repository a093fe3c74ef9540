//! Append-only audit trail of check-in resolutions.
//!
//! Every check-in event that reaches business logic yields exactly one
//! [`AuditRecord`], whether or not it changed guest state. This is what
//! lets an operator answer *why* a guest's arrival time reflects what it
//! does. Records are only ever appended, never modified or deleted, and
//! only the reconciliation service writes them.

mod storage;

use chrono::{DateTime, Utc};

use crate::checkin::Origin;
use crate::resolve::{Conflict, ConflictReason, ConflictResolution};
pub use storage::{AuditLogError, AuditLogStats, ConflictPage, SqliteAuditLog};

/// How the event was disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    /// The event became the authoritative check-in.
    Applied,
    /// A conflict was detected and the existing state kept.
    Superseded,
    /// The event was rejected by business rules (guest not found).
    Rejected,
}

impl AuditOutcome {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Superseded => "superseded",
            Self::Rejected => "rejected",
        }
    }

    /// Parses the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "applied" => Some(Self::Applied),
            "superseded" => Some(Self::Superseded),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// One audit entry: a check-in attempt and its resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// Sequence id, assigned on append.
    pub seq_id: Option<u64>,

    /// Email of the guest the event referenced.
    pub guest_email: String,

    /// The event's operator-observed arrival time.
    pub event_at: DateTime<Utc>,

    /// Capture origin of the event.
    pub origin: Origin,

    /// Caller identity that submitted the event.
    pub actor: String,

    /// Disposition.
    pub outcome: AuditOutcome,

    /// Conflict details, when one was detected.
    pub conflict: Option<Conflict>,

    /// When the resolution was made (detection time).
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(
        guest_email: impl Into<String>,
        event_at: DateTime<Utc>,
        origin: Origin,
        actor: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            seq_id: None,
            guest_email: guest_email.into(),
            event_at,
            origin,
            actor: actor.into(),
            outcome,
            conflict: None,
            recorded_at: Utc::now(),
        }
    }

    /// Attaches conflict details (builder pattern).
    #[must_use]
    pub fn with_conflict(mut self, conflict: Conflict) -> Self {
        self.conflict = Some(conflict);
        self
    }

    /// Whether this record flags a conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        self.conflict.is_some()
    }

    /// Conflict reason code, when flagged.
    #[must_use]
    pub fn conflict_reason(&self) -> Option<ConflictReason> {
        self.conflict.map(|c| c.reason)
    }

    /// Conflict resolution, when flagged.
    #[must_use]
    pub fn conflict_resolution(&self) -> Option<ConflictResolution> {
        self.conflict.map(|c| c.resolution)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn record_builder() {
        let event_at = Utc.with_ymd_and_hms(2025, 6, 14, 9, 58, 0).unwrap();
        let record = AuditRecord::new(
            "ada@example.com",
            event_at,
            Origin::Local,
            "operator-1",
            AuditOutcome::Applied,
        )
        .with_conflict(Conflict {
            reason: ConflictReason::OlderOffline,
            resolution: ConflictResolution::ReplacedExisting,
            existing_at: Utc.with_ymd_and_hms(2025, 6, 14, 10, 0, 0).unwrap(),
        });

        assert!(record.seq_id.is_none());
        assert!(record.is_conflict());
        assert_eq!(record.conflict_reason(), Some(ConflictReason::OlderOffline));
        assert_eq!(record.outcome, AuditOutcome::Applied);
        assert!(record.recorded_at >= event_at);
    }

    #[test]
    fn outcome_round_trips() {
        for outcome in [
            AuditOutcome::Applied,
            AuditOutcome::Superseded,
            AuditOutcome::Rejected,
        ] {
            assert_eq!(AuditOutcome::parse(outcome.as_str()), Some(outcome));
        }
    }
}
