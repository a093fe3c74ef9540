//! Deterministic conflict resolution for check-in events.
//!
//! The resolver decides, for one incoming event against a guest's current
//! check-in state, whether the event becomes authoritative. It is a pure
//! function: callers (the reconciliation service) own the read, the
//! compare-and-set write, and the audit append.
//!
//! # Resolution rules
//!
//! - No existing check-in: the event applies.
//! - Incoming timestamp later than existing: the earlier arrival record
//!   wins; the event is superseded (reason `duplicate`).
//! - Incoming timestamp earlier than existing: the event represents an
//!   arrival that actually happened first but was recorded late (typically
//!   an offline capture synced afterward); it replaces the existing state
//!   (reason `older_offline`).
//! - Timestamps exactly equal: origin breaks the tie, `online` beating
//!   `offline` regardless of which arrived first (reason `same_timestamp`).
//!   Equal timestamp and equal origin is an idempotent replay: the existing
//!   state is kept and the event still counts as accepted.
//!
//! For every sequence of events targeting one guest, the final state holds
//! the minimum timestamp among accepted events, independent of delivery
//! order.

use chrono::{DateTime, Utc};

use crate::checkin::Origin;

/// A guest's current check-in state, as read before resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistingCheckin {
    /// Currently authoritative arrival time.
    pub at: DateTime<Utc>,
    /// Origin of the event that produced it.
    pub origin: Origin,
}

/// Why a conflict was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Incoming event is a later (or replayed) record of the same arrival.
    Duplicate,
    /// Incoming event carries an earlier arrival recorded late.
    OlderOffline,
    /// Timestamps are identical; origin decided.
    SameTimestamp,
}

impl ConflictReason {
    /// Audit-log representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::OlderOffline => "older_offline",
            Self::SameTimestamp => "same_timestamp",
        }
    }

    /// Parses the audit-log representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "duplicate" => Some(Self::Duplicate),
            "older_offline" => Some(Self::OlderOffline),
            "same_timestamp" => Some(Self::SameTimestamp),
            _ => None,
        }
    }
}

/// Which side a conflict resolution kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Existing state kept; incoming event superseded.
    KeptExisting,
    /// Existing state replaced by the incoming event.
    ReplacedExisting,
}

impl ConflictResolution {
    /// Audit-log representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeptExisting => "kept=existing",
            Self::ReplacedExisting => "replaced=existing",
        }
    }

    /// Parses the audit-log representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "kept=existing" => Some(Self::KeptExisting),
            "replaced=existing" => Some(Self::ReplacedExisting),
            _ => None,
        }
    }
}

/// A detected conflict and how it was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    /// Reason code.
    pub reason: ConflictReason,
    /// Which side was kept.
    pub resolution: ConflictResolution,
    /// The existing timestamp at decision time.
    pub existing_at: DateTime<Utc>,
}

/// Outcome of resolving one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The event becomes authoritative; guest state must be updated.
    Apply {
        /// Present when an existing check-in was replaced.
        conflict: Option<Conflict>,
    },
    /// The existing state stands; no state change. Still a success.
    Keep {
        /// The conflict that was detected and resolved.
        conflict: Conflict,
    },
}

impl Decision {
    /// Whether this decision changes guest state.
    #[must_use]
    pub const fn applies(&self) -> bool {
        matches!(self, Self::Apply { .. })
    }

    /// The conflict, if one was detected.
    #[must_use]
    pub const fn conflict(&self) -> Option<Conflict> {
        match self {
            Self::Apply { conflict } => *conflict,
            Self::Keep { conflict } => Some(*conflict),
        }
    }
}

/// Resolves one incoming event against the guest's current state.
#[must_use]
pub fn resolve(
    existing: Option<ExistingCheckin>,
    incoming_at: DateTime<Utc>,
    incoming_origin: Origin,
) -> Decision {
    let Some(existing) = existing else {
        return Decision::Apply { conflict: None };
    };

    use std::cmp::Ordering;
    match incoming_at.cmp(&existing.at) {
        Ordering::Greater => Decision::Keep {
            conflict: Conflict {
                reason: ConflictReason::Duplicate,
                resolution: ConflictResolution::KeptExisting,
                existing_at: existing.at,
            },
        },
        Ordering::Less => Decision::Apply {
            conflict: Some(Conflict {
                reason: ConflictReason::OlderOffline,
                resolution: ConflictResolution::ReplacedExisting,
                existing_at: existing.at,
            }),
        },
        Ordering::Equal => {
            if incoming_origin == Origin::Remote && existing.origin == Origin::Local {
                Decision::Apply {
                    conflict: Some(Conflict {
                        reason: ConflictReason::SameTimestamp,
                        resolution: ConflictResolution::ReplacedExisting,
                        existing_at: existing.at,
                    }),
                }
            } else {
                // Same origin is the idempotent-replay case; offline never
                // displaces online at the same instant.
                Decision::Keep {
                    conflict: Conflict {
                        reason: if incoming_origin == existing.origin {
                            ConflictReason::Duplicate
                        } else {
                            ConflictReason::SameTimestamp
                        },
                        resolution: ConflictResolution::KeptExisting,
                        existing_at: existing.at,
                    },
                }
            }
        },
    }
}
