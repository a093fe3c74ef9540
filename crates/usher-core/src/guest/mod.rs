//! Guest records and attendance state.
//!
//! A [`Guest`] row is owned by the reconciliation daemon; the station keeps
//! a read-only cache of it. The natural key for matching check-in events to
//! guests is the email address, which is assumed unique.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkin::Origin;

/// Attendance status of a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    /// No RSVP response recorded.
    Unconfirmed,
    /// Guest confirmed attendance.
    Confirmed,
    /// Guest declined.
    Declined,
}

impl AttendanceStatus {
    /// Storage representation of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unconfirmed => "unconfirmed",
            Self::Confirmed => "confirmed",
            Self::Declined => "declined",
        }
    }

    /// Parses the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unconfirmed" => Some(Self::Unconfirmed),
            "confirmed" => Some(Self::Confirmed),
            "declined" => Some(Self::Declined),
            _ => None,
        }
    }
}

/// A guest in the shared record.
///
/// `checkin_origin` records the origin of the event that produced the
/// current `checked_in_at`; the resolver needs it for the equal-timestamp
/// tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    /// Opaque identifier.
    pub id: String,

    /// Unique email address (natural key for event matching).
    pub email: String,

    /// Display name.
    pub display_name: String,

    /// Attendance status.
    pub status: AttendanceStatus,

    /// Authoritative arrival time, if checked in.
    pub checked_in_at: Option<DateTime<Utc>>,

    /// Origin of the event that set `checked_in_at`.
    pub checkin_origin: Option<Origin>,
}

impl Guest {
    /// Creates a guest with no check-in and unconfirmed attendance.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        email: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            display_name: display_name.into(),
            status: AttendanceStatus::Unconfirmed,
            checked_in_at: None,
            checkin_origin: None,
        }
    }

    /// Whether the guest has an authoritative arrival recorded.
    #[must_use]
    pub const fn is_checked_in(&self) -> bool {
        self.checked_in_at.is_some()
    }

    /// Checks the record invariant: a non-null `checked_in_at` implies
    /// confirmed attendance, and carries the origin that produced it.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        match self.checked_in_at {
            Some(_) => self.status == AttendanceStatus::Confirmed && self.checkin_origin.is_some(),
            None => self.checkin_origin.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn new_guest_is_consistent() {
        let guest = Guest::new("g-1", "ada@example.com", "Ada");
        assert_eq!(guest.status, AttendanceStatus::Unconfirmed);
        assert!(!guest.is_checked_in());
        assert!(guest.is_consistent());
    }

    #[test]
    fn checkin_without_confirmed_status_is_inconsistent() {
        let mut guest = Guest::new("g-1", "ada@example.com", "Ada");
        guest.checked_in_at = Some(Utc.with_ymd_and_hms(2025, 6, 14, 10, 0, 0).unwrap());
        guest.checkin_origin = Some(Origin::Remote);
        assert!(!guest.is_consistent());

        guest.status = AttendanceStatus::Confirmed;
        assert!(guest.is_consistent());
    }

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [
            AttendanceStatus::Unconfirmed,
            AttendanceStatus::Confirmed,
            AttendanceStatus::Declined,
        ] {
            assert_eq!(AttendanceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AttendanceStatus::parse("maybe"), None);
    }
}
