//! Check-in events and the sync wire types.
//!
//! A [`CheckinEvent`] is one attempt to mark a guest present. Events are
//! immutable once created; the station queues them in its outbox and the
//! daemon consumes them in batches. The serde representation of these types
//! is the wire format of `POST /checkins:sync`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where a check-in event was captured.
///
/// `Local` events were recorded while the station was disconnected and
/// delivered later through the outbox; `Remote` events were submitted
/// directly while connected. The origin is the tie-break signal for
/// equal-timestamp conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Captured while disconnected (wire name `offline`).
    #[serde(rename = "offline")]
    Local,
    /// Captured while connected (wire name `online`).
    #[serde(rename = "online")]
    Remote,
}

impl Origin {
    /// Wire and storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "offline",
            Self::Remote => "online",
        }
    }

    /// Parses the wire/storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "offline" => Some(Self::Local),
            "online" => Some(Self::Remote),
            _ => None,
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt to mark a guest present.
///
/// The timestamp is the operator-observed time of arrival, not the time of
/// submission; an event captured offline carries the arrival time it was
/// recorded with, however late it syncs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckinEvent {
    /// Guest id, when the station knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_id: Option<String>,

    /// Guest email (natural key for matching).
    pub guest_email: String,

    /// Operator-observed arrival time.
    pub checked_in_at: DateTime<Utc>,

    /// Capture origin.
    #[serde(rename = "source")]
    pub origin: Origin,

    /// Opaque annotation bag carried through to resolution.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl CheckinEvent {
    /// Creates an event with an empty metadata bag.
    #[must_use]
    pub fn new(guest_email: impl Into<String>, checked_in_at: DateTime<Utc>, origin: Origin) -> Self {
        Self {
            guest_id: None,
            guest_email: guest_email.into(),
            checked_in_at,
            origin,
            metadata: serde_json::Map::new(),
        }
    }

    /// Validates the event before it reaches business logic.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when the email is syntactically invalid.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_email(&self.guest_email)
    }
}

/// Validation failure for a check-in event.
///
/// Events failing validation never reach the resolver and produce no audit
/// record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The guest email is not a plausible address.
    #[error("invalid email: {email}")]
    InvalidEmail {
        /// The offending value.
        email: String,
    },
}

/// Maximum accepted email length (RFC 5321 path limit).
const MAX_EMAIL_LEN: usize = 254;

/// Syntactic email check: one `@`, non-empty local part, a domain with a
/// dot, no whitespace. Deliverability is not this layer's problem.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidEmail`] when the shape is wrong.
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidEmail {
        email: email.to_string(),
    };

    if email.is_empty() || email.len() > MAX_EMAIL_LEN || email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let (host, tld) = domain.rsplit_once('.').ok_or_else(invalid)?;
    if host.is_empty() || tld.is_empty() {
        return Err(invalid());
    }
    Ok(())
}

// ============================================================================
// Wire types for POST /checkins:sync
// ============================================================================

/// Request body of `POST /checkins:sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Events to reconcile, in arrival order.
    pub checks: Vec<CheckinEvent>,
}

/// Response body of `POST /checkins:sync`.
///
/// `success_count` counts every event that was durably considered,
/// applied and superseded alike. Only events in `failed` need dispatcher
/// attention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Number of events accepted (applied or resolved as duplicates).
    #[serde(rename = "successCount")]
    pub success_count: u32,

    /// Per-event failures.
    pub failed: Vec<FailedCheck>,
}

/// One failed event in a sync response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCheck {
    /// Email of the guest the event referenced.
    pub guest_email: String,

    /// Why the event failed.
    pub reason: FailureReason,
}

/// Reason a check-in event was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// No guest matches the event's email. Retrying cannot succeed.
    #[serde(rename = "guest not found")]
    GuestNotFound,

    /// The event failed validation and never reached business logic.
    #[serde(rename = "invalid email")]
    InvalidEmail,

    /// Transient server-side fault; safe to resubmit.
    #[serde(rename = "internal error")]
    Internal,
}

impl FailureReason {
    /// Whether the dispatcher should keep the entry queued and retry.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Internal)
    }

    /// Wire representation, as it appears in `failed[].reason`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GuestNotFound => "guest not found",
            Self::InvalidEmail => "invalid email",
            Self::Internal => "internal error",
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn origin_wire_names() {
        assert_eq!(Origin::Local.as_str(), "offline");
        assert_eq!(Origin::Remote.as_str(), "online");
        assert_eq!(Origin::parse("offline"), Some(Origin::Local));
        assert_eq!(Origin::parse("online"), Some(Origin::Remote));
        assert_eq!(Origin::parse("carrier-pigeon"), None);
    }

    #[test]
    fn event_serializes_to_wire_shape() {
        let event = CheckinEvent::new(
            "ada@example.com",
            Utc.with_ymd_and_hms(2025, 6, 14, 10, 0, 0).unwrap(),
            Origin::Local,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["guest_email"], "ada@example.com");
        assert_eq!(json["source"], "offline");
        // Empty metadata and unknown guest_id are omitted from the wire.
        assert!(json.get("metadata").is_none());
        assert!(json.get("guest_id").is_none());
    }

    #[test]
    fn sync_response_uses_camel_case_count() {
        let response = SyncResponse {
            success_count: 3,
            failed: vec![FailedCheck {
                guest_email: "ghost@example.com".to_string(),
                reason: FailureReason::GuestNotFound,
            }],
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["successCount"], 3);
        assert_eq!(json["failed"][0]["reason"], "guest not found");
    }

    #[test]
    fn email_validation_accepts_plausible_addresses() {
        for ok in ["ada@example.com", "a.b+c@sub.example.org", "x@y.zz"] {
            assert_eq!(validate_email(ok), Ok(()), "{ok}");
        }
    }

    #[test]
    fn email_validation_rejects_malformed_addresses() {
        for bad in [
            "",
            "no-at-sign",
            "@example.com",
            "ada@",
            "ada@nodot",
            "ada@.com",
            "ada@example.",
            "ada @example.com",
            "a@b@c.com",
        ] {
            assert!(validate_email(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn failure_reason_retryability() {
        assert!(!FailureReason::GuestNotFound.is_retryable());
        assert!(!FailureReason::InvalidEmail.is_retryable());
        assert!(FailureReason::Internal.is_retryable());
    }
}
