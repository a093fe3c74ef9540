//! `SQLite` implementation of the local durable store.

// SQLite returns i64 for counts, but they're always non-negative.
#![allow(clippy::cast_sign_loss)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};
use thiserror::Error;
use usher_core::checkin::{CheckinEvent, Origin};
use usher_core::guest::{AttendanceStatus, Guest};
use uuid::Uuid;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Storage faults from the local durable store.
///
/// Distinct from business-rule errors: a storage fault means the capture
/// path cannot guarantee durability and must be surfaced to the operator
/// immediately.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored row could not be decoded.
    #[error("corrupt row in {table}: {details}")]
    CorruptRow {
        /// Table containing the row.
        table: &'static str,
        /// What failed to decode.
        details: String,
    },
}

/// A pending check-in wrapped with its locally-generated id.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    /// Locally-generated unique id.
    pub id: String,

    /// The wrapped event.
    pub event: CheckinEvent,

    /// Operator who recorded the check-in.
    pub recorded_by: String,

    /// Set once the server has acknowledged the event; delivered entries
    /// are excluded from future batches even if removal is interrupted.
    pub delivered: bool,

    /// When the entry was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

/// A dead-lettered check-in kept for operator follow-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedCheckin {
    /// The outbox entry id the event had.
    pub id: String,

    /// Guest email the event referenced.
    pub guest_email: String,

    /// The event's arrival timestamp.
    pub checked_in_at: DateTime<Utc>,

    /// Server-reported reason.
    pub reason: String,

    /// When the rejection was recorded locally.
    pub rejected_at: DateTime<Utc>,
}

/// The station's persistent store.
pub struct StationStore {
    conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    path: Option<PathBuf>,
}

impl StationStore {
    /// Opens or creates the store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    // ------------------------------------------------------------------
    // Guest cache
    // ------------------------------------------------------------------

    /// Replaces cached guest rows with the given records (upsert by id).
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn cache_guests(&self, guests: &[Guest]) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO guests (id, email, display_name, status, checked_in_at, checkin_origin)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                     email = excluded.email,
                     display_name = excluded.display_name,
                     status = excluded.status,
                     checked_in_at = excluded.checked_in_at,
                     checkin_origin = excluded.checkin_origin",
            )?;
            for guest in guests {
                stmt.execute(params![
                    guest.id,
                    guest.email,
                    guest.display_name,
                    guest.status.as_str(),
                    guest.checked_in_at.map(|t| t.to_rfc3339()),
                    guest.checkin_origin.map(Origin::as_str),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Looks up a cached guest by email.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row is corrupt.
    pub fn lookup_guest_by_email(&self, email: &str) -> Result<Option<Guest>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, email, display_name, status, checked_in_at, checkin_origin
             FROM guests WHERE email = ?1",
        )?;
        let mut rows = stmt.query_and_then(params![email], guest_from_row)?;
        rows.next().transpose()
    }

    /// Optimistically marks a cached guest as checked in.
    ///
    /// The server remains the final arbiter; an opportunistic cache
    /// refresh will overwrite this if the resolver decided differently.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn mark_checked_in(
        &self,
        email: &str,
        at: DateTime<Utc>,
        origin: Origin,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE guests
             SET checked_in_at = ?2, checkin_origin = ?3, status = 'confirmed'
             WHERE email = ?1",
            params![email, at.to_rfc3339(), origin.as_str()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbox
    // ------------------------------------------------------------------

    /// Appends an event to the outbox, returning the entry id.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the insert fails; the event is then NOT
    /// durably captured and the caller must surface the failure.
    pub fn enqueue(&self, event: &CheckinEvent, recorded_by: &str) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let metadata = serde_json::Value::Object(event.metadata.clone()).to_string();

        let conn = self.lock();
        conn.execute(
            "INSERT INTO outbox_checkins
                 (id, guest_id, guest_email, checked_in_at, recorded_by, source, metadata, delivered, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
            params![
                id,
                event.guest_id,
                event.guest_email,
                event.checked_in_at.to_rfc3339(),
                recorded_by,
                event.origin.as_str(),
                metadata,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    /// Lists undelivered entries in enqueue order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub fn list_pending(&self) -> Result<Vec<OutboxEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, guest_id, guest_email, checked_in_at, recorded_by, source, metadata, delivered, enqueued_at
             FROM outbox_checkins
             WHERE delivered = 0
             ORDER BY enqueued_at ASC, id ASC",
        )?;
        let rows = stmt.query_and_then([], entry_from_row)?;
        rows.collect()
    }

    /// Flags an entry as delivered once the server has recorded an outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn mark_delivered(&self, entry_id: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE outbox_checkins SET delivered = 1 WHERE id = ?1",
            params![entry_id],
        )?;
        Ok(())
    }

    /// Removes an entry after confirmed delivery (or dead-lettering).
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn remove(&self, entry_id: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM outbox_checkins WHERE id = ?1",
            params![entry_id],
        )?;
        Ok(())
    }

    /// Number of undelivered entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn pending_count(&self) -> Result<u64, StoreError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outbox_checkins WHERE delivered = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // Dead letters
    // ------------------------------------------------------------------

    /// Records an entry the server rejected as unretryable.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn record_rejected(&self, entry: &OutboxEntry, reason: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO rejected_checkins (id, guest_email, checked_in_at, reason, rejected_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.id,
                entry.event.guest_email,
                entry.event.checked_in_at.to_rfc3339(),
                reason,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Lists dead-lettered check-ins for the operator diagnostic view.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub fn list_rejected(&self) -> Result<Vec<RejectedCheckin>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, guest_email, checked_in_at, reason, rejected_at
             FROM rejected_checkins
             ORDER BY rejected_at ASC",
        )?;
        let rows = stmt.query_and_then([], |row: &Row<'_>| -> Result<RejectedCheckin, StoreError> {
            let checked_in_text: String = row.get(2)?;
            let rejected_text: String = row.get(4)?;
            Ok(RejectedCheckin {
                id: row.get(0)?,
                guest_email: row.get(1)?,
                checked_in_at: parse_ts(&checked_in_text).ok_or_else(|| StoreError::CorruptRow {
                    table: "rejected_checkins",
                    details: "checked_in_at".to_string(),
                })?,
                reason: row.get(3)?,
                rejected_at: parse_ts(&rejected_text).ok_or_else(|| StoreError::CorruptRow {
                    table: "rejected_checkins",
                    details: "rejected_at".to_string(),
                })?,
            })
        })?;
        rows.collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn guest_from_row(row: &Row<'_>) -> Result<Guest, StoreError> {
    let corrupt = |details: &str| StoreError::CorruptRow {
        table: "guests",
        details: details.to_string(),
    };

    let status_text: String = row.get(3)?;
    let checked_in_text: Option<String> = row.get(4)?;
    let origin_text: Option<String> = row.get(5)?;

    Ok(Guest {
        id: row.get(0)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
        status: AttendanceStatus::parse(&status_text).ok_or_else(|| corrupt("status"))?,
        checked_in_at: checked_in_text
            .map(|t| parse_ts(&t).ok_or_else(|| corrupt("checked_in_at")))
            .transpose()?,
        checkin_origin: origin_text
            .map(|t| Origin::parse(&t).ok_or_else(|| corrupt("checkin_origin")))
            .transpose()?,
    })
}

fn entry_from_row(row: &Row<'_>) -> Result<OutboxEntry, StoreError> {
    let corrupt = |details: &str| StoreError::CorruptRow {
        table: "outbox_checkins",
        details: details.to_string(),
    };

    let checked_in_text: String = row.get(3)?;
    let source_text: String = row.get(5)?;
    let metadata_text: String = row.get(6)?;
    let enqueued_text: String = row.get(8)?;

    let metadata = match serde_json::from_str::<serde_json::Value>(&metadata_text) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => return Err(corrupt("metadata")),
    };

    Ok(OutboxEntry {
        id: row.get(0)?,
        event: CheckinEvent {
            guest_id: row.get(1)?,
            guest_email: row.get(2)?,
            checked_in_at: parse_ts(&checked_in_text).ok_or_else(|| corrupt("checked_in_at"))?,
            origin: Origin::parse(&source_text).ok_or_else(|| corrupt("source"))?,
            metadata,
        },
        recorded_by: row.get(4)?,
        delivered: row.get::<_, i64>(7)? != 0,
        enqueued_at: parse_ts(&enqueued_text).ok_or_else(|| corrupt("enqueued_at"))?,
    })
}

fn parse_ts(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
