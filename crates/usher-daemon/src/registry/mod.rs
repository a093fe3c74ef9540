//! The shared guest registry.
//!
//! `SQLite`-backed owner of the authoritative guest record. Check-in
//! updates go through [`SqliteGuestRegistry::try_apply_checkin`], a
//! per-guest compare-and-set: the update only lands if the row still holds
//! the state the resolver decided against, so two concurrent resolutions
//! for the same guest cannot interleave and both win. Callers re-read and
//! re-resolve on a CAS miss.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};
use thiserror::Error;
use usher_core::checkin::Origin;
use usher_core::guest::{AttendanceStatus, Guest};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors from guest registry operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
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

/// The `SQLite` guest registry.
pub struct SqliteGuestRegistry {
    conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    path: Option<PathBuf>,
}

impl SqliteGuestRegistry {
    /// Opens or creates the registry at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
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

    /// Creates an in-memory registry for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Inserts or replaces a guest row.
    ///
    /// Guest-list management itself is an external collaborator; this
    /// exists for seeding and for that collaborator to write through.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn upsert_guest(&self, guest: &Guest) -> Result<(), RegistryError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO guests (id, email, display_name, status, checked_in_at, checkin_origin)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 email = excluded.email,
                 display_name = excluded.display_name,
                 status = excluded.status,
                 checked_in_at = excluded.checked_in_at,
                 checkin_origin = excluded.checkin_origin",
            params![
                guest.id,
                guest.email,
                guest.display_name,
                guest.status.as_str(),
                guest.checked_in_at.map(|t| t.to_rfc3339()),
                guest.checkin_origin.map(Origin::as_str),
            ],
        )?;
        Ok(())
    }

    /// Creates an invitation row linked to a guest.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn upsert_invitation(&self, id: &str, guest_id: &str, code: &str) -> Result<(), RegistryError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO invitations (id, guest_id, code, arrived_at)
             VALUES (?1, ?2, ?3, NULL)
             ON CONFLICT(id) DO UPDATE SET guest_id = excluded.guest_id, code = excluded.code",
            params![id, guest_id, code],
        )?;
        Ok(())
    }

    /// Looks up a guest by email.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row is corrupt.
    pub fn find_by_email(&self, email: &str) -> Result<Option<Guest>, RegistryError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, email, display_name, status, checked_in_at, checkin_origin
             FROM guests WHERE email = ?1",
        )?;
        let mut rows = stmt.query_and_then(params![email], guest_from_row)?;
        rows.next().transpose()
    }

    /// Lists all guests, for the station cache read-back.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub fn list_guests(&self) -> Result<Vec<Guest>, RegistryError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, email, display_name, status, checked_in_at, checkin_origin
             FROM guests ORDER BY email ASC",
        )?;
        let rows = stmt.query_and_then([], guest_from_row)?;
        rows.collect()
    }

    /// Atomically replaces a guest's check-in state, conditional on the
    /// state the caller observed.
    ///
    /// Returns `true` when the update landed; `false` means the row moved
    /// underneath the caller, who should re-read and re-resolve.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn try_apply_checkin(
        &self,
        guest_id: &str,
        observed: Option<DateTime<Utc>>,
        new_at: DateTime<Utc>,
        new_origin: Origin,
    ) -> Result<bool, RegistryError> {
        let conn = self.lock();
        let updated = match observed {
            None => conn.execute(
                "UPDATE guests
                 SET checked_in_at = ?2, checkin_origin = ?3, status = 'confirmed'
                 WHERE id = ?1 AND checked_in_at IS NULL",
                params![guest_id, new_at.to_rfc3339(), new_origin.as_str()],
            )?,
            Some(observed) => conn.execute(
                "UPDATE guests
                 SET checked_in_at = ?2, checkin_origin = ?3, status = 'confirmed'
                 WHERE id = ?1 AND checked_in_at = ?4",
                params![
                    guest_id,
                    new_at.to_rfc3339(),
                    new_origin.as_str(),
                    observed.to_rfc3339(),
                ],
            )?,
        };
        Ok(updated == 1)
    }

    /// Stamps the guest's invitation with the arrival, when one exists.
    ///
    /// Returns whether an invitation row was updated.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn link_invitation_arrival(
        &self,
        guest_id: &str,
        arrived_at: DateTime<Utc>,
    ) -> Result<bool, RegistryError> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE invitations SET arrived_at = ?2 WHERE guest_id = ?1",
            params![guest_id, arrived_at.to_rfc3339()],
        )?;
        Ok(updated == 1)
    }

    /// Invitation arrival stamp for a guest, for tests and inspection.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn invitation_arrival(&self, guest_id: &str) -> Result<Option<DateTime<Utc>>, RegistryError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT arrived_at FROM invitations WHERE guest_id = ?1")?;
        let mut rows = stmt.query_and_then(params![guest_id], |row: &Row<'_>| {
            let text: Option<String> = row.get(0)?;
            text.map(|t| {
                parse_ts(&t).ok_or_else(|| RegistryError::CorruptRow {
                    table: "invitations",
                    details: "arrived_at".to_string(),
                })
            })
            .transpose()
        })?;
        Ok(rows.next().transpose()?.flatten())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn guest_from_row(row: &Row<'_>) -> Result<Guest, RegistryError> {
    let corrupt = |details: &str| RegistryError::CorruptRow {
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

fn parse_ts(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
