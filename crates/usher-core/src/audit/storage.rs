//! `SQLite`-backed audit log storage.
//!
//! Uses WAL mode so the conflict-inspection read surface can page through
//! records while the reconciliation service appends. The API exposes no
//! update or delete; append-only semantics are the point.

// SQLite returns i64 for row IDs and counts, but they're always non-negative.
#![allow(clippy::cast_sign_loss)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};
use thiserror::Error;

use super::{AuditOutcome, AuditRecord};
use crate::checkin::Origin;
use crate::resolve::{Conflict, ConflictReason, ConflictResolution};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors from audit log operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditLogError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored row could not be decoded back into a record.
    #[error("corrupt audit row at seq_id={seq_id}: {details}")]
    CorruptRow {
        /// Sequence id of the offending row.
        seq_id: u64,
        /// What failed to decode.
        details: String,
    },
}

/// Statistics about the audit log.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditLogStats {
    /// Total records.
    pub record_count: u64,
    /// Records flagged as conflicts.
    pub conflict_count: u64,
}

/// One page of conflict-flagged records.
#[derive(Debug, Clone)]
pub struct ConflictPage {
    /// Records in ascending sequence order.
    pub records: Vec<AuditRecord>,
    /// Cursor to pass for the next page; `None` when exhausted.
    pub next_cursor: Option<u64>,
}

/// The append-only audit log.
pub struct SqliteAuditLog {
    conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    path: Option<PathBuf>,
}

impl SqliteAuditLog {
    /// Opens or creates an audit log at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditLogError> {
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

    /// Creates an in-memory audit log for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, AuditLogError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Appends one record, returning its assigned sequence id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn append(&self, record: &AuditRecord) -> Result<u64, AuditLogError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO audit_records (guest_email, event_at, origin, actor, outcome,
                                        conflict_reason, conflict_resolution, existing_at, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.guest_email,
                record.event_at.to_rfc3339(),
                record.origin.as_str(),
                record.actor,
                record.outcome.as_str(),
                record.conflict.map(|c| c.reason.as_str()),
                record.conflict.map(|c| c.resolution.as_str()),
                record.conflict.map(|c| c.existing_at.to_rfc3339()),
                record.recorded_at.to_rfc3339(),
            ],
        )?;

        Ok(conn.last_insert_rowid() as u64)
    }

    /// Reads records with `seq_id >= cursor`, up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub fn read_from(&self, cursor: u64, limit: u64) -> Result<Vec<AuditRecord>, AuditLogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT seq_id, guest_email, event_at, origin, actor, outcome,
                    conflict_reason, conflict_resolution, existing_at, recorded_at
             FROM audit_records
             WHERE seq_id >= ?1
             ORDER BY seq_id ASC
             LIMIT ?2",
        )?;

        let rows = stmt.query_and_then(params![cursor, limit], record_from_row)?;
        rows.collect()
    }

    /// Pages through conflict-flagged records starting at `cursor`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub fn conflicts(&self, cursor: u64, limit: u64) -> Result<ConflictPage, AuditLogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT seq_id, guest_email, event_at, origin, actor, outcome,
                    conflict_reason, conflict_resolution, existing_at, recorded_at
             FROM audit_records
             WHERE conflict_reason IS NOT NULL AND seq_id >= ?1
             ORDER BY seq_id ASC
             LIMIT ?2",
        )?;

        let records: Vec<AuditRecord> = stmt
            .query_and_then(params![cursor, limit], record_from_row)?
            .collect::<Result<_, _>>()?;

        let next_cursor = if records.len() as u64 == limit {
            records.last().and_then(|r| r.seq_id).map(|id| id + 1)
        } else {
            None
        };

        Ok(ConflictPage {
            records,
            next_cursor,
        })
    }

    /// Gathers record counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the queries fail.
    pub fn stats(&self) -> Result<AuditLogStats, AuditLogError> {
        let conn = self.lock();
        let record_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM audit_records", [], |row| row.get(0))?;
        let conflict_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_records WHERE conflict_reason IS NOT NULL",
            [],
            |row| row.get(0),
        )?;

        Ok(AuditLogStats {
            record_count: record_count as u64,
            conflict_count: conflict_count as u64,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Decodes one audit row, mapping stored text back to domain enums.
fn record_from_row(row: &Row<'_>) -> Result<AuditRecord, AuditLogError> {
    let seq_id = row.get::<_, i64>(0)? as u64;
    let corrupt = |details: &str| AuditLogError::CorruptRow {
        seq_id,
        details: details.to_string(),
    };

    let origin_text: String = row.get(3)?;
    let origin = Origin::parse(&origin_text).ok_or_else(|| corrupt("origin"))?;
    let outcome_text: String = row.get(5)?;
    let outcome = AuditOutcome::parse(&outcome_text).ok_or_else(|| corrupt("outcome"))?;

    let conflict = match row.get::<_, Option<String>>(6)? {
        Some(reason_text) => {
            let reason = ConflictReason::parse(&reason_text).ok_or_else(|| corrupt("conflict_reason"))?;
            let resolution_text: String = row
                .get::<_, Option<String>>(7)?
                .ok_or_else(|| corrupt("conflict_resolution"))?;
            let resolution = ConflictResolution::parse(&resolution_text)
                .ok_or_else(|| corrupt("conflict_resolution"))?;
            let existing_text: String = row
                .get::<_, Option<String>>(8)?
                .ok_or_else(|| corrupt("existing_at"))?;
            Some(Conflict {
                reason,
                resolution,
                existing_at: parse_ts(&existing_text).ok_or_else(|| corrupt("existing_at"))?,
            })
        },
        None => None,
    };

    let event_at_text: String = row.get(2)?;
    let recorded_at_text: String = row.get(9)?;

    Ok(AuditRecord {
        seq_id: Some(seq_id),
        guest_email: row.get(1)?,
        event_at: parse_ts(&event_at_text).ok_or_else(|| corrupt("event_at"))?,
        origin,
        actor: row.get(4)?,
        outcome,
        conflict,
        recorded_at: parse_ts(&recorded_at_text).ok_or_else(|| corrupt("recorded_at"))?,
    })
}

fn parse_ts(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn sample(email: &str, outcome: AuditOutcome, conflicted: bool) -> AuditRecord {
        let event_at = Utc.with_ymd_and_hms(2025, 6, 14, 10, 0, 0).unwrap();
        let record = AuditRecord::new(email, event_at, Origin::Local, "operator-1", outcome);
        if conflicted {
            record.with_conflict(Conflict {
                reason: ConflictReason::Duplicate,
                resolution: ConflictResolution::KeptExisting,
                existing_at: Utc.with_ymd_and_hms(2025, 6, 14, 9, 58, 0).unwrap(),
            })
        } else {
            record
        }
    }

    #[test]
    fn append_assigns_increasing_seq_ids() {
        let log = SqliteAuditLog::in_memory().unwrap();
        let a = log.append(&sample("a@example.com", AuditOutcome::Applied, false)).unwrap();
        let b = log.append(&sample("b@example.com", AuditOutcome::Superseded, true)).unwrap();
        assert!(b > a);
    }

    #[test]
    fn records_round_trip() {
        let log = SqliteAuditLog::in_memory().unwrap();
        let record = sample("ada@example.com", AuditOutcome::Superseded, true);
        let seq = log.append(&record).unwrap();

        let read = log.read_from(seq, 10).unwrap();
        assert_eq!(read.len(), 1);
        let got = &read[0];
        assert_eq!(got.seq_id, Some(seq));
        assert_eq!(got.guest_email, record.guest_email);
        assert_eq!(got.event_at, record.event_at);
        assert_eq!(got.origin, record.origin);
        assert_eq!(got.actor, record.actor);
        assert_eq!(got.outcome, record.outcome);
        assert_eq!(got.conflict, record.conflict);
        assert_eq!(got.recorded_at, record.recorded_at);
    }

    #[test]
    fn conflict_pagination() {
        let log = SqliteAuditLog::in_memory().unwrap();
        for i in 0..5 {
            // Interleave conflict and non-conflict records.
            log.append(&sample(&format!("c{i}@example.com"), AuditOutcome::Superseded, true))
                .unwrap();
            log.append(&sample(&format!("p{i}@example.com"), AuditOutcome::Applied, false))
                .unwrap();
        }

        let first = log.conflicts(0, 3).unwrap();
        assert_eq!(first.records.len(), 3);
        assert!(first.records.iter().all(AuditRecord::is_conflict));
        let cursor = first.next_cursor.expect("more pages");

        let second = log.conflicts(cursor, 3).unwrap();
        assert_eq!(second.records.len(), 2);
        // A short page may still return a cursor only when exactly full.
        assert!(second.next_cursor.is_none());

        let stats = log.stats().unwrap();
        assert_eq!(stats.record_count, 10);
        assert_eq!(stats.conflict_count, 5);
    }

    #[test]
    fn log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        {
            let log = SqliteAuditLog::open(&path).unwrap();
            log.append(&sample("ada@example.com", AuditOutcome::Applied, false))
                .unwrap();
        }
        let reopened = SqliteAuditLog::open(&path).unwrap();
        assert_eq!(reopened.stats().unwrap().record_count, 1);
    }
}
