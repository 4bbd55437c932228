//! One-per-day attendance log backed by SQLite.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

pub const STATUS_PRESENT: &str = "Present";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to create store directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt time value {0:?}")]
    CorruptTime(String),
}

/// One attendance entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub name: String,
    pub day: NaiveDate,
    #[serde(serialize_with = "serialize_time")]
    pub time: NaiveTime,
    pub status: String,
}

fn serialize_time<S: serde::Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&t.format("%H:%M:%S").to_string())
}

/// Handle on the log of a single day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyLog {
    pub day: NaiveDate,
    pub entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkOutcome {
    pub already_marked: bool,
}

/// Append-only, deduplicated per `(name, day)`.
pub trait AttendanceStore: Send + Sync {
    /// Make sure the log for `day` exists and report its size.
    fn ensure_daily(&self, day: NaiveDate) -> Result<DailyLog, StoreError>;

    /// Record `name` as present on the day of `at`. A second mark on the same
    /// day leaves the first record in place.
    fn mark(&self, name: &str, at: NaiveDateTime) -> Result<MarkOutcome, StoreError>;

    /// Records of `day` in marking order.
    fn records_for(&self, day: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError>;
}

pub struct SqliteAttendanceStore {
    conn: Mutex<Connection>,
}

impl SqliteAttendanceStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "attendance store opened");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS attendance (
                 id     INTEGER PRIMARY KEY AUTOINCREMENT,
                 name   TEXT NOT NULL,
                 day    TEXT NOT NULL,
                 time   TEXT NOT NULL,
                 status TEXT NOT NULL DEFAULT 'Present',
                 UNIQUE(name, day)
             );
             CREATE INDEX IF NOT EXISTS idx_attendance_day ON attendance(day);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AttendanceStore for SqliteAttendanceStore {
    fn ensure_daily(&self, day: NaiveDate) -> Result<DailyLog, StoreError> {
        let entries: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM attendance WHERE day = ?1",
            params![day.to_string()],
            |row| row.get(0),
        )?;
        Ok(DailyLog {
            day,
            entries: entries as usize,
        })
    }

    fn mark(&self, name: &str, at: NaiveDateTime) -> Result<MarkOutcome, StoreError> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO attendance (name, day, time, status) VALUES (?1, ?2, ?3, ?4)",
            params![
                name,
                at.date().to_string(),
                at.time().format("%H:%M:%S").to_string(),
                STATUS_PRESENT
            ],
        )?;

        let outcome = MarkOutcome {
            already_marked: inserted == 0,
        };
        if outcome.already_marked {
            let first: Option<String> = conn
                .query_row(
                    "SELECT time FROM attendance WHERE name = ?1 AND day = ?2",
                    params![name, at.date().to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            tracing::debug!(name, first = ?first, "attendance already marked");
        } else {
            tracing::info!(name, day = %at.date(), "attendance marked");
        }
        Ok(outcome)
    }

    fn records_for(&self, day: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT name, time, status FROM attendance WHERE day = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![day.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (name, time, status) = row?;
            let time = NaiveTime::parse_from_str(&time, "%H:%M:%S")
                .map_err(|_| StoreError::CorruptTime(time.clone()))?;
            records.push(AttendanceRecord {
                name,
                day,
                time,
                status,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_mark_is_idempotent_per_day() {
        let store = SqliteAttendanceStore::open_in_memory().unwrap();
        assert!(!store.mark("alice", at(4, 9, 0)).unwrap().already_marked);
        assert!(store.mark("alice", at(4, 11, 30)).unwrap().already_marked);

        let records = store.records_for(at(4, 0, 0).date()).unwrap();
        assert_eq!(records.len(), 1);
        // First mark wins.
        assert_eq!(records[0].time, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(records[0].status, STATUS_PRESENT);
    }

    #[test]
    fn test_new_day_marks_again() {
        let store = SqliteAttendanceStore::open_in_memory().unwrap();
        store.mark("alice", at(4, 9, 0)).unwrap();
        assert!(!store.mark("alice", at(5, 9, 0)).unwrap().already_marked);
        assert_eq!(store.ensure_daily(at(5, 0, 0).date()).unwrap().entries, 1);
    }

    #[test]
    fn test_dedup_is_exact_name_match() {
        let store = SqliteAttendanceStore::open_in_memory().unwrap();
        store.mark("alice", at(4, 9, 0)).unwrap();
        assert!(!store.mark("Alice", at(4, 9, 1)).unwrap().already_marked);
        let names: Vec<_> = store
            .records_for(at(4, 0, 0).date())
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["alice", "Alice"]);
    }

    #[test]
    fn test_ensure_daily_on_empty_day() {
        let store = SqliteAttendanceStore::open_in_memory().unwrap();
        let log = store.ensure_daily(at(1, 0, 0).date()).unwrap();
        assert_eq!(log.entries, 0);
        assert!(store.records_for(log.day).unwrap().is_empty());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("attendance.db");
        {
            let store = SqliteAttendanceStore::open(&path).unwrap();
            store.mark("bob", at(4, 8, 15)).unwrap();
        }
        let store = SqliteAttendanceStore::open(&path).unwrap();
        assert!(store.mark("bob", at(4, 17, 0)).unwrap().already_marked);
    }

    #[test]
    fn test_record_serializes_time_as_text() {
        let store = SqliteAttendanceStore::open_in_memory().unwrap();
        store.mark("carol", at(4, 7, 5)).unwrap();
        let records = store.records_for(at(4, 0, 0).date()).unwrap();
        let json = serde_json::to_value(&records).unwrap();
        assert_eq!(json[0]["time"], "07:05:00");
        assert_eq!(json[0]["day"], "2024-03-04");
    }
}
