//! SQLite store with versioned migrations.
//!
//! All queries run on the `tokio-rusqlite` background thread; embeddings are
//! sealed before they cross into it and unsealed after they come back.

use crate::report::build_report;
use crate::seal::{SealError, SealKey};
use crate::types::{
    AttendanceRecord, AttendanceStats, AttendanceStatus, MarkOutcome, NewStudent, Report,
    ReportKind, ResetSummary, Student, StudentRef, ValidationError,
};
use crate::{DATETIME_FORMAT, DATE_FORMAT, TIME_FORMAT};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rollcall_core::{Embedding, GalleryEntry};
use rusqlite::{params, OptionalExtension};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid registration: {0}")]
    Invalid(#[from] ValidationError),
    #[error("student ID {0} already exists")]
    DuplicateStudent(String),
    #[error("embedding seal: {0}")]
    Seal(#[from] SealError),
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

const MIGRATIONS: &[&str] = &[
    // 1: initial schema
    "
    CREATE TABLE students (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        student_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        class_name TEXT NOT NULL,
        email TEXT,
        photo_path TEXT,
        embedding BLOB NOT NULL,
        model_version TEXT,
        registered_at TEXT NOT NULL
    );

    CREATE TABLE attendance (
        id TEXT PRIMARY KEY,
        student_id TEXT NOT NULL REFERENCES students(student_id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        class_name TEXT NOT NULL,
        date TEXT NOT NULL,
        time TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'Present',
        UNIQUE(student_id, date)
    );

    CREATE INDEX idx_attendance_date ON attendance(date);
    CREATE INDEX idx_students_class ON students(class_name);
    ",
];

const STUDENT_COLUMNS: &str = "student_id, name, class_name, email, photo_path, registered_at";

/// Student columns as read from SQLite, before date parsing.
type StudentRow = (String, String, String, Option<String>, Option<String>, String);

fn student_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn parse_student(raw: StudentRow) -> Result<Student> {
    let (student_id, name, class_name, email, photo_path, registered_at) = raw;
    let registered_at = NaiveDateTime::parse_from_str(&registered_at, DATETIME_FORMAT).map_err(|e| {
        StoreError::Corrupt {
            table: "students",
            detail: format!("registered_at {registered_at:?} for {student_id}: {e}"),
        }
    })?;
    Ok(Student {
        student_id,
        name,
        class_name,
        email,
        photo_path: photo_path.map(PathBuf::from),
        registered_at,
    })
}

/// Attendance columns as read from SQLite: (id, student_id, name, class, date, time).
type RecordRow = (String, String, String, String, String, String);

fn parse_record(raw: RecordRow) -> Result<AttendanceRecord> {
    let (id, student_id, name, class_name, date, time) = raw;
    let corrupt = |detail: String| StoreError::Corrupt { table: "attendance", detail };
    let date = NaiveDate::parse_from_str(&date, DATE_FORMAT)
        .map_err(|e| corrupt(format!("date {date:?} in {id}: {e}")))?;
    let time = NaiveTime::parse_from_str(&time, TIME_FORMAT)
        .map_err(|e| corrupt(format!("time {time:?} in {id}: {e}")))?;
    Ok(AttendanceRecord {
        id,
        student_id,
        name,
        class_name,
        date,
        time,
        status: AttendanceStatus::Present,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Attendance database handle. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
    key: SealKey,
}

impl Store {
    /// Open (or create) the database at `path` and apply pending migrations.
    pub async fn open(path: &Path, key: SealKey) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        let store = Self { conn, key };
        store.init(true).await?;
        tracing::info!(path = %path.display(), "attendance store opened");
        Ok(store)
    }

    /// In-memory store, used by tests and dry runs.
    pub async fn open_in_memory(key: SealKey) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn, key };
        store.init(false).await?;
        Ok(store)
    }

    async fn init(&self, wal: bool) -> Result<()> {
        self.conn
            .call(move |conn| {
                if wal {
                    conn.execute_batch(
                        "PRAGMA journal_mode = WAL;
                         PRAGMA synchronous = NORMAL;",
                    )?;
                }
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA busy_timeout = 5000;",
                )?;

                conn.execute(
                    "CREATE TABLE IF NOT EXISTS _migrations (
                        version INTEGER PRIMARY KEY,
                        applied_at TEXT NOT NULL
                    )",
                    [],
                )?;

                let current: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM _migrations",
                    [],
                    |row| row.get(0),
                )?;

                for (idx, migration) in MIGRATIONS.iter().enumerate() {
                    let version = idx as i64 + 1;
                    if version > current {
                        tracing::info!(version, "applying store migration");
                        let tx = conn.transaction()?;
                        tx.execute_batch(migration)?;
                        tx.execute(
                            "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                            params![version],
                        )?;
                        tx.commit()?;
                    }
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Whether a student ID is already registered.
    pub async fn contains(&self, student_id: &str) -> Result<bool> {
        let id = student_id.to_string();
        let exists = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row("SELECT 1 FROM students WHERE student_id = ?1", params![id], |_| Ok(()))
                    .optional()?
                    .is_some())
            })
            .await?;
        Ok(exists)
    }

    /// Register a student with their face embedding.
    ///
    /// Required fields are re-checked here; class membership is the caller's
    /// concern. Fails with [`StoreError::DuplicateStudent`] if the ID is taken; nothing
    /// is written in that case.
    pub async fn register_student(
        &self,
        student: NewStudent,
        embedding: &Embedding,
        photo_path: Option<PathBuf>,
        now: NaiveDateTime,
    ) -> Result<Student> {
        let student = student.validate(&[])?;
        let sealed = self.key.seal(embedding)?;
        let model_version = embedding.model_version.clone();
        let registered = Student {
            student_id: student.student_id,
            name: student.name,
            class_name: student.class_name,
            email: student.email,
            photo_path,
            registered_at: now,
        };

        let row = registered.clone();
        let inserted = self
            .conn
            .call(move |conn| {
                let result = conn.execute(
                    "INSERT INTO students
                        (student_id, name, class_name, email, photo_path, embedding, model_version, registered_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        row.student_id,
                        row.name,
                        row.class_name,
                        row.email,
                        row.photo_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                        sealed,
                        model_version,
                        row.registered_at.format(DATETIME_FORMAT).to_string(),
                    ],
                );
                match result {
                    Ok(_) => Ok(true),
                    Err(e) if is_unique_violation(&e) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        if !inserted {
            return Err(StoreError::DuplicateStudent(registered.student_id));
        }

        tracing::info!(
            student_id = %registered.student_id,
            class = %registered.class_name,
            "student registered"
        );
        Ok(registered)
    }

    pub async fn student(&self, student_id: &str) -> Result<Option<Student>> {
        let id = student_id.to_string();
        let raw = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE student_id = ?1"),
                        params![id],
                        student_from_row,
                    )
                    .optional()?)
            })
            .await?;
        raw.map(parse_student).transpose()
    }

    /// All students in registration order.
    pub async fn students(&self) -> Result<Vec<Student>> {
        let raw = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!("SELECT {STUDENT_COLUMNS} FROM students ORDER BY seq"))?;
                let rows = stmt
                    .query_map([], student_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        raw.into_iter().map(parse_student).collect()
    }

    /// Distinct class names of registered students, sorted.
    pub async fn classes(&self) -> Result<Vec<String>> {
        let classes = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT DISTINCT class_name FROM students ORDER BY class_name")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(classes)
    }

    /// Unsealed embeddings of every student, in registration order.
    pub async fn gallery(&self) -> Result<Vec<GalleryEntry>> {
        let raw = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT student_id, name, embedding, model_version FROM students ORDER BY seq",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        raw.into_iter()
            .map(|(id, label, blob, model_version)| -> Result<GalleryEntry> {
                let embedding = self.key.unseal(&blob, model_version)?;
                Ok(GalleryEntry { id, label, embedding })
            })
            .collect()
    }

    /// Remove a student and their attendance records. Returns the removed
    /// student so the caller can delete the reference photo.
    pub async fn remove_student(&self, student_id: &str) -> Result<Option<Student>> {
        let Some(student) = self.student(student_id).await? else {
            return Ok(None);
        };
        let id = student_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM students WHERE student_id = ?1", params![id])?;
                Ok(())
            })
            .await?;
        tracing::info!(student_id, "student removed");
        Ok(Some(student))
    }

    /// Record the given students present on `now`'s date.
    ///
    /// Duplicate IDs in the input are collapsed, unknown IDs are skipped, and
    /// a student already recorded that day is reported in `already_present`.
    pub async fn mark_present(&self, student_ids: &[String], now: NaiveDateTime) -> Result<MarkOutcome> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = student_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();
        let date = now.date().format(DATE_FORMAT).to_string();
        let time = now.time().format(TIME_FORMAT).to_string();

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut outcome = MarkOutcome::default();
                for id in ids {
                    let student = tx
                        .query_row(
                            "SELECT name, class_name FROM students WHERE student_id = ?1",
                            params![id],
                            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                        )
                        .optional()?;
                    let Some((name, class_name)) = student else {
                        tracing::warn!(student_id = %id, "recognized ID is not registered; skipping");
                        continue;
                    };

                    let changed = tx.execute(
                        "INSERT OR IGNORE INTO attendance (id, student_id, name, class_name, date, time, status)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'Present')",
                        params![uuid::Uuid::new_v4().to_string(), id, name, class_name, date, time],
                    )?;

                    let student = StudentRef { student_id: id, name, class_name };
                    if changed == 1 {
                        outcome.marked.push(student);
                    } else {
                        outcome.already_present.push(student);
                    }
                }
                tx.commit()?;
                Ok(outcome)
            })
            .await?;

        tracing::info!(
            marked = outcome.marked.len(),
            already_present = outcome.already_present.len(),
            date = %now.date(),
            "attendance marked"
        );
        Ok(outcome)
    }

    /// Attendance records for one date, in marking order.
    pub async fn attendance_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>> {
        let date = date.format(DATE_FORMAT).to_string();
        let raw = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, student_id, name, class_name, date, time FROM attendance
                     WHERE date = ?1 ORDER BY time, rowid",
                )?;
                let rows = stmt
                    .query_map(params![date], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
                    })?
                    .collect::<rusqlite::Result<Vec<RecordRow>>>()?;
                Ok(rows)
            })
            .await?;
        raw.into_iter().map(parse_record).collect()
    }

    async fn present_ids(&self, date: NaiveDate) -> Result<HashSet<String>> {
        let date = date.format(DATE_FORMAT).to_string();
        let ids = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT student_id FROM attendance WHERE date = ?1")?;
                let ids = stmt
                    .query_map(params![date], |row| row.get(0))?
                    .collect::<rusqlite::Result<HashSet<String>>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    /// Total number of stored attendance records across all dates.
    pub async fn record_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))?))
            .await?;
        Ok(n as usize)
    }

    /// Headline numbers for `today`.
    pub async fn stats(&self, today: NaiveDate) -> Result<AttendanceStats> {
        let date = today.format(DATE_FORMAT).to_string();
        let (total, present, records): (i64, i64, i64) = self
            .conn
            .call(move |conn| {
                let total = conn.query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))?;
                let present = conn.query_row(
                    "SELECT COUNT(DISTINCT student_id) FROM attendance WHERE date = ?1",
                    params![date],
                    |row| row.get(0),
                )?;
                let records = conn.query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))?;
                Ok((total, present, records))
            })
            .await?;

        let total_students = total as usize;
        let present_today = present as usize;
        let attendance_rate = if total_students > 0 {
            present_today as f64 / total_students as f64 * 100.0
        } else {
            0.0
        };

        Ok(AttendanceStats {
            date: today,
            total_students,
            present_today,
            absent_today: total_students.saturating_sub(present_today),
            attendance_rate,
            total_records: records as usize,
        })
    }

    /// Build a report for `date`, optionally restricted to one class.
    pub async fn report(&self, date: NaiveDate, class_filter: Option<&str>, kind: ReportKind) -> Result<Report> {
        let students = self.students().await?;
        let present = self.present_ids(date).await?;
        Ok(build_report(&students, &present, date, class_filter, kind))
    }

    /// Delete every attendance record. Students are kept.
    pub async fn clear_attendance(&self) -> Result<usize> {
        let removed = self
            .conn
            .call(|conn| Ok(conn.execute("DELETE FROM attendance", [])?))
            .await?;
        tracing::warn!(removed, "attendance records cleared");
        Ok(removed)
    }

    /// Delete all students and attendance records.
    ///
    /// Photo files are not touched here; the returned summary lists them.
    pub async fn reset(&self) -> Result<ResetSummary> {
        let summary = self
            .conn
            .call(|conn| {
                let tx = conn.transaction()?;
                let photo_paths = {
                    let mut stmt = tx.prepare("SELECT photo_path FROM students WHERE photo_path IS NOT NULL")?;
                    let paths = stmt
                        .query_map([], |row| row.get::<_, String>(0))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    paths.into_iter().map(PathBuf::from).collect()
                };
                let records_removed = tx.execute("DELETE FROM attendance", [])?;
                let students_removed = tx.execute("DELETE FROM students", [])?;
                tx.commit()?;
                Ok(ResetSummary {
                    students_removed,
                    records_removed,
                    photo_paths,
                })
            })
            .await?;
        tracing::warn!(
            students = summary.students_removed,
            records = summary.records_removed,
            "all attendance data reset"
        );
        Ok(summary)
    }
}
