//! rollcall-store — Persistence and reporting for attendance tracking.
//!
//! SQLite (via `tokio-rusqlite`) holds registered students, their face
//! embeddings sealed with AES-256-GCM, and one attendance record per student
//! per day. Reports are derived from those tables and can be exported as
//! CSV or Excel workbooks.

pub mod db;
pub mod export;
pub mod photos;
pub mod report;
pub mod seal;
pub mod types;

pub use db::{Store, StoreError};
pub use export::{ExportError, ExportFormat};
pub use photos::{PhotoError, PhotoStore, StagedPhoto};
pub use seal::{SealError, SealKey};
pub use types::{
    AttendanceRecord, AttendanceStats, AttendanceStatus, MarkOutcome, NewStudent, Report,
    ReportKind, ReportRow, ResetSummary, Student, StudentRef, ValidationError,
};

/// Storage format of attendance dates.
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Storage format of attendance times.
pub const TIME_FORMAT: &str = "%H:%M:%S";
/// Storage format of registration timestamps.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
