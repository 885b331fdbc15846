use crate::config::Config;
use crate::engine::{EngineError, EngineHandle, EnrollResult, FrameSource};
use chrono::{Local, NaiveDate};
use image::RgbImage;
use rollcall_store::{
    AttendanceRecord, AttendanceStats, ExportError, ExportFormat, NewStudent, PhotoError,
    PhotoStore, Report, ReportKind, Store, StoreError, Student, StudentRef, DATE_FORMAT,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Photo(#[from] PhotoError),
    #[error(transparent)]
    Export(#[from] ExportError),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Outcome of one attendance pass.
#[derive(Debug, Clone, Serialize)]
pub struct MarkSummary {
    pub date: NaiveDate,
    /// Students recorded present by this pass.
    pub marked: Vec<StudentRef>,
    /// Recognized students who were already present today.
    pub already_present: Vec<StudentRef>,
    pub faces_detected: usize,
    pub unrecognized_faces: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub students_removed: usize,
    pub records_removed: usize,
    pub photos_deleted: usize,
}

/// Registration and attendance flows over the engine and the store.
pub struct Attendance {
    engine: EngineHandle,
    store: Store,
    photos: PhotoStore,
    config: Config,
}

impl Attendance {
    pub fn new(engine: EngineHandle, store: Store, config: Config) -> Self {
        let photos = PhotoStore::new(config.photo_dir.clone());
        Self { engine, store, photos, config }
    }

    /// Register a student from an encoded photo, or from the camera when
    /// `photo` is empty.
    ///
    /// Nothing is stored unless a face was found.
    pub async fn register(&self, form: NewStudent, photo: &[u8]) -> Result<Student> {
        let form = form.validate(&self.config.classes).map_err(StoreError::from)?;
        if self.store.contains(&form.student_id).await? {
            return Err(StoreError::DuplicateStudent(form.student_id).into());
        }

        let source = self.source(photo, self.config.frames_per_enroll)?;
        let enrolled = self.engine.enroll(source).await?;
        self.persist(form, enrolled).await
    }

    /// Insert the student, then move the staged photo into place.
    ///
    /// The photo at the final path is only replaced once the row exists, so a
    /// registration that loses a duplicate race leaves the winner's photo alone.
    async fn persist(&self, form: NewStudent, enrolled: EnrollResult) -> Result<Student> {
        let staged = self.photos.stage(&form.student_id, &enrolled.photo)?;
        let student_id = form.student_id.clone();

        let inserted = self
            .store
            .register_student(form, &enrolled.embedding, Some(staged.path().to_path_buf()), Local::now().naive_local())
            .await;
        let student = match inserted {
            Ok(student) => student,
            Err(e) => {
                if let Err(cleanup) = self.photos.discard(staged) {
                    tracing::warn!(student_id = %student_id, error = %cleanup, "failed to remove staged photo");
                }
                return Err(e.into());
            }
        };

        if let Err(e) = self.photos.commit(staged) {
            if let Err(rollback) = self.store.remove_student(&student_id).await {
                tracing::warn!(student_id = %student_id, error = %rollback, "failed to roll back registration");
            }
            return Err(e.into());
        }

        tracing::info!(
            student_id = %student.student_id,
            class = %student.class_name,
            confidence = enrolled.confidence,
            "student registered"
        );
        Ok(student)
    }

    /// Recognize every face in the photo (or camera frames) and mark the
    /// matched students present for today.
    pub async fn mark(&self, photo: &[u8]) -> Result<MarkSummary> {
        let now = Local::now().naive_local();
        let mut summary = MarkSummary {
            date: now.date(),
            marked: Vec::new(),
            already_present: Vec::new(),
            faces_detected: 0,
            unrecognized_faces: 0,
        };

        let source = self.source(photo, self.config.frames_per_capture)?;
        let gallery = self.store.gallery().await?;
        if gallery.is_empty() {
            tracing::info!("no registered students; nothing to match");
            return Ok(summary);
        }

        let identified = self
            .engine
            .identify(source, gallery, self.config.similarity_threshold)
            .await?;
        summary.faces_detected = identified.faces_detected;
        summary.unrecognized_faces = identified.unrecognized_faces;

        let ids: Vec<String> = identified.matches.into_iter().map(|m| m.student_id).collect();
        let outcome = self.store.mark_present(&ids, now).await?;
        summary.marked = outcome.marked;
        summary.already_present = outcome.already_present;

        tracing::info!(
            marked = summary.marked.len(),
            already_present = summary.already_present.len(),
            unrecognized = summary.unrecognized_faces,
            "attendance pass complete"
        );
        Ok(summary)
    }

    pub async fn attendance_on(&self, date: &str) -> Result<Vec<AttendanceRecord>> {
        let date = parse_date(date, today())?;
        Ok(self.store.attendance_on(date).await?)
    }

    pub async fn report(&self, date: &str, class: &str, kind: &str) -> Result<Report> {
        let date = parse_date(date, today())?;
        let kind: ReportKind = kind.parse().map_err(ServiceError::InvalidInput)?;
        Ok(self.store.report(date, class_filter(class), kind).await?)
    }

    /// Render a report in the requested format.
    pub async fn export(&self, date: &str, class: &str, kind: &str, format: &str) -> Result<Vec<u8>> {
        let format: ExportFormat = format.parse().map_err(ServiceError::InvalidInput)?;
        let report = self.report(date, class, kind).await?;
        let bytes = format.render(&report)?;
        tracing::info!(
            file = %format.file_name(&report),
            rows = report.rows.len(),
            bytes = bytes.len(),
            "report exported"
        );
        Ok(bytes)
    }

    pub async fn stats(&self) -> Result<AttendanceStats> {
        Ok(self.store.stats(today()).await?)
    }

    pub async fn students(&self) -> Result<Vec<Student>> {
        Ok(self.store.students().await?)
    }

    /// Remove a student, their attendance history and their photo.
    pub async fn remove(&self, student_id: &str) -> Result<bool> {
        let Some(student) = self.store.remove_student(student_id.trim()).await? else {
            return Ok(false);
        };
        if let Some(path) = &student.photo_path {
            if let Err(e) = self.photos.remove(path) {
                tracing::warn!(student_id = %student.student_id, error = %e, "student removed but photo remains");
            }
        }
        tracing::info!(student_id = %student.student_id, "student removed");
        Ok(true)
    }

    pub async fn clear_attendance(&self) -> Result<usize> {
        let removed = self.store.clear_attendance().await?;
        tracing::info!(removed, "attendance records cleared");
        Ok(removed)
    }

    /// Delete every student, record and reference photo.
    pub async fn reset(&self) -> Result<ResetReport> {
        let summary = self.store.reset().await?;
        let mut photos_deleted = 0;
        for path in &summary.photo_paths {
            if path.exists() {
                self.photos.remove(path)?;
                photos_deleted += 1;
            }
        }
        photos_deleted += self.photos.purge()?;
        tracing::warn!(
            students = summary.students_removed,
            records = summary.records_removed,
            photos = photos_deleted,
            "all data reset"
        );
        Ok(ResetReport {
            students_removed: summary.students_removed,
            records_removed: summary.records_removed,
            photos_deleted,
        })
    }

    pub async fn status(&self) -> Result<serde_json::Value> {
        let students = self.store.students().await?.len();
        let camera = self.engine.camera().map(|c| {
            serde_json::json!({
                "device": c.device,
                "width": c.width,
                "height": c.height,
            })
        });
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": camera,
            "models_loaded": true,
            "students": students,
            "similarity_threshold": self.config.similarity_threshold,
            "classes": self.config.classes,
            "db_path": self.config.db_path,
        }))
    }

    fn source(&self, photo: &[u8], frames: usize) -> Result<FrameSource> {
        if photo.is_empty() {
            Ok(FrameSource::Camera { frames })
        } else {
            Ok(FrameSource::Image(decode_photo(photo)?))
        }
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Parse a `YYYY-MM-DD` date; blank means `today`.
pub fn parse_date(raw: &str, today: NaiveDate) -> Result<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(today);
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|_| ServiceError::InvalidInput(format!("invalid date {raw:?} (expected YYYY-MM-DD)")))
}

/// Blank or "All Classes" selects every class.
pub fn class_filter(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("all classes") || raw.eq_ignore_ascii_case("all") {
        None
    } else {
        Some(raw)
    }
}

fn decode_photo(bytes: &[u8]) -> Result<RgbImage> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| ServiceError::InvalidInput(format!("unreadable photo: {e}")))
}
