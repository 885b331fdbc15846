use crate::attendance::{Attendance, ServiceError};
use crate::engine::EngineError;
use rollcall_store::{NewStudent, StoreError};
use serde::Serialize;
use zbus::interface;

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Structured results are returned as JSON strings. An empty date means
/// today; an empty class means every class.
pub struct AttendanceService {
    attendance: Attendance,
}

impl AttendanceService {
    pub fn new(attendance: Attendance) -> Self {
        Self { attendance }
    }
}

impl From<ServiceError> for zbus::fdo::Error {
    fn from(e: ServiceError) -> Self {
        use zbus::fdo::Error;
        match e {
            ServiceError::InvalidInput(msg) => Error::InvalidArgs(msg),
            ServiceError::Store(e @ (StoreError::Invalid(_) | StoreError::DuplicateStudent(_))) => {
                Error::InvalidArgs(e.to_string())
            }
            ServiceError::Engine(EngineError::NoFaceDetected) => Error::InvalidArgs(
                "no face detected in the photo; use a clear, front-facing picture".into(),
            ),
            ServiceError::Engine(e @ EngineError::NoCamera) => Error::NotSupported(e.to_string()),
            other => Error::Failed(other.to_string()),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("serialization error: {e}")))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Register a student. An empty `photo` captures from the camera.
    async fn register_student(
        &self,
        student_id: &str,
        name: &str,
        class_name: &str,
        email: &str,
        photo: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(student_id, class_name, photo_bytes = photo.len(), "register requested");
        let form = NewStudent {
            student_id: student_id.to_string(),
            name: name.to_string(),
            class_name: class_name.to_string(),
            email: Some(email.to_string()),
        };
        let student = self.attendance.register(form, &photo).await.map_err(|e| {
            tracing::warn!(student_id, error = %e, "registration failed");
            e
        })?;
        to_json(&student)
    }

    /// Mark every recognized face present. An empty `photo` captures from the camera.
    async fn mark_attendance(&self, photo: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(photo_bytes = photo.len(), "mark attendance requested");
        let summary = self.attendance.mark(&photo).await?;
        to_json(&summary)
    }

    async fn todays_attendance(&self) -> zbus::fdo::Result<String> {
        to_json(&self.attendance.attendance_on("").await?)
    }

    async fn attendance_on(&self, date: &str) -> zbus::fdo::Result<String> {
        to_json(&self.attendance.attendance_on(date).await?)
    }

    /// `kind` is `absentees` or `all`.
    async fn report(&self, date: &str, class_name: &str, kind: &str) -> zbus::fdo::Result<String> {
        to_json(&self.attendance.report(date, class_name, kind).await?)
    }

    /// Rendered report file; `format` is `xlsx` or `csv`.
    async fn export_report(
        &self,
        date: &str,
        class_name: &str,
        kind: &str,
        format: &str,
    ) -> zbus::fdo::Result<Vec<u8>> {
        Ok(self.attendance.export(date, class_name, kind, format).await?)
    }

    async fn stats(&self) -> zbus::fdo::Result<String> {
        to_json(&self.attendance.stats().await?)
    }

    async fn list_students(&self) -> zbus::fdo::Result<String> {
        to_json(&self.attendance.students().await?)
    }

    async fn remove_student(&self, student_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(student_id, "remove requested");
        Ok(self.attendance.remove(student_id).await?)
    }

    async fn clear_attendance(&self) -> zbus::fdo::Result<u32> {
        let removed = self.attendance.clear_attendance().await?;
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }

    async fn reset_all(&self) -> zbus::fdo::Result<String> {
        to_json(&self.attendance.reset().await?)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.attendance.status().await?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::tests::{form, png, service};
    use rollcall_store::ValidationError;
    use zbus::fdo::Error;

    #[test]
    fn test_error_mapping() {
        let e: Error = ServiceError::InvalidInput("bad date".into()).into();
        assert!(matches!(e, Error::InvalidArgs(m) if m == "bad date"));

        let e: Error = ServiceError::Store(StoreError::DuplicateStudent("STU001".into())).into();
        assert!(matches!(e, Error::InvalidArgs(m) if m.contains("STU001")));

        let e: Error = ServiceError::Store(StoreError::Invalid(ValidationError::MissingField("name"))).into();
        assert!(matches!(e, Error::InvalidArgs(m) if m.contains("name is required")));

        let e: Error = ServiceError::Engine(EngineError::NoFaceDetected).into();
        assert!(matches!(e, Error::InvalidArgs(m) if m.starts_with("no face detected")));

        let e: Error = ServiceError::Engine(EngineError::NoCamera).into();
        assert!(matches!(e, Error::NotSupported(_)));

        let e: Error = ServiceError::Engine(EngineError::ChannelClosed).into();
        assert!(matches!(e, Error::Failed(_)));
    }

    #[tokio::test]
    async fn test_json_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let svc = AttendanceService::new(service(dir.path(), &[]).await);

        let student = svc
            .register_student("STU001", "John Doe", "Class 10A", "", png(1, 0))
            .await
            .unwrap();
        let student: serde_json::Value = serde_json::from_str(&student).unwrap();
        assert_eq!(student["student_id"], "STU001");
        assert!(student["email"].is_null());

        let summary: serde_json::Value =
            serde_json::from_str(&svc.mark_attendance(png(1, 0)).await.unwrap()).unwrap();
        assert_eq!(summary["marked"][0]["name"], "John Doe");

        let today: serde_json::Value = serde_json::from_str(&svc.todays_attendance().await.unwrap()).unwrap();
        assert_eq!(today.as_array().unwrap().len(), 1);
        assert_eq!(today[0]["status"], "Present");

        let stats: serde_json::Value = serde_json::from_str(&svc.stats().await.unwrap()).unwrap();
        assert_eq!(stats["present_today"], 1);

        let status: serde_json::Value = serde_json::from_str(&svc.status().await.unwrap()).unwrap();
        assert!(status["camera"].is_null());
        assert_eq!(status["students"], 1);

        let xlsx = svc.export_report("", "", "all", "xlsx").await.unwrap();
        assert_eq!(&xlsx[..2], b"PK");

        assert!(matches!(svc.attendance_on("yesterday").await, Err(Error::InvalidArgs(_))));
        assert!(matches!(svc.mark_attendance(Vec::new()).await, Err(Error::NotSupported(_))));
        assert_eq!(svc.clear_attendance().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_register_duplicate_is_invalid_args() {
        let dir = tempfile::tempdir().unwrap();
        let svc = AttendanceService::new(service(dir.path(), &[]).await);
        svc.attendance.register(form("STU001", "John", "Class 10A"), &png(1, 0)).await.unwrap();

        let err = svc
            .register_student("STU001", "Jane", "Class 10A", "jane@example.com", png(1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgs(_)));
    }
}
