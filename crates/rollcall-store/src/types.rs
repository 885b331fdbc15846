use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// A registered student. The face embedding is kept out of this type and
/// never leaves the store unsealed except through [`crate::Store::gallery`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub student_id: String,
    pub name: String,
    pub class_name: String,
    pub email: Option<String>,
    pub photo_path: Option<PathBuf>,
    pub registered_at: NaiveDateTime,
}

/// Registration form input, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewStudent {
    pub student_id: String,
    pub name: String,
    pub class_name: String,
    pub email: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("unknown class {class:?}; expected one of: {allowed}")]
    UnknownClass { class: String, allowed: String },
}

impl NewStudent {
    /// Trim every field and check the required ones.
    ///
    /// An empty email becomes `None`. When `allowed_classes` is non-empty the
    /// class must be one of its entries.
    pub fn validate(self, allowed_classes: &[String]) -> Result<Self, ValidationError> {
        let student_id = self.student_id.trim().to_string();
        let name = self.name.trim().to_string();
        let class_name = self.class_name.trim().to_string();
        let email = self
            .email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());

        if student_id.is_empty() {
            return Err(ValidationError::MissingField("student id"));
        }
        if name.is_empty() {
            return Err(ValidationError::MissingField("name"));
        }
        if class_name.is_empty() {
            return Err(ValidationError::MissingField("class"));
        }
        if !allowed_classes.is_empty() && !allowed_classes.iter().any(|c| c == &class_name) {
            return Err(ValidationError::UnknownClass {
                class: class_name,
                allowed: allowed_classes.join(", "),
            });
        }

        Ok(Self { student_id, name, class_name, email })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Present => "Present",
            Self::Absent => "Absent",
        })
    }
}

/// One presence event. Absence is never stored; it is derived in reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: String,
    /// Name and class as they were when attendance was marked.
    pub name: String,
    pub class_name: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: AttendanceStatus,
}

/// Minimal student reference returned from marking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRef {
    pub student_id: String,
    pub name: String,
    pub class_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkOutcome {
    /// Students recorded present by this call.
    pub marked: Vec<StudentRef>,
    /// Students that already had a record for the day.
    pub already_present: Vec<StudentRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceStats {
    pub date: NaiveDate,
    pub total_students: usize,
    pub present_today: usize,
    pub absent_today: usize,
    /// Percentage in [0, 100]; 0 when nobody is registered.
    pub attendance_rate: f64,
    pub total_records: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportKind {
    Absentees,
    AllStudents,
}

impl FromStr for ReportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "absentees" | "absent" => Ok(Self::Absentees),
            "all" | "all-students" | "all_students" => Ok(Self::AllStudents),
            other => Err(format!("unknown report kind {other:?} (expected \"absentees\" or \"all\")")),
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Absentees => "absentees",
            Self::AllStudents => "all",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    pub student_id: String,
    pub name: String,
    pub class_name: String,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub date: NaiveDate,
    /// `None` covers every class.
    pub class_filter: Option<String>,
    pub kind: ReportKind,
    pub rows: Vec<ReportRow>,
}

impl Report {
    /// Human-readable heading, e.g. "Absentees for October 08, 2025".
    pub fn title(&self) -> String {
        let day = self.date.format("%B %d, %Y");
        match self.kind {
            ReportKind::Absentees => format!("Absentees for {day}"),
            ReportKind::AllStudents => format!("All Students Status for {day}"),
        }
    }

    /// Worksheet name and file stem: `Report_<date>`.
    pub fn sheet_name(&self) -> String {
        format!("Report_{}", self.date.format(crate::DATE_FORMAT))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResetSummary {
    pub students_removed: usize,
    pub records_removed: usize,
    /// Reference photos that belonged to the removed students.
    pub photo_paths: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(id: &str, name: &str, class: &str, email: Option<&str>) -> NewStudent {
        NewStudent {
            student_id: id.into(),
            name: name.into(),
            class_name: class.into(),
            email: email.map(Into::into),
        }
    }

    #[test]
    fn test_validate_trims_fields() {
        let s = form("  STU001 ", " John Doe ", "Class 10A ", Some("  ")).validate(&[]).unwrap();
        assert_eq!(s.student_id, "STU001");
        assert_eq!(s.name, "John Doe");
        assert_eq!(s.class_name, "Class 10A");
        assert_eq!(s.email, None);
    }

    #[test]
    fn test_validate_requires_fields() {
        assert_eq!(
            form(" ", "John", "10A", None).validate(&[]),
            Err(ValidationError::MissingField("student id"))
        );
        assert_eq!(
            form("STU001", "", "10A", None).validate(&[]),
            Err(ValidationError::MissingField("name"))
        );
        assert_eq!(
            form("STU001", "John", "\t", None).validate(&[]),
            Err(ValidationError::MissingField("class"))
        );
    }

    #[test]
    fn test_validate_allowed_classes() {
        let allowed = vec!["Class 9A".to_string(), "Class 9B".to_string()];
        assert!(form("S1", "A", "Class 9B", None).validate(&allowed).is_ok());
        assert!(matches!(
            form("S1", "A", "Class 12A", None).validate(&allowed),
            Err(ValidationError::UnknownClass { .. })
        ));
    }

    #[test]
    fn test_report_kind_parse() {
        assert_eq!("absentees".parse::<ReportKind>(), Ok(ReportKind::Absentees));
        assert_eq!("".parse::<ReportKind>(), Ok(ReportKind::Absentees));
        assert_eq!("ALL".parse::<ReportKind>(), Ok(ReportKind::AllStudents));
        assert!("present".parse::<ReportKind>().is_err());
    }

    #[test]
    fn test_report_title_and_sheet_name() {
        let report = Report {
            date: NaiveDate::from_ymd_opt(2025, 10, 8).unwrap(),
            class_filter: None,
            kind: ReportKind::Absentees,
            rows: vec![],
        };
        assert_eq!(report.title(), "Absentees for October 08, 2025");
        assert_eq!(report.sheet_name(), "Report_2025-10-08");
    }
}
