//! Report assembly from the student roster and one day's presence set.

use crate::types::{AttendanceStatus, Report, ReportKind, ReportRow, Student};
use chrono::NaiveDate;
use std::collections::HashSet;

/// Build a report for `date`.
///
/// `students` must already be in registration order; rows keep that order.
/// A `class_filter` of `None` includes every class.
pub fn build_report(
    students: &[Student],
    present: &HashSet<String>,
    date: NaiveDate,
    class_filter: Option<&str>,
    kind: ReportKind,
) -> Report {
    let rows = students
        .iter()
        .filter(|s| class_filter.map_or(true, |c| s.class_name == c))
        .map(|s| ReportRow {
            student_id: s.student_id.clone(),
            name: s.name.clone(),
            class_name: s.class_name.clone(),
            status: if present.contains(&s.student_id) {
                AttendanceStatus::Present
            } else {
                AttendanceStatus::Absent
            },
        })
        .filter(|row| kind == ReportKind::AllStudents || row.status == AttendanceStatus::Absent)
        .collect();

    Report {
        date,
        class_filter: class_filter.map(str::to_string),
        kind,
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(id: &str, class: &str) -> Student {
        Student {
            student_id: id.into(),
            name: format!("Student {id}"),
            class_name: class.into(),
            email: None,
            photo_path: None,
            registered_at: NaiveDate::from_ymd_opt(2025, 10, 1)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap(),
        }
    }

    fn roster() -> Vec<Student> {
        vec![
            student("STU003", "Class 10A"),
            student("STU001", "Class 10B"),
            student("STU002", "Class 10A"),
        ]
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 10, 8).unwrap()
    }

    #[test]
    fn test_absentees_only() {
        let present: HashSet<String> = ["STU001".to_string()].into();
        let report = build_report(&roster(), &present, date(), None, ReportKind::Absentees);
        let ids: Vec<_> = report.rows.iter().map(|r| r.student_id.as_str()).collect();
        assert_eq!(ids, vec!["STU003", "STU002"]);
        assert!(report.rows.iter().all(|r| r.status == AttendanceStatus::Absent));
    }

    #[test]
    fn test_all_students_keeps_registration_order() {
        let present: HashSet<String> = ["STU002".to_string()].into();
        let report = build_report(&roster(), &present, date(), None, ReportKind::AllStudents);
        let rows: Vec<_> = report
            .rows
            .iter()
            .map(|r| (r.student_id.as_str(), r.status))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("STU003", AttendanceStatus::Absent),
                ("STU001", AttendanceStatus::Absent),
                ("STU002", AttendanceStatus::Present),
            ]
        );
    }

    #[test]
    fn test_class_filter() {
        let report = build_report(&roster(), &HashSet::new(), date(), Some("Class 10A"), ReportKind::AllStudents);
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.class_filter.as_deref(), Some("Class 10A"));
        assert!(report.rows.iter().all(|r| r.class_name == "Class 10A"));
    }

    #[test]
    fn test_everyone_present_yields_empty_absentee_report() {
        let present: HashSet<String> = roster().into_iter().map(|s| s.student_id).collect();
        let report = build_report(&roster(), &present, date(), None, ReportKind::Absentees);
        assert!(report.rows.is_empty());
    }
}
