//! Plain-text rendering of daemon replies.

use rollcall_store::{AttendanceRecord, AttendanceStats, Report, ReportKind, Student, StudentRef, DATE_FORMAT, TIME_FORMAT};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct MarkSummary {
    pub date: chrono::NaiveDate,
    pub marked: Vec<StudentRef>,
    pub already_present: Vec<StudentRef>,
    pub faces_detected: usize,
    pub unrecognized_faces: usize,
}

#[derive(Debug, Deserialize)]
pub struct ResetReport {
    pub students_removed: usize,
    pub records_removed: usize,
    pub photos_deleted: usize,
}

/// Left-aligned table with a dashed rule under the header.
pub fn table<const N: usize>(headers: [&str; N], rows: &[[String; N]]) -> String {
    let mut widths = headers.map(|h| h.chars().count());
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let rule = widths.map(|w| "-".repeat(w));
    let mut out = format_row(&headers, &widths);
    out.push_str(&format_row(&rule, &widths));
    for row in rows {
        out.push_str(&format_row(row, &widths));
    }
    out
}

fn format_row<S: AsRef<str>>(cells: &[S], widths: &[usize]) -> String {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, w)| format!("{:<w$}", cell.as_ref(), w = *w))
        .collect::<Vec<_>>()
        .join("  ");
    format!("{}\n", line.trim_end())
}

pub fn students(students: &[Student]) -> String {
    if students.is_empty() {
        return "No students registered.\n".into();
    }
    let rows: Vec<[String; 5]> = students
        .iter()
        .map(|s| {
            [
                s.student_id.clone(),
                s.name.clone(),
                s.class_name.clone(),
                s.email.clone().unwrap_or_default(),
                s.registered_at.format("%Y-%m-%d %H:%M").to_string(),
            ]
        })
        .collect();
    table(["Student ID", "Name", "Class", "Email", "Registered"], &rows)
}

pub fn records(date: &str, records: &[AttendanceRecord]) -> String {
    if records.is_empty() {
        return format!("No attendance recorded for {date}.\n");
    }
    let rows: Vec<[String; 4]> = records
        .iter()
        .map(|r| {
            [
                r.student_id.clone(),
                r.name.clone(),
                r.class_name.clone(),
                r.time.format(TIME_FORMAT).to_string(),
            ]
        })
        .collect();
    format!("{} present on {date}\n\n{}", records.len(), table(["Student ID", "Name", "Class", "Time"], &rows))
}

pub fn report(report: &Report) -> String {
    let mut out = report.title();
    if let Some(class) = &report.class_filter {
        out.push_str(&format!(" ({class})"));
    }
    out.push_str("\n\n");

    if report.rows.is_empty() {
        out.push_str(match report.kind {
            ReportKind::Absentees => "No absentees. Everyone is present.\n",
            ReportKind::AllStudents => "No students registered.\n",
        });
        return out;
    }

    let rows: Vec<[String; 4]> = report
        .rows
        .iter()
        .map(|r| [r.student_id.clone(), r.name.clone(), r.class_name.clone(), r.status.to_string()])
        .collect();
    out.push_str(&table(["Student ID", "Name", "Class", "Status"], &rows));
    out
}

pub fn stats(stats: &AttendanceStats) -> String {
    format!(
        "Date:            {}\n\
         Total students:  {}\n\
         Present today:   {}\n\
         Absent today:    {}\n\
         Attendance rate: {:.1}%\n\
         Total records:   {}\n",
        stats.date.format(DATE_FORMAT),
        stats.total_students,
        stats.present_today,
        stats.absent_today,
        stats.attendance_rate,
        stats.total_records,
    )
}

pub fn mark_summary(summary: &MarkSummary) -> String {
    let names = |refs: &[StudentRef]| refs.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ");

    let mut out = String::new();
    if summary.marked.is_empty() {
        out.push_str("No new attendance marked.\n");
    } else {
        out.push_str(&format!("Attendance marked for: {}\n", names(&summary.marked)));
    }
    if !summary.already_present.is_empty() {
        out.push_str(&format!("Already present today: {}\n", names(&summary.already_present)));
    }
    if summary.faces_detected == 0 {
        out.push_str("No faces detected.\n");
    } else if summary.unrecognized_faces > 0 {
        out.push_str(&format!("{} face(s) not recognized.\n", summary.unrecognized_faces));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rollcall_store::{AttendanceStatus, ReportRow};

    fn student_ref(id: &str, name: &str) -> StudentRef {
        StudentRef {
            student_id: id.into(),
            name: name.into(),
            class_name: "Class 10A".into(),
        }
    }

    #[test]
    fn test_table_alignment() {
        let out = table(
            ["ID", "Name"],
            &[["STU001".into(), "Jo".into()], ["S2".into(), "Alexandra".into()]],
        );
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "ID      Name");
        assert_eq!(lines[1], "------  ---------");
        assert_eq!(lines[2], "STU001  Jo");
        assert_eq!(lines[3], "S2      Alexandra");
    }

    #[test]
    fn test_report_rendering() {
        let mut r = Report {
            date: NaiveDate::from_ymd_opt(2025, 10, 8).unwrap(),
            class_filter: Some("Class 10A".into()),
            kind: ReportKind::Absentees,
            rows: vec![],
        };
        assert_eq!(
            report(&r),
            "Absentees for October 08, 2025 (Class 10A)\n\nNo absentees. Everyone is present.\n"
        );

        r.rows.push(ReportRow {
            student_id: "STU002".into(),
            name: "Jane Roe".into(),
            class_name: "Class 10A".into(),
            status: AttendanceStatus::Absent,
        });
        assert!(report(&r).contains("STU002      Jane Roe  Class 10A  Absent"));
    }

    #[test]
    fn test_mark_summary_rendering() {
        let summary = MarkSummary {
            date: NaiveDate::from_ymd_opt(2025, 10, 8).unwrap(),
            marked: vec![student_ref("STU001", "John Doe"), student_ref("STU003", "Ann Lee")],
            already_present: vec![student_ref("STU002", "Jane Roe")],
            faces_detected: 4,
            unrecognized_faces: 1,
        };
        assert_eq!(
            mark_summary(&summary),
            "Attendance marked for: John Doe, Ann Lee\n\
             Already present today: Jane Roe\n\
             1 face(s) not recognized.\n"
        );

        let nobody = MarkSummary {
            marked: vec![],
            already_present: vec![],
            faces_detected: 0,
            unrecognized_faces: 0,
            ..summary
        };
        assert_eq!(mark_summary(&nobody), "No new attendance marked.\nNo faces detected.\n");
    }

    #[test]
    fn test_stats_rendering() {
        let out = stats(&AttendanceStats {
            date: NaiveDate::from_ymd_opt(2025, 10, 8).unwrap(),
            total_students: 3,
            present_today: 2,
            absent_today: 1,
            attendance_rate: 200.0 / 3.0,
            total_records: 7,
        });
        assert!(out.contains("Attendance rate: 66.7%"));
        assert!(out.contains("Absent today:    1"));
    }

    #[test]
    fn test_mark_summary_parses_daemon_json() {
        let json = r#"{"date":"2025-10-08","marked":[{"student_id":"STU001","name":"John Doe","class_name":"Class 10A"}],
                       "already_present":[],"faces_detected":1,"unrecognized_faces":0}"#;
        let summary: MarkSummary = serde_json::from_str(json).unwrap();
        assert_eq!(summary.marked[0].student_id, "STU001");
    }
}
