use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rollcall_store::{AttendanceRecord, AttendanceStats, ExportFormat, Report, ReportKind, Student, DATE_FORMAT};
use std::io::{self, Write};
use std::path::PathBuf;

mod display;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn register_student(
        &self,
        student_id: &str,
        name: &str,
        class_name: &str,
        email: &str,
        photo: &[u8],
    ) -> zbus::Result<String>;
    async fn mark_attendance(&self, photo: &[u8]) -> zbus::Result<String>;
    async fn todays_attendance(&self) -> zbus::Result<String>;
    async fn attendance_on(&self, date: &str) -> zbus::Result<String>;
    async fn report(&self, date: &str, class_name: &str, kind: &str) -> zbus::Result<String>;
    async fn export_report(&self, date: &str, class_name: &str, kind: &str, format: &str) -> zbus::Result<Vec<u8>>;
    async fn stats(&self) -> zbus::Result<String>;
    async fn list_students(&self) -> zbus::Result<String>;
    async fn remove_student(&self, student_id: &str) -> zbus::Result<bool>;
    async fn clear_attendance(&self) -> zbus::Result<u32>;
    async fn reset_all(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance tracker", version)]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new student from a photo, or from the camera if no photo is given
    Register {
        /// Unique student ID (e.g. STU001)
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        class: String,
        #[arg(long)]
        email: Option<String>,
        /// Reference photo (JPEG/PNG) with the student's face
        #[arg(long)]
        photo: Option<PathBuf>,
    },
    /// Recognize faces in a photo (or camera frames) and mark them present
    Mark {
        /// Group or single photo; omit to capture from the camera
        #[arg(long)]
        photo: Option<PathBuf>,
    },
    /// Show who has been marked present today
    Today,
    /// Show who was present on a given date
    On {
        /// Date as YYYY-MM-DD
        date: NaiveDate,
    },
    /// Show an attendance report
    Report {
        /// Date as YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Restrict to one class (default: all classes)
        #[arg(long)]
        class: Option<String>,
        /// "absentees" or "all"
        #[arg(long, default_value = "absentees")]
        kind: ReportKind,
    },
    /// Export a report as an Excel workbook or CSV file
    Export {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        class: Option<String>,
        #[arg(long, default_value = "absentees")]
        kind: ReportKind,
        /// "xlsx" or "csv"
        #[arg(long, default_value = "xlsx")]
        format: ExportFormat,
        /// Output file (default: Report_<date>.<format>)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List registered students
    Students,
    /// Remove a student with their attendance history and photo
    Remove {
        /// Student ID to remove
        id: String,
    },
    /// Show today's attendance statistics
    Stats,
    /// Delete every attendance record, keeping students
    Clear,
    /// Delete ALL students, attendance records and photos
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Show daemon status
    Status,
    /// Run camera diagnostics (does not need the daemon)
    Test {
        /// V4L2 device to test (default: every detected device)
        #[arg(long)]
        device: Option<String>,
        /// Frames to capture
        #[arg(long, default_value_t = 5)]
        frames: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Test { device, frames } = &cli.command {
        return camera_test(device.as_deref(), *frames);
    }

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    tracing::debug!(system_bus = cli.system, "connected to D-Bus");
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("failed to create proxy for rollcalld")?;

    match cli.command {
        Commands::Register { id, name, class, email, photo } => {
            let photo = read_photo(photo.as_ref())?;
            if photo.is_empty() {
                println!("Look at the camera...");
            }
            let reply = proxy
                .register_student(&id, &name, &class, email.as_deref().unwrap_or(""), &photo)
                .await
                .context("registration failed")?;
            let student: Student = serde_json::from_str(&reply)?;
            println!(
                "Registered {} {} ({})",
                student.student_id, student.name, student.class_name
            );
        }
        Commands::Mark { photo } => {
            let photo = read_photo(photo.as_ref())?;
            let reply = proxy.mark_attendance(&photo).await.context("attendance pass failed")?;
            let summary: display::MarkSummary = serde_json::from_str(&reply)?;
            println!("Attendance for {}", summary.date.format(DATE_FORMAT));
            print!("{}", display::mark_summary(&summary));
        }
        Commands::Today => {
            let records: Vec<AttendanceRecord> = serde_json::from_str(&proxy.todays_attendance().await?)?;
            print!("{}", display::records("today", &records));
        }
        Commands::On { date } => {
            let date = date.format(DATE_FORMAT).to_string();
            let records: Vec<AttendanceRecord> = serde_json::from_str(&proxy.attendance_on(&date).await?)?;
            print!("{}", display::records(&date, &records));
        }
        Commands::Report { date, class, kind } => {
            let reply = proxy
                .report(&date_arg(date), class.as_deref().unwrap_or(""), &kind.to_string())
                .await?;
            let report: Report = serde_json::from_str(&reply)?;
            print!("{}", display::report(&report));
        }
        Commands::Export { date, class, kind, format, output } => {
            let date = date_arg(date);
            let bytes = proxy
                .export_report(&date, class.as_deref().unwrap_or(""), &kind.to_string(), format.extension())
                .await
                .context("export failed")?;
            let output = output.unwrap_or_else(|| PathBuf::from(export_file_name(&date, format)));
            std::fs::write(&output, &bytes).with_context(|| format!("writing {}", output.display()))?;
            println!("Report saved to {} ({} bytes)", output.display(), bytes.len());
        }
        Commands::Students => {
            let students: Vec<Student> = serde_json::from_str(&proxy.list_students().await?)?;
            print!("{}", display::students(&students));
        }
        Commands::Remove { id } => {
            if proxy.remove_student(&id).await? {
                println!("Removed student {id}");
            } else {
                bail!("no student with ID {id}");
            }
        }
        Commands::Stats => {
            let stats: AttendanceStats = serde_json::from_str(&proxy.stats().await?)?;
            print!("{}", display::stats(&stats));
        }
        Commands::Clear => {
            let removed = proxy.clear_attendance().await?;
            println!("Cleared {removed} attendance record(s)");
        }
        Commands::Reset { yes } => {
            if !yes && !confirm("This deletes ALL students, attendance records and photos. Type 'yes' to continue: ")? {
                println!("Reset cancelled");
                return Ok(());
            }
            let reset: display::ResetReport = serde_json::from_str(&proxy.reset_all().await?)?;
            println!(
                "Removed {} student(s), {} record(s), {} photo(s)",
                reset.students_removed, reset.records_removed, reset.photos_deleted
            );
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Test { device, frames } => camera_test(device.as_deref(), frames)?,
    }

    Ok(())
}

/// Read a photo file; no path means "use the daemon's camera" (empty payload).
fn read_photo(path: Option<&PathBuf>) -> Result<Vec<u8>> {
    match path {
        Some(path) => std::fs::read(path).with_context(|| format!("reading photo {}", path.display())),
        None => Ok(Vec::new()),
    }
}

fn date_arg(date: Option<NaiveDate>) -> String {
    date.unwrap_or_else(|| Local::now().date_naive())
        .format(DATE_FORMAT)
        .to_string()
}

fn export_file_name(date: &str, format: ExportFormat) -> String {
    format!("Report_{date}.{}", format.extension())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("yes")
}

/// Open each camera, capture frames and report format and brightness.
fn camera_test(device: Option<&str>, frames: usize) -> Result<()> {
    let devices: Vec<String> = match device {
        Some(d) => vec![d.to_string()],
        None => rollcall_hw::Camera::list_devices()
            .into_iter()
            .map(|info| {
                println!("{}: {} (driver {}, bus {})", info.path, info.name, info.driver, info.bus);
                info.path
            })
            .collect(),
    };
    if devices.is_empty() {
        bail!("no V4L2 capture devices found");
    }

    for path in devices {
        println!("\nTesting {path}...");
        let camera = match rollcall_hw::Camera::open(&path, 640, 480) {
            Ok(cam) => cam,
            Err(e) => {
                println!("  open failed: {e}");
                continue;
            }
        };
        println!(
            "  {}x{} {:?}",
            camera.width,
            camera.height,
            camera.pixel_format()
        );
        let (captured, dark) = camera.capture_frames(frames)?;
        for frame in &captured {
            println!("  frame {:>3}: brightness {:.1}", frame.sequence, frame.avg_brightness());
        }
        println!("  {} usable frame(s), {} dark frame(s) skipped", captured.len(), dark);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register() {
        let cli = Cli::try_parse_from([
            "rollcall", "register", "--id", "STU001", "--name", "John Doe", "--class", "Class 10A",
            "--photo", "john.jpg",
        ])
        .unwrap();
        match cli.command {
            Commands::Register { id, email, photo, .. } => {
                assert_eq!(id, "STU001");
                assert!(email.is_none());
                assert_eq!(photo, Some(PathBuf::from("john.jpg")));
            }
            _ => panic!("expected register"),
        }
        assert!(!cli.system);
    }

    #[test]
    fn test_parse_export_defaults() {
        let cli = Cli::try_parse_from(["rollcall", "--system", "export", "--date", "2025-10-08"]).unwrap();
        assert!(cli.system);
        match cli.command {
            Commands::Export { date, class, kind, format, output } => {
                assert_eq!(date, NaiveDate::from_ymd_opt(2025, 10, 8));
                assert!(class.is_none());
                assert_eq!(kind, ReportKind::Absentees);
                assert_eq!(format, ExportFormat::Xlsx);
                assert!(output.is_none());
            }
            _ => panic!("expected export"),
        }
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert!(Cli::try_parse_from(["rollcall", "report", "--kind", "sometimes"]).is_err());
        assert!(Cli::try_parse_from(["rollcall", "export", "--format", "pdf"]).is_err());
        assert!(Cli::try_parse_from(["rollcall", "report", "--date", "08/10/2025"]).is_err());
        assert!(Cli::try_parse_from(["rollcall", "register", "--id", "STU001"]).is_err());
    }

    #[test]
    fn test_parse_report_all_and_reset() {
        let cli = Cli::try_parse_from(["rollcall", "report", "--kind", "all", "--class", "Class 10A"]).unwrap();
        assert!(matches!(cli.command, Commands::Report { kind: ReportKind::AllStudents, .. }));
        let cli = Cli::try_parse_from(["rollcall", "reset", "--yes"]).unwrap();
        assert!(matches!(cli.command, Commands::Reset { yes: true }));
    }

    #[test]
    fn test_export_file_name_and_confirmation() {
        assert_eq!(export_file_name("2025-10-08", ExportFormat::Csv), "Report_2025-10-08.csv");
        assert!(is_yes("yes\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("y\n"));
        assert!(!is_yes(""));
    }

    #[test]
    fn test_read_photo_without_path_is_empty() {
        assert!(read_photo(None).unwrap().is_empty());
        assert!(read_photo(Some(&PathBuf::from("/nonexistent/photo.jpg"))).is_err());
    }
}
