use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            other => Err(format!("unknown bus {other:?}")),
        }
    }
}

/// Daemon configuration.
///
/// Built-in defaults, then the optional TOML file, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path. `None` runs the daemon photo-only.
    pub camera_device: Option<String>,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory holding one reference photo per student.
    pub photo_dir: PathBuf,
    /// Key file protecting stored embeddings.
    pub key_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Frames discarded at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Frames captured per attendance pass.
    pub frames_per_capture: usize,
    /// Frames captured per registration.
    pub frames_per_enroll: usize,
    pub capture_width: u32,
    pub capture_height: u32,
    pub bus: BusKind,
    /// Allowed class names. Empty accepts any class.
    pub classes: Vec<String>,
}

/// Shape of the TOML config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub camera_device: Option<String>,
    pub model_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub photo_dir: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub similarity_threshold: Option<f32>,
    pub warmup_frames: Option<usize>,
    pub frames_per_capture: Option<usize>,
    pub frames_per_enroll: Option<usize>,
    pub capture_width: Option<u32>,
    pub capture_height: Option<u32>,
    pub bus: Option<BusKind>,
    pub classes: Option<Vec<String>>,
}

impl Config {
    /// Load configuration from the process environment and the config file.
    pub fn load() -> anyhow::Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let path = config_file_path(&env);
        let file = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            tracing::info!(path = %path.display(), "loaded config file");
            parse_file(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            FileConfig::default()
        };
        Ok(Self::from_sources(file, env))
    }

    /// Merge defaults, a parsed config file and an environment lookup.
    pub fn from_sources(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = xdg_dir(&env, "XDG_DATA_HOME", ".local/share").join("rollcall");

        let camera_device = match env("ROLLCALL_CAMERA_DEVICE") {
            Some(v) => Some(v),
            None => Some(file.camera_device.unwrap_or_else(|| "/dev/video0".to_string())),
        }
        .filter(|v| !v.trim().is_empty());

        let path = |key: &str, from_file: Option<PathBuf>, default: PathBuf| {
            env(key).map(PathBuf::from).or(from_file).unwrap_or(default)
        };

        Self {
            camera_device,
            model_dir: path(
                "ROLLCALL_MODEL_DIR",
                file.model_dir,
                data_dir.join("models"),
            ),
            db_path: path("ROLLCALL_DB_PATH", file.db_path, data_dir.join("attendance.db")),
            photo_dir: path("ROLLCALL_PHOTO_DIR", file.photo_dir, data_dir.join("student_images")),
            key_path: path("ROLLCALL_KEY_PATH", file.key_path, data_dir.join("embedding.key")),
            similarity_threshold: similarity("ROLLCALL_SIMILARITY_THRESHOLD", env_parse(&env, "ROLLCALL_SIMILARITY_THRESHOLD"))
                .or_else(|| similarity("similarity_threshold", file.similarity_threshold))
                .unwrap_or(0.40),
            warmup_frames: env_parse(&env, "ROLLCALL_WARMUP_FRAMES")
                .or(file.warmup_frames)
                .unwrap_or(4),
            frames_per_capture: env_parse(&env, "ROLLCALL_FRAMES_PER_CAPTURE")
                .or(file.frames_per_capture)
                .unwrap_or(3),
            frames_per_enroll: env_parse(&env, "ROLLCALL_FRAMES_PER_ENROLL")
                .or(file.frames_per_enroll)
                .unwrap_or(5),
            capture_width: env_parse(&env, "ROLLCALL_CAPTURE_WIDTH")
                .or(file.capture_width)
                .unwrap_or(640),
            capture_height: env_parse(&env, "ROLLCALL_CAPTURE_HEIGHT")
                .or(file.capture_height)
                .unwrap_or(480),
            bus: env_parse(&env, "ROLLCALL_BUS").or(file.bus).unwrap_or(BusKind::Session),
            classes: env("ROLLCALL_CLASSES")
                .map(|v| split_classes(&v))
                .or(file.classes)
                .unwrap_or_default(),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(rollcall_core::DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(rollcall_core::RECOGNIZER_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

pub fn parse_file(text: &str) -> Result<FileConfig, toml::de::Error> {
    toml::from_str(text)
}

fn config_file_path(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    match env("ROLLCALL_CONFIG") {
        Some(path) => PathBuf::from(path),
        None => xdg_dir(env, "XDG_CONFIG_HOME", ".config").join("rollcall/config.toml"),
    }
}

fn xdg_dir(env: &impl Fn(&str) -> Option<String>, var: &str, fallback: &str) -> PathBuf {
    env(var).map(PathBuf::from).unwrap_or_else(|| {
        let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
        Path::new(&home).join(fallback)
    })
}

fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// Cosine similarity lives in [-1, 1]; anything else could never match.
fn similarity(source: &str, value: Option<f32>) -> Option<f32> {
    let v = value?;
    if v.is_finite() && (-1.0..=1.0).contains(&v) {
        Some(v)
    } else {
        tracing::warn!(source, value = %v, "ignoring similarity threshold outside [-1, 1]");
        None
    }
}

fn split_classes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_sources(FileConfig::default(), env_of(&[("HOME", "/home/ada")]));
        assert_eq!(cfg.camera_device.as_deref(), Some("/dev/video0"));
        assert_eq!(cfg.db_path, PathBuf::from("/home/ada/.local/share/rollcall/attendance.db"));
        assert_eq!(cfg.photo_dir, PathBuf::from("/home/ada/.local/share/rollcall/student_images"));
        assert_eq!(cfg.model_dir, PathBuf::from("/home/ada/.local/share/rollcall/models"));
        assert!((cfg.similarity_threshold - 0.40).abs() < f32::EPSILON);
        assert_eq!(cfg.warmup_frames, 4);
        assert_eq!(cfg.frames_per_capture, 3);
        assert_eq!(cfg.frames_per_enroll, 5);
        assert_eq!((cfg.capture_width, cfg.capture_height), (640, 480));
        assert_eq!(cfg.bus, BusKind::Session);
        assert!(cfg.classes.is_empty());
        assert!(cfg.arcface_model_path().ends_with("models/w600k_r50.onnx"));
    }

    #[test]
    fn test_file_values() {
        let file = parse_file(
            r#"
            camera_device = "/dev/video2"
            db_path = "/srv/rollcall/attendance.db"
            similarity_threshold = 0.5
            bus = "system"
            classes = ["Class 10A", "Class 10B"]
            "#,
        )
        .unwrap();
        let cfg = Config::from_sources(file, env_of(&[("XDG_DATA_HOME", "/data")]));
        assert_eq!(cfg.camera_device.as_deref(), Some("/dev/video2"));
        assert_eq!(cfg.db_path, PathBuf::from("/srv/rollcall/attendance.db"));
        assert_eq!(cfg.photo_dir, PathBuf::from("/data/rollcall/student_images"));
        assert!((cfg.similarity_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(cfg.bus, BusKind::System);
        assert_eq!(cfg.classes, vec!["Class 10A", "Class 10B"]);
    }

    #[test]
    fn test_env_overrides_file() {
        let file = parse_file("similarity_threshold = 0.5\nwarmup_frames = 10\n").unwrap();
        let cfg = Config::from_sources(
            file,
            env_of(&[
                ("HOME", "/h"),
                ("ROLLCALL_SIMILARITY_THRESHOLD", "0.6"),
                ("ROLLCALL_WARMUP_FRAMES", "not-a-number"),
                ("ROLLCALL_CLASSES", " Class 9 , ,Class 10A"),
                ("ROLLCALL_BUS", "SYSTEM"),
            ]),
        );
        assert!((cfg.similarity_threshold - 0.6).abs() < f32::EPSILON);
        assert_eq!(cfg.warmup_frames, 10);
        assert_eq!(cfg.classes, vec!["Class 9", "Class 10A"]);
        assert_eq!(cfg.bus, BusKind::System);
    }

    #[test]
    fn test_out_of_range_threshold_ignored() {
        for raw in ["NaN", "1.5", "-2", "inf"] {
            let cfg = Config::from_sources(
                FileConfig::default(),
                env_of(&[("HOME", "/h"), ("ROLLCALL_SIMILARITY_THRESHOLD", raw)]),
            );
            assert!((cfg.similarity_threshold - 0.40).abs() < f32::EPSILON, "{raw} accepted");
        }

        let file = parse_file("similarity_threshold = 0.55").unwrap();
        let cfg = Config::from_sources(file, env_of(&[("HOME", "/h"), ("ROLLCALL_SIMILARITY_THRESHOLD", "NaN")]));
        assert!((cfg.similarity_threshold - 0.55).abs() < f32::EPSILON);

        let file = parse_file("similarity_threshold = 3.0").unwrap();
        let cfg = Config::from_sources(file, env_of(&[("HOME", "/h")]));
        assert!((cfg.similarity_threshold - 0.40).abs() < f32::EPSILON);
    }

    #[test]
    fn test_empty_camera_device_disables_camera() {
        let file = parse_file("camera_device = \"/dev/video2\"").unwrap();
        let cfg = Config::from_sources(file, env_of(&[("HOME", "/h"), ("ROLLCALL_CAMERA_DEVICE", "")]));
        assert!(cfg.camera_device.is_none());

        let file = parse_file("camera_device = \"\"").unwrap();
        let cfg = Config::from_sources(file, env_of(&[("HOME", "/h")]));
        assert!(cfg.camera_device.is_none());
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        assert!(parse_file("verify_timeout_secs = 10").is_err());
    }

    #[test]
    fn test_config_file_location() {
        let env = env_of(&[("HOME", "/h")]);
        assert_eq!(config_file_path(&env), PathBuf::from("/h/.config/rollcall/config.toml"));
        let env = env_of(&[("ROLLCALL_CONFIG", "/etc/rollcall.toml")]);
        assert_eq!(config_file_path(&env), PathBuf::from("/etc/rollcall.toml"));
    }
}
