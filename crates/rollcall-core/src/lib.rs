//! rollcall-core — Face detection, alignment and recognition engine.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both
//! running via ONNX Runtime on CPU. All entry points take packed RGB8
//! buffers (`width * height * 3` bytes, row-major).

pub mod alignment;
pub mod detector;
pub mod recognizer;
pub mod types;

pub use detector::FaceDetector;
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, CosineMatcher, Embedding, GalleryEntry, MatchResult, Matcher};

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// Bytes per pixel of the packed RGB buffers used across the crate.
pub const RGB_CHANNELS: usize = 3;
