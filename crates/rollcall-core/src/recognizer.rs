//! ArcFace (w600k_r50) embeddings via ONNX Runtime.

use crate::alignment::{align_face, ALIGNED_SIZE};
use crate::types::{BoundingBox, Embedding};
use crate::RGB_CHANNELS;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

/// ArcFace normalizes symmetrically: `(v - 127.5) / 127.5`.
const PIXEL_CENTRE: f32 = 127.5;
const EMBEDDING_DIM: usize = 512;
const MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download it from insightface and place it in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer too short for {width}x{height} RGB")]
    BadFrame { width: u32, height: u32 },
    #[error("detected face carries no landmarks, cannot align")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        tracing::info!(path = model_path, version = MODEL_VERSION, "loaded ArcFace model");

        Ok(Self { session })
    }

    /// Align `face` using its landmarks and embed it. The result has unit length.
    pub fn extract(&mut self, frame: &[u8], width: u32, height: u32, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let Some(landmarks) = &face.landmarks else {
            return Err(RecognizerError::NoLandmarks);
        };
        if frame.len() < width as usize * height as usize * RGB_CHANNELS {
            return Err(RecognizerError::BadFrame { width, height });
        }

        let input = crop_tensor(&align_face(frame, width, height, landmarks));
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("read embedding: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "embedding has {} dimensions, want {EMBEDDING_DIM}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalized(raw),
            model_version: Some(MODEL_VERSION.to_string()),
        })
    }
}

/// 112×112 RGB crop to a 1×3×112×112 tensor. A short crop leaves the tail at zero.
fn crop_tensor(crop: &[u8]) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((1, RGB_CHANNELS, ALIGNED_SIZE, ALIGNED_SIZE));
    let pixels = crop.chunks_exact(RGB_CHANNELS).take(ALIGNED_SIZE * ALIGNED_SIZE);
    for (i, px) in pixels.enumerate() {
        let (row, col) = (i / ALIGNED_SIZE, i % ALIGNED_SIZE);
        for (c, &v) in px.iter().enumerate() {
            tensor[[0, c, row, col]] = (v as f32 - PIXEL_CENTRE) / PIXEL_CENTRE;
        }
    }
    tensor
}

/// A zero vector comes back unchanged.
fn l2_normalized(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}
