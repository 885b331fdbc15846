//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides followed by greedy NMS. Classroom
//! photos usually hold several faces, so every detection above the confidence
//! threshold is returned.

use crate::types::BoundingBox;
use crate::RGB_CHANNELS;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const CONFIDENCE_THRESHOLD: f32 = 0.5;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const LANDMARK_COUNT: usize = 5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download it from insightface and place it in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer too short: expected {expected} bytes for {width}x{height} RGB, got {actual}")]
    BadFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Placement of the source frame inside the square network input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    /// Resized frame size inside the input.
    inner_w: usize,
    inner_h: usize,
}

impl Letterbox {
    fn fit(width: usize, height: usize, input: usize) -> Self {
        let scale = (input as f32 / width as f32).min(input as f32 / height as f32);
        let inner_w = ((width as f32 * scale).round() as usize).clamp(1, input);
        let inner_h = ((height as f32 * scale).round() as usize).clamp(1, input);
        Self {
            scale,
            pad_x: (input - inner_w) as f32 / 2.0,
            pad_y: (input - inner_h) as f32 / 2.0,
            inner_w,
            inner_h,
        }
    }

    /// Network-input coordinates back to source-frame coordinates.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    /// Output positions for strides 8, 16, 32.
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = model_path, outputs = ?names, "loaded SCRFD model");

        if names.len() < STRIDES.len() * 3 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs score/bbox/kps outputs for 3 strides (9 total), model has {}",
                names.len()
            )));
        }

        let outputs = map_outputs(&names);
        tracing::debug!(?outputs, "SCRFD output mapping");

        Ok(Self { session, outputs })
    }

    /// Detect faces in an RGB frame, most confident first.
    pub fn detect(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<BoundingBox>, DetectorError> {
        let expected = width as usize * height as usize * RGB_CHANNELS;
        if width == 0 || height == 0 || rgb.len() < expected {
            return Err(DetectorError::BadFrame { width, height, expected, actual: rgb.len() });
        }

        let letterbox = Letterbox::fit(width as usize, height as usize, INPUT_SIZE);
        let input = input_tensor(rgb, width as usize, height as usize, &letterbox);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let tensor = |idx: usize, what: &str, stride: usize| {
            outputs[idx]
                .try_extract_tensor::<f32>()
                .map(|(_, data)| data)
                .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
        };

        let mut candidates = Vec::new();
        for (&stride, slot) in STRIDES.iter().zip(&self.outputs) {
            let head = StrideHead {
                stride,
                scores: tensor(slot.score, "scores", stride)?,
                bboxes: tensor(slot.bbox, "bboxes", stride)?,
                kps: tensor(slot.kps, "kps", stride)?,
            };
            candidates.extend(head.decode(INPUT_SIZE, &letterbox, CONFIDENCE_THRESHOLD));
        }

        let faces = nms(candidates, NMS_IOU);
        tracing::debug!(faces = faces.len(), "SCRFD detection complete");
        Ok(faces)
    }
}

/// Letterbox `rgb` into a normalized 1×3×640×640 tensor. Padding stays at
/// zero, which is what the mean pixel normalizes to.
fn input_tensor(rgb: &[u8], width: usize, height: usize, lb: &Letterbox) -> Array4<f32> {
    let resized = resize_bilinear_rgb(rgb, width, height, lb.inner_w, lb.inner_h);
    let (x0, y0) = (lb.pad_x.floor() as usize, lb.pad_y.floor() as usize);
    let mut tensor = Array4::<f32>::zeros((1, RGB_CHANNELS, INPUT_SIZE, INPUT_SIZE));

    for (i, px) in resized.chunks_exact(RGB_CHANNELS).enumerate() {
        let (x, y) = (x0 + i % lb.inner_w, y0 + i / lb.inner_w);
        for (c, &v) in px.iter().enumerate() {
            tensor[[0, c, y, x]] = (v as f32 - PIXEL_MEAN) / PIXEL_STD;
        }
    }
    tensor
}

/// Source index pair and blend weight for one output coordinate
/// (pixel-centre aligned, clamped at the edges).
fn resize_taps(src_len: usize, dst_len: usize) -> Vec<(usize, usize, f32)> {
    let ratio = src_len as f32 / dst_len as f32;
    let last = src_len.saturating_sub(1);
    (0..dst_len)
        .map(|d| {
            let pos = ((d as f32 + 0.5) * ratio - 0.5).max(0.0);
            let lo = (pos.floor() as usize).min(last);
            let hi = (lo + 1).min(last);
            (lo, hi, (pos - lo as f32).clamp(0.0, 1.0))
        })
        .collect()
}

/// Bilinear resize of a packed RGB8 buffer.
fn resize_bilinear_rgb(rgb: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    let xs = resize_taps(width, new_w);
    let ys = resize_taps(height, new_h);
    let at = |x: usize, y: usize, c: usize| rgb[(y * width + x) * RGB_CHANNELS + c] as f32;

    let mut out = Vec::with_capacity(new_w * new_h * RGB_CHANNELS);
    for &(y0, y1, fy) in &ys {
        for &(x0, x1, fx) in &xs {
            for c in 0..RGB_CHANNELS {
                let top = at(x0, y0, c) + (at(x1, y0, c) - at(x0, y0, c)) * fx;
                let bottom = at(x0, y1, c) + (at(x1, y1, c) - at(x0, y1, c)) * fx;
                out.push((top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8);
            }
        }
    }
    out
}

/// Locate each stride's tensors by name (`score_8`, `bbox_16`, `kps_32`, ...).
///
/// Exports with generic names fall back to the usual positional layout:
/// scores 0..3, boxes 3..6, keypoints 6..9.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |kind: &str, stride: usize| names.iter().position(|n| *n == format!("{kind}_{stride}"));
    let by_name = |stride: usize| {
        Some(StrideOutputs {
            score: find("score", stride)?,
            bbox: find("bbox", stride)?,
            kps: find("kps", stride)?,
        })
    };

    if let [Some(s8), Some(s16), Some(s32)] = STRIDES.map(by_name) {
        return [s8, s16, s32];
    }

    tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
    [0, 1, 2].map(|i| StrideOutputs { score: i, bbox: i + 3, kps: i + 6 })
}

/// Raw head outputs for one stride.
struct StrideHead<'a> {
    stride: usize,
    scores: &'a [f32],
    /// `[left, top, right, bottom]` distances per anchor, in stride units.
    bboxes: &'a [f32],
    /// Five `(dx, dy)` landmark offsets per anchor, in stride units.
    kps: &'a [f32],
}

impl StrideHead<'_> {
    fn decode(&self, input_size: usize, lb: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let cells_per_row = input_size / self.stride;
        let anchors = cells_per_row * cells_per_row * ANCHORS_PER_CELL;
        let s = self.stride as f32;

        self.scores
            .iter()
            .take(anchors)
            .enumerate()
            .filter(|&(_, &score)| score > threshold)
            .filter_map(|(idx, &score)| {
                let cell = idx / ANCHORS_PER_CELL;
                let cx = (cell % cells_per_row) as f32 * s;
                let cy = (cell / cells_per_row) as f32 * s;

                let d = self.bboxes.get(idx * 4..idx * 4 + 4)?;
                let (x1, y1) = lb.to_frame(cx - d[0] * s, cy - d[1] * s);
                let (x2, y2) = lb.to_frame(cx + d[2] * s, cy + d[3] * s);

                let landmarks = self
                    .kps
                    .get(idx * LANDMARK_COUNT * 2..(idx + 1) * LANDMARK_COUNT * 2)
                    .map(|k| std::array::from_fn(|i| lb.to_frame(cx + k[2 * i] * s, cy + k[2 * i + 1] * s)));

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

/// Greedy non-maximum suppression; the result is sorted by confidence.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap_w = (a.x + a.width).min(b.x + b.width) - a.x.max(b.x);
    let overlap_h = (a.y + a.height).min(b.y + b.height) - a.y.max(b.y);
    let inter = overlap_w.max(0.0) * overlap_h.max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence, landmarks: None }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_iou() {
        let a = face(0.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &face(20.0, 20.0, 10.0, 10.0, 1.0)), 0.0);
        // 5x10 overlap over a 150 union
        assert!((iou(&a, &face(5.0, 0.0, 10.0, 10.0, 1.0)) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_separate_faces_in_group_photo() {
        let kept = nms(
            vec![
                face(5.0, 5.0, 100.0, 100.0, 0.8),
                face(400.0, 50.0, 60.0, 60.0, 0.6),
                face(0.0, 0.0, 100.0, 100.0, 0.9),
                face(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        let scores: Vec<f32> = kept.iter().map(|f| f.confidence).collect();
        assert_eq!(scores, vec![0.9, 0.7, 0.6]);
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_fit_and_unmap() {
        let lb = Letterbox::fit(320, 240, 640);
        assert_eq!(lb.scale, 2.0);
        assert_eq!((lb.inner_w, lb.inner_h), (640, 480));
        assert_eq!((lb.pad_x, lb.pad_y), (0.0, 80.0));

        let (x, y) = lb.to_frame(100.0 * 2.0, 50.0 * 2.0 + 80.0);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_maps_back_to_frame_space() {
        // 16x16 input, stride 8: 2x2 cells, anchor 6 sits in cell 3 at (8, 8).
        let lb = Letterbox { scale: 2.0, pad_x: 0.0, pad_y: 0.0, inner_w: 16, inner_h: 16 };
        let anchors = 2 * 2 * ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        scores[6] = 0.9;
        let mut bboxes = vec![0.0f32; anchors * 4];
        bboxes[24..28].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);
        let kps = vec![0.0f32; anchors * 10];

        let head = StrideHead { stride: 8, scores: &scores, bboxes: &bboxes, kps: &kps };
        let dets = head.decode(16, &lb, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        // box 0..16 in input space, halved by scale 2
        assert_eq!((d.x, d.y, d.width, d.height), (0.0, 0.0, 8.0, 8.0));
        assert_eq!(d.landmarks.unwrap()[0], (4.0, 4.0));
    }

    #[test]
    fn test_decode_threshold_is_exclusive() {
        let lb = Letterbox::fit(16, 16, 16);
        let scores = [0.5f32; 8];
        let head = StrideHead { stride: 8, scores: &scores, bboxes: &[0.0; 32], kps: &[0.0; 80] };
        assert!(head.decode(16, &lb, 0.5).is_empty());
    }

    #[test]
    fn test_map_outputs_by_name() {
        let plain = names(&["score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32", "kps_8", "kps_16", "kps_32"]);
        let expected = [0, 1, 2].map(|i| StrideOutputs { score: i, bbox: i + 3, kps: i + 6 });
        assert_eq!(map_outputs(&plain), expected);

        let shuffled = names(&["bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32"]);
        let expected = [0, 3, 6].map(|i| StrideOutputs { score: i + 2, bbox: i, kps: i + 1 });
        assert_eq!(map_outputs(&shuffled), expected);
    }

    #[test]
    fn test_map_outputs_positional_fallback() {
        let generic: Vec<String> = (0..9).map(|i| i.to_string()).collect();
        assert_eq!(map_outputs(&generic)[2], StrideOutputs { score: 2, bbox: 5, kps: 8 });
    }

    #[test]
    fn test_resize_uniform_color() {
        let (w, h) = (50usize, 40usize);
        let rgb: Vec<u8> = std::iter::repeat([200u8, 100, 50]).take(w * h).flatten().collect();
        let resized = resize_bilinear_rgb(&rgb, w, h, 120, 96);
        assert_eq!(resized.len(), 120 * 96 * 3);
        assert!(resized.chunks_exact(3).all(|px| px == [200, 100, 50]));
    }

    #[test]
    fn test_resize_taps_clamp_at_edges() {
        let taps = resize_taps(4, 8);
        assert_eq!(taps.first().map(|t| (t.0, t.1)), Some((0, 1)));
        assert_eq!(taps.last().map(|t| (t.0, t.1)), Some((3, 3)));
        assert!(taps.iter().all(|t| (0.0..=1.0).contains(&t.2)));
    }

    #[test]
    fn test_input_tensor_padding_is_zero() {
        let rgb = vec![255u8; 4 * 2 * 3];
        let lb = Letterbox::fit(4, 2, INPUT_SIZE);
        let t = input_tensor(&rgb, 4, 2, &lb);
        assert_eq!(t[[0, 0, 0, 0]], 0.0);
        let expected = (255.0 - PIXEL_MEAN) / PIXEL_STD;
        assert!((t[[0, 1, INPUT_SIZE / 2, INPUT_SIZE / 2]] - expected).abs() < 1e-6);
    }
}
