use image::RgbImage;
use rollcall_core::{BoundingBox, CosineMatcher, Embedding, GalleryEntry, Matcher};
use rollcall_hw::{Camera, Frame};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] rollcall_hw::CameraError),
    #[error("frame error: {0}")]
    Frame(#[from] rollcall_hw::FrameError),
    #[error("detector error: {0}")]
    Detector(#[from] rollcall_core::detector::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] rollcall_core::recognizer::RecognizerError),
    #[error("no camera configured; supply a photo instead")]
    NoCamera,
    #[error("all captured frames were too dark ({0} skipped)")]
    NoUsableFrames(usize),
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Where the engine gets its frames from.
pub enum FrameSource {
    /// Capture this many usable frames from the camera.
    Camera { frames: usize },
    /// A decoded photo supplied by the client.
    Image(RgbImage),
}

/// Face detection + embedding, abstracted so the capture logic can run
/// without ONNX models.
pub trait FacePipeline {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, EngineError>;
    fn embed(&mut self, frame: &Frame, face: &BoundingBox) -> Result<Embedding, EngineError>;
}

/// SCRFD detector + ArcFace recognizer.
pub struct OnnxPipeline {
    detector: rollcall_core::FaceDetector,
    recognizer: rollcall_core::FaceRecognizer,
}

impl OnnxPipeline {
    pub fn load(detector_path: &str, recognizer_path: &str) -> Result<Self, EngineError> {
        let detector = rollcall_core::FaceDetector::load(detector_path)?;
        tracing::info!(path = detector_path, "SCRFD detector loaded");
        let recognizer = rollcall_core::FaceRecognizer::load(recognizer_path)?;
        tracing::info!(path = recognizer_path, "ArcFace recognizer loaded");
        Ok(Self { detector, recognizer })
    }
}

impl FacePipeline for OnnxPipeline {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, EngineError> {
        Ok(self.detector.detect(&frame.data, frame.width, frame.height)?)
    }

    fn embed(&mut self, frame: &Frame, face: &BoundingBox) -> Result<Embedding, EngineError> {
        Ok(self.recognizer.extract(&frame.data, frame.width, frame.height, face)?)
    }
}

/// Result of an enrollment operation.
pub struct EnrollResult {
    pub embedding: Embedding,
    /// Detector confidence of the chosen face.
    pub confidence: f32,
    /// The frame the face was taken from, kept as the reference photo.
    pub photo: RgbImage,
}

/// One recognized student.
#[derive(Debug, Clone)]
pub struct FaceMatch {
    pub student_id: String,
    pub name: String,
    pub similarity: f32,
}

/// Result of an identification pass over one source.
#[derive(Debug, Default)]
pub struct IdentifyResult {
    /// Distinct students recognized, best similarity kept per student.
    pub matches: Vec<FaceMatch>,
    /// Most faces seen in a single frame.
    pub faces_detected: usize,
    /// Most unrecognized faces in a single frame.
    pub unrecognized_faces: usize,
}

/// Static info about the engine, for status reporting.
#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub device: String,
    pub width: u32,
    pub height: u32,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        source: FrameSource,
        reply: oneshot::Sender<Result<EnrollResult, EngineError>>,
    },
    Identify {
        source: FrameSource,
        gallery: Vec<GalleryEntry>,
        threshold: f32,
        reply: oneshot::Sender<Result<IdentifyResult, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    camera: Option<CameraInfo>,
}

impl EngineHandle {
    pub fn camera(&self) -> Option<&CameraInfo> {
        self.camera.as_ref()
    }

    /// Request enrollment: pick the most confident face in the source and embed it.
    pub async fn enroll(&self, source: FrameSource) -> Result<EnrollResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll { source, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Request identification of every face in the source against `gallery`.
    pub async fn identify(
        &self,
        source: FrameSource,
        gallery: Vec<GalleryEntry>,
        threshold: f32,
    ) -> Result<IdentifyResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Identify {
                source,
                gallery,
                threshold,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The camera is optional: without one, only photo sources are served.
/// Warmup frames are discarded before the request loop starts.
pub fn spawn_engine<P>(
    mut pipeline: P,
    camera: Option<Camera>,
    warmup_frames: usize,
) -> Result<EngineHandle, EngineError>
where
    P: FacePipeline + Send + 'static,
{
    let camera_info = camera.as_ref().map(|c| CameraInfo {
        device: c.device_path.clone(),
        width: c.width,
        height: c.height,
    });

    if let Some(cam) = &camera {
        if warmup_frames > 0 {
            tracing::info!(count = warmup_frames, "discarding warmup frames");
            for _ in 0..warmup_frames {
                let _ = cam.capture_frame();
            }
        }
    }

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { source, reply } => {
                        let result = collect_frames(camera.as_ref(), source)
                            .and_then(|frames| run_enroll(&mut pipeline, &frames));
                        let _ = reply.send(result);
                    }
                    EngineRequest::Identify {
                        source,
                        gallery,
                        threshold,
                        reply,
                    } => {
                        let result = collect_frames(camera.as_ref(), source)
                            .and_then(|frames| run_identify(&mut pipeline, &frames, &gallery, threshold));
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, camera: camera_info })
}

fn collect_frames(camera: Option<&Camera>, source: FrameSource) -> Result<Vec<Frame>, EngineError> {
    match source {
        FrameSource::Image(image) => Ok(vec![Frame::from_rgb_image(image)]),
        FrameSource::Camera { frames } => {
            let camera = camera.ok_or(EngineError::NoCamera)?;
            let (captured, dark_skipped) = camera.capture_frames(frames.max(1))?;
            tracing::debug!(captured = captured.len(), dark_skipped, "captured frames");
            if captured.is_empty() {
                return Err(EngineError::NoUsableFrames(dark_skipped));
            }
            Ok(captured)
        }
    }
}

/// Pick the most confident face across all frames and embed it.
fn run_enroll<P: FacePipeline + ?Sized>(pipeline: &mut P, frames: &[Frame]) -> Result<EnrollResult, EngineError> {
    let mut best: Option<(usize, BoundingBox)> = None;

    for (i, frame) in frames.iter().enumerate() {
        let faces = pipeline.detect(frame)?;
        if faces.len() > 1 {
            tracing::warn!(faces = faces.len(), frame = i, "enroll: several faces in frame, using the most confident");
        }
        if let Some(face) = faces.into_iter().next() {
            if best.as_ref().map_or(true, |(_, b)| face.confidence > b.confidence) {
                best = Some((i, face));
            }
        }
    }

    let (frame_idx, face) = best.ok_or(EngineError::NoFaceDetected)?;
    let frame = &frames[frame_idx];

    tracing::info!(confidence = face.confidence, frame = frame_idx, "enroll: best face selected");

    let embedding = pipeline.embed(frame, &face)?;
    Ok(EnrollResult {
        embedding,
        confidence: face.confidence,
        photo: frame.to_rgb_image()?,
    })
}

/// Embed every face in every frame and match each against the gallery.
fn run_identify<P: FacePipeline + ?Sized>(
    pipeline: &mut P,
    frames: &[Frame],
    gallery: &[GalleryEntry],
    threshold: f32,
) -> Result<IdentifyResult, EngineError> {
    let matcher = CosineMatcher;
    let mut best: HashMap<String, FaceMatch> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut result = IdentifyResult::default();

    for frame in frames {
        let faces = pipeline.detect(frame)?;
        let mut unrecognized = 0usize;

        for face in &faces {
            let embedding = pipeline.embed(frame, face)?;
            let m = matcher.best_match(&embedding, gallery, threshold);
            let Some(entry) = m.entry else {
                tracing::debug!(similarity = m.similarity, "face not recognized");
                unrecognized += 1;
                continue;
            };
            let (student_id, name) = (entry.id.clone(), entry.label.clone());

            match best.get_mut(&student_id) {
                Some(prev) => prev.similarity = prev.similarity.max(m.similarity),
                None => {
                    order.push(student_id.clone());
                    best.insert(
                        student_id.clone(),
                        FaceMatch { student_id, name, similarity: m.similarity },
                    );
                }
            }
        }

        result.faces_detected = result.faces_detected.max(faces.len());
        result.unrecognized_faces = result.unrecognized_faces.max(unrecognized);
    }

    result.matches = order.into_iter().filter_map(|id| best.remove(&id)).collect();
    tracing::info!(
        faces = result.faces_detected,
        recognized = result.matches.len(),
        unrecognized = result.unrecognized_faces,
        "identify complete"
    );
    Ok(result)
}
