//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Fraction of dark pixels above which a frame is discarded.
const DARK_FRAME_THRESHOLD: f32 = 0.95;
/// Raw captures allowed per usable frame requested.
const ATTEMPTS_PER_FRAME: usize = 3;
const STREAM_BUFFERS: u32 = 4;
const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("device {0} is busy")]
    Busy(String),
    #[error("failed to open {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("{0} is not a video capture device")]
    NotCaptureDevice(String),
    #[error("format negotiation failed: {0}")]
    Format(String),
    #[error("capture failed: {0}")]
    Capture(String),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel formats the camera can deliver, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG, one JPEG image per buffer.
    Mjpeg,
}

impl PixelFormat {
    const PREFERENCE: [PixelFormat; 2] = [PixelFormat::Yuyv, PixelFormat::Mjpeg];

    fn fourcc(self) -> FourCC {
        match self {
            Self::Yuyv => FourCC::new(b"YUYV"),
            Self::Mjpeg => FourCC::new(b"MJPG"),
        }
    }

    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        Self::PREFERENCE.into_iter().find(|f| f.fourcc() == fourcc)
    }

    /// Convert one driver buffer to packed RGB8.
    fn decode(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, frame::FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            Self::Mjpeg => frame::mjpeg_to_rgb(buf, width, height),
        }
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera (e.g. "/dev/video0") and request `width`x`height`.
    ///
    /// The driver may settle on another resolution; the negotiated size is
    /// reported in `width`/`height`.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::NotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.raw_os_error() {
            Some(EBUSY) => CameraError::Busy(device_path.to_string()),
            _ => CameraError::Open {
                path: device_path.to_string(),
                reason: e.to_string(),
            },
        })?;

        let caps = device.query_caps().map_err(|e| CameraError::Open {
            path: device_path.to_string(),
            reason: format!("query capabilities: {e}"),
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCaptureDevice(device_path.to_string()));
        }

        let (pixel_format, width, height) = negotiate(&device, width, height)?;
        tracing::info!(
            device = device_path,
            card = %caps.card,
            width,
            height,
            format = ?pixel_format,
            "camera ready"
        );

        Ok(Self {
            device,
            width,
            height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Capture a single frame (dark or not).
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream = self.stream()?;
        self.grab(&mut stream)
    }

    /// Capture up to `count` usable frames, skipping dark ones.
    ///
    /// Gives up after `count * 3` raw captures. Returns the usable frames and
    /// the number of dark frames skipped.
    pub fn capture_frames(&self, count: usize) -> Result<(Vec<Frame>, usize), CameraError> {
        let mut stream = self.stream()?;
        let mut frames = Vec::with_capacity(count);
        let mut dark = 0usize;

        for _ in 0..count * ATTEMPTS_PER_FRAME {
            if frames.len() == count {
                break;
            }
            let frame = self.grab(&mut stream)?;
            if frame.is_dark {
                dark += 1;
                tracing::debug!(seq = frame.sequence, "skipping dark frame");
            } else {
                frames.push(frame);
            }
        }

        Ok((frames, dark))
    }

    fn stream(&self) -> Result<MmapStream<'_>, CameraError> {
        MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::Capture(format!("mmap stream: {e}")))
    }

    fn grab(&self, stream: &mut MmapStream<'_>) -> Result<Frame, CameraError> {
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::Capture(format!("dequeue buffer: {e}")))?;
        let data = self
            .pixel_format
            .decode(buf, self.width, self.height)
            .map_err(|e| CameraError::Capture(format!("{:?} conversion: {e}", self.pixel_format)))?;
        let is_dark = frame::is_dark_frame(&data, DARK_FRAME_THRESHOLD);

        Ok(Frame {
            data,
            width: self.width,
            height: self.height,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
            is_dark,
        })
    }

    /// List V4L2 capture devices under /dev, sorted by path.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let Ok(entries) = std::fs::read_dir("/dev") else {
            return Vec::new();
        };
        let mut paths: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("video"))
            .map(|e| e.path().to_string_lossy().into_owned())
            .collect();
        paths.sort_by_key(|p| video_index(p));

        paths
            .into_iter()
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                        path,
                    })
            })
            .collect()
    }
}

/// Try each supported pixel format at the requested size; first one the
/// driver keeps wins.
fn negotiate(device: &Device, width: u32, height: u32) -> Result<(PixelFormat, u32, u32), CameraError> {
    let mut fmt = device
        .format()
        .map_err(|e| CameraError::Format(format!("get format: {e}")))?;

    for wanted in PixelFormat::PREFERENCE {
        fmt.fourcc = wanted.fourcc();
        fmt.width = width;
        fmt.height = height;
        let got = device
            .set_format(&fmt)
            .map_err(|e| CameraError::Format(format!("set {wanted:?}: {e}")))?;
        match PixelFormat::from_fourcc(got.fourcc) {
            Some(pf) => return Ok((pf, got.width, got.height)),
            None => tracing::debug!(wanted = ?wanted, got = ?got.fourcc, "format refused"),
        }
    }

    Err(CameraError::Format("driver offers neither YUYV nor MJPG".into()))
}

/// Numeric suffix of `/dev/videoN`, for natural ordering.
fn video_index(path: &str) -> u32 {
    path.rsplit("video")
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(u32::MAX)
}
