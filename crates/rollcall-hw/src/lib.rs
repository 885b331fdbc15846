//! rollcall-hw — Camera capture for attendance snapshots.
//!
//! Provides V4L2-based camera access producing packed RGB8 frames, plus the
//! pixel-format conversions and dark-frame filtering used during capture.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
