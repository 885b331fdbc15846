//! Frame type and pixel conversions — YUYV/MJPG to RGB, luma, dark detection.

use image::RgbImage;

/// Luma below this value counts as a dark pixel.
const DARK_PIXEL_LUMA: u8 = 32;

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB8 pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap a decoded still image (an uploaded photo) as a frame.
    pub fn from_rgb_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        let data = image.into_raw();
        let is_dark = is_dark_frame(&data, 0.95);
        Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence: 0,
            is_dark,
        }
    }

    /// Copy the frame into an [`RgbImage`], e.g. to save it as a reference photo.
    pub fn to_rgb_image(&self) -> Result<RgbImage, FrameError> {
        RgbImage::from_raw(self.width, self.height, self.data.clone()).ok_or(FrameError::InvalidLength {
            expected: (self.width * self.height * 3) as usize,
            actual: self.data.len(),
        })
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let mut sum = 0.0f32;
        let mut n = 0usize;
        for px in self.data.chunks_exact(3) {
            sum += luma(px[0], px[1], px[2]) as f32;
            n += 1;
        }
        if n == 0 { 0.0 } else { sum / n as f32 }
    }
}

/// BT.601 luma of an RGB pixel.
pub fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000) as u8
}

/// Convert packed YUYV (4:2:2) to packed RGB8 using BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            let c = 1.164 * (y as f32 - 16.0);
            rgb.push((c + 1.596 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((c - 0.392 * u - 0.813 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((c + 2.017 * u).round().clamp(0.0, 255.0) as u8);
        }
    }
    Ok(rgb)
}

/// Decode a Motion-JPEG buffer into packed RGB8 of the expected dimensions.
pub fn mjpeg_to_rgb(jpeg: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let decoded = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| FrameError::Decode(e.to_string()))?
        .to_rgb8();
    if decoded.dimensions() != (width, height) {
        return Err(FrameError::DimensionMismatch {
            expected: (width, height),
            actual: decoded.dimensions(),
        });
    }
    Ok(decoded.into_raw())
}

/// Check if an RGB frame is dark: more than `threshold_pct` of pixels have luma < 32.
pub fn is_dark_frame(rgb: &[u8], threshold_pct: f32) -> bool {
    let total = rgb.len() / 3;
    if total == 0 {
        return true;
    }
    let dark_count = rgb
        .chunks_exact(3)
        .filter(|px| luma(px[0], px[1], px[2]) < DARK_PIXEL_LUMA)
        .count();
    (dark_count as f32 / total as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("MJPG decode failed: {0}")]
    Decode(String),
    #[error("decoded frame is {actual:?}, negotiated {expected:?}")]
    DimensionMismatch { expected: (u32, u32), actual: (u32, u32) },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_rgb_grey_pixels() {
        // Neutral chroma: Y=16 is black, Y=235 is white.
        let yuyv = vec![16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn test_yuyv_to_rgb_length() {
        let yuyv = vec![128u8; 4 * 2 * 2];
        let rgb = yuyv_to_rgb(&yuyv, 4, 2).unwrap();
        assert_eq!(rgb.len(), 4 * 2 * 3);
    }

    #[test]
    fn test_yuyv_to_rgb_red_chroma() {
        // Strong V pushes red up and green down.
        let rgb = yuyv_to_rgb(&[82, 90, 82, 240], 2, 1).unwrap();
        assert!(rgb[0] > 200, "r = {}", rgb[0]);
        assert!(rgb[1] < 60, "g = {}", rgb[1]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_rgb(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_luma_weights() {
        assert_eq!(luma(0, 0, 0), 0);
        assert_eq!(luma(255, 255, 255), 255);
        assert!(luma(0, 255, 0) > luma(255, 0, 0));
        assert!(luma(255, 0, 0) > luma(0, 0, 255));
    }

    #[test]
    fn test_dark_frame_all_black() {
        assert!(is_dark_frame(&[0u8; 300], 0.95));
    }

    #[test]
    fn test_dark_frame_normal() {
        assert!(!is_dark_frame(&[128u8; 300], 0.95));
    }

    #[test]
    fn test_dark_frame_empty() {
        assert!(is_dark_frame(&[], 0.95));
    }

    #[test]
    fn test_dark_frame_borderline() {
        // 96% dark → dark; 94% dark → not dark
        let mut mostly = vec![10u8; 96 * 3];
        mostly.extend(vec![128u8; 4 * 3]);
        assert!(is_dark_frame(&mostly, 0.95));

        let mut some = vec![10u8; 94 * 3];
        some.extend(vec![128u8; 6 * 3]);
        assert!(!is_dark_frame(&some, 0.95));
    }

    #[test]
    fn test_from_rgb_image_roundtrip_dimensions() {
        let img = RgbImage::from_pixel(8, 4, image::Rgb([200, 180, 160]));
        let frame = Frame::from_rgb_image(img);
        assert_eq!((frame.width, frame.height), (8, 4));
        assert_eq!(frame.data.len(), 8 * 4 * 3);
        assert!(!frame.is_dark);
        assert_eq!(frame.to_rgb_image().unwrap().dimensions(), (8, 4));
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame::from_rgb_image(RgbImage::from_pixel(2, 2, image::Rgb([100, 100, 100])));
        assert!((frame.avg_brightness() - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_mjpeg_rejects_garbage() {
        assert!(matches!(mjpeg_to_rgb(&[0, 1, 2, 3], 2, 2), Err(FrameError::Decode(_))));
    }
}
