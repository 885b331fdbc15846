//! Face alignment to the canonical ArcFace crop.
//!
//! The five detected landmarks are mapped onto the InsightFace reference
//! positions with a least-squares similarity transform (uniform scale,
//! rotation, translation), then the face is resampled into a 112×112 RGB crop.

use crate::RGB_CHANNELS;

/// Side length of the aligned crop fed to the recognizer.
pub const ALIGNED_SIZE: usize = 112;

/// InsightFace reference landmarks for a 112×112 crop:
/// left eye, right eye, nose tip, left mouth corner, right mouth corner.
const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// `p ↦ [a -b; b a]·p + t`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit of `src` onto `dst`.
    ///
    /// Points that all coincide carry no scale or rotation; the fit then
    /// degrades to a pure translation between the centroids.
    fn estimate(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Self {
        let n = src.len().min(dst.len()).max(1) as f32;
        let centroid = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (scx, scy) = centroid(src);
        let (dcx, dcy) = centroid(dst);

        let (mut dot, mut cross, mut spread) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            let (sx, sy) = (sx - scx, sy - scy);
            let (dx, dy) = (dx - dcx, dy - dcy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            spread += sx * sx + sy * sy;
        }

        let (a, b) = if spread < 1e-9 {
            (1.0, 0.0)
        } else {
            (dot / spread, cross / spread)
        };

        Self {
            a,
            b,
            tx: dcx - (a * scx - b * scy),
            ty: dcy - (b * scx + a * scy),
        }
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// `None` when the transform collapses the plane (zero scale).
    fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Bilinear sample of one channel; outside the frame reads as black.
fn bilinear(frame: &[u8], width: usize, height: usize, (x, y): (f32, f32), channel: usize) -> f32 {
    let pixel = |px: i64, py: i64| -> f32 {
        if px < 0 || py < 0 || px >= width as i64 || py >= height as i64 {
            return 0.0;
        }
        frame[(py as usize * width + px as usize) * RGB_CHANNELS + channel] as f32
    };

    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);

    let top = pixel(x0, y0) * (1.0 - fx) + pixel(x0 + 1, y0) * fx;
    let bottom = pixel(x0, y0 + 1) * (1.0 - fx) + pixel(x0 + 1, y0 + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Resample `frame` into an `out_size`² crop where crop pixel `p` comes from
/// `to_crop⁻¹(p)` in the frame.
fn warp_rgb(frame: &[u8], width: usize, height: usize, to_crop: &Similarity, out_size: usize) -> Vec<u8> {
    let mut crop = vec![0u8; out_size * out_size * RGB_CHANNELS];
    let Some(to_frame) = to_crop.inverse() else {
        return crop;
    };

    for (i, px) in crop.chunks_exact_mut(RGB_CHANNELS).enumerate() {
        let src = to_frame.apply(((i % out_size) as f32, (i / out_size) as f32));
        for (c, v) in px.iter_mut().enumerate() {
            *v = bilinear(frame, width, height, src, c).round().clamp(0.0, 255.0) as u8;
        }
    }
    crop
}

/// Align a detected face to the canonical 112×112 RGB crop.
pub fn align_face(frame: &[u8], width: u32, height: u32, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let to_crop = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS);
    warp_rgb(frame, width as usize, height as usize, &to_crop, ALIGNED_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32), tol: f32) -> bool {
        (a.0 - b.0).abs() < tol && (a.1 - b.1).abs() < tol
    }

    #[test]
    fn test_estimate_identity() {
        let t = Similarity::estimate(&REFERENCE_LANDMARKS, &REFERENCE_LANDMARKS);
        assert!((t.a - 1.0).abs() < 1e-5 && t.b.abs() < 1e-5);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_estimate_scale_and_shift() {
        let src = REFERENCE_LANDMARKS.map(|(x, y)| (x * 2.0 + 30.0, y * 2.0 - 10.0));
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS);
        assert!((t.a - 0.5).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4);
        for (s, d) in src.iter().zip(REFERENCE_LANDMARKS) {
            assert!(close(t.apply(*s), d, 1e-2));
        }
    }

    #[test]
    fn test_estimate_rotation() {
        // 90° counter-clockwise: (x, y) -> (-y, x)
        let dst = REFERENCE_LANDMARKS.map(|(x, y)| (-y, x));
        let t = Similarity::estimate(&REFERENCE_LANDMARKS, &dst);
        assert!(t.a.abs() < 1e-4 && (t.b - 1.0).abs() < 1e-4, "a = {}, b = {}", t.a, t.b);
    }

    #[test]
    fn test_coincident_landmarks_translate_only() {
        let src = [(10.0f32, 10.0f32); 5];
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS);
        assert_eq!((t.a, t.b), (1.0, 0.0));
        assert!([t.tx, t.ty].iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = Similarity { a: 0.8, b: -0.3, tx: 12.0, ty: -4.0 };
        let inv = t.inverse().unwrap();
        let p = (37.0, 81.5);
        assert!(close(inv.apply(t.apply(p)), p, 1e-3));

        let collapsed = Similarity { a: 0.0, b: 0.0, tx: 1.0, ty: 1.0 };
        assert!(collapsed.inverse().is_none());
    }

    #[test]
    fn test_align_face_output_size() {
        let frame = vec![128u8; 640 * 480 * RGB_CHANNELS];
        let aligned = align_face(&frame, 640, 480, &REFERENCE_LANDMARKS);
        assert_eq!(aligned.len(), ALIGNED_SIZE * ALIGNED_SIZE * RGB_CHANNELS);
        let centre = (56 * ALIGNED_SIZE + 56) * RGB_CHANNELS;
        assert_eq!(aligned[centre], 128);
    }

    #[test]
    fn test_warp_keeps_channel_order() {
        let (w, h) = (120usize, 120usize);
        let frame: Vec<u8> = std::iter::repeat([255u8, 0, 0]).take(w * h).flatten().collect();
        let identity = Similarity { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };
        let out = warp_rgb(&frame, w, h, &identity, ALIGNED_SIZE);
        let centre = (56 * ALIGNED_SIZE + 56) * RGB_CHANNELS;
        assert_eq!(&out[centre..centre + 3], &[255, 0, 0]);
    }

    #[test]
    fn test_outside_frame_is_black() {
        let frame = vec![200u8; 10 * 10 * RGB_CHANNELS];
        let shifted = Similarity { a: 1.0, b: 0.0, tx: 50.0, ty: 50.0 };
        let out = warp_rgb(&frame, 10, 10, &shifted, 20);
        assert!(out.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_left_eye_lands_on_reference() {
        let (w, h) = (200usize, 200usize);
        let mut frame = vec![0u8; w * h * RGB_CHANNELS];
        let landmarks: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        let (lx, ly) = (landmarks[0].0 as usize, landmarks[0].1 as usize);
        for py in ly - 2..=ly + 2 {
            for px in lx - 2..=lx + 2 {
                let i = (py * w + px) * RGB_CHANNELS;
                frame[i..i + 3].copy_from_slice(&[255, 255, 255]);
            }
        }

        let aligned = align_face(&frame, w as u32, h as u32, &landmarks);
        let (rx, ry) = (
            REFERENCE_LANDMARKS[0].0.round() as usize,
            REFERENCE_LANDMARKS[0].1.round() as usize,
        );
        let brightest = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (y, x)))
            .map(|(y, x)| aligned[(y * ALIGNED_SIZE + x) * RGB_CHANNELS])
            .max()
            .unwrap_or(0);
        assert!(brightest > 100, "left eye patch not near ({rx}, {ry}): max {brightest}");
    }
}
