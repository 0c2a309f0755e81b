//! Face alignment via 4-DOF similarity transform.
//!
//! Warps a detected face to a canonical 112×112 RGB crop using five reference
//! landmarks and a closed-form least-squares fit.

use image::{Rgb, RgbImage};

/// Reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Estimate the similarity transform (scale, rotation, translation) mapping
/// `src` onto `dst` in the least-squares sense.
///
/// Returns [a, -b, tx, b, a, ty] representing the matrix:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    let n = src.len() as f32;
    let mean = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };
    let (sx_m, sy_m) = mean(src);
    let (dx_m, dy_m) = mean(dst);

    let mut var = 0.0f32;
    let mut cos_term = 0.0f32;
    let mut sin_term = 0.0f32;
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (px, py) = (sx - sx_m, sy - sy_m);
        let (qx, qy) = (dx - dx_m, dy - dy_m);
        var += px * px + py * py;
        cos_term += px * qx + py * qy;
        sin_term += px * qy - py * qx;
    }

    if var < 1e-12 {
        // Degenerate landmarks: translate only.
        return [1.0, 0.0, dx_m - sx_m, 0.0, 1.0, dy_m - sy_m];
    }

    let a = cos_term / var;
    let b = sin_term / var;
    let tx = dx_m - (a * sx_m - b * sy_m);
    let ty = dy_m - (b * sx_m + a * sy_m);

    [a, -b, tx, b, a, ty]
}

/// Apply a 2×3 similarity warp with bilinear sampling.
///
/// Out-of-bounds samples are black.
fn warp_affine(image: &RgbImage, matrix: &[f32; 6], out_size: u32) -> RgbImage {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);

    let det = a * a + b * b;
    if det < 1e-12 {
        return RgbImage::new(out_size, out_size);
    }
    let ia = a / det;
    let ib = b / det;
    let (w, h) = (image.width() as i64, image.height() as i64);

    let sample = |x: i64, y: i64, c: usize| -> f32 {
        if x >= 0 && x < w && y >= 0 && y < h {
            image.get_pixel(x as u32, y as u32)[c] as f32
        } else {
            0.0
        }
    };

    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        // src = M_inv * (dst - t)
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let mut px = [0u8; 3];
        for (c, out) in px.iter_mut().enumerate() {
            let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            *out = val.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(px)
    })
}

/// Align a face to the canonical 112×112 crop given its five landmarks.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let matrix = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112);
    warp_affine(image, &matrix, ALIGNED_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let m = estimate_similarity_transform(&pts, &pts);
        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn test_scaled_transform() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!((m[0] - 0.5).abs() < 1e-3, "a = {}", m[0]);
        assert!(m[3].abs() < 1e-3, "b = {}", m[3]);
    }

    #[test]
    fn test_rotated_transform() {
        // Rotate the reference by 90°: (x, y) → (-y, x). Recovering it needs b ≈ -1.
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (-y, x));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!(m[0].abs() < 1e-3, "a = {}", m[0]);
        assert!((m[3] + 1.0).abs() < 1e-3, "b = {}", m[3]);
    }

    #[test]
    fn test_degenerate_landmarks() {
        let src = [(10.0, 10.0); 5];
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert_eq!(m[0], 1.0);
        assert_eq!(m[3], 0.0);
    }

    #[test]
    fn test_align_face_output_size() {
        let image = RgbImage::from_pixel(320, 240, Rgb([128, 128, 128]));
        let aligned = align_face(&image, &REFERENCE_LANDMARKS_112);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(aligned.get_pixel(56, 56), &Rgb([128, 128, 128]));
    }

    #[test]
    fn test_landmark_roundtrip() {
        // A bright patch at the left eye should land near the reference left eye.
        let mut image = RgbImage::new(200, 200);
        let src_landmarks: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for y in 58..63 {
            for x in 78..83 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }

        let aligned = align_face(&image, &src_landmarks);
        let ref_x = REFERENCE_LANDMARKS_112[0].0.round() as u32;
        let ref_y = REFERENCE_LANDMARKS_112[0].1.round() as u32;

        let max_val = (ref_y - 1..=ref_y + 1)
            .flat_map(|y| (ref_x - 1..=ref_x + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y)[0])
            .max()
            .unwrap_or(0);
        assert!(max_val > 100, "expected bright patch near ({ref_x}, {ref_y}), max={max_val}");
    }
}
