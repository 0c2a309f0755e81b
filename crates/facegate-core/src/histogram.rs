//! Colour-histogram comparison used by the external fallback verifier.
//!
//! This is an appearance heuristic, not a biometric: it compares the 8×8×8 RGB
//! histograms of two images with Pearson correlation.

use image::RgbImage;

const BINS_PER_CHANNEL: usize = 8;
const BIN_WIDTH: usize = 256 / BINS_PER_CHANNEL;
const TOTAL_BINS: usize = BINS_PER_CHANNEL * BINS_PER_CHANNEL * BINS_PER_CHANNEL;

/// L2-normalized joint RGB histogram.
pub fn rgb_histogram(image: &RgbImage) -> Vec<f32> {
    let mut hist = vec![0.0f32; TOTAL_BINS];
    for pixel in image.pixels() {
        let [r, g, b] = pixel.0.map(|v| v as usize / BIN_WIDTH);
        hist[(r * BINS_PER_CHANNEL + g) * BINS_PER_CHANNEL + b] += 1.0;
    }

    let norm = hist.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        hist.iter_mut().for_each(|v| *v /= norm);
    }
    hist
}

/// Pearson correlation of two histograms, in [-1, 1]. Flat inputs give 0.
pub fn correlation(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let n = a.len() as f64;
    let mean_a = a.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean_b = b.iter().map(|&v| v as f64).sum::<f64>() / n;

    let mut cov = 0.0f64;
    let mut var_a = 0.0f64;
    let mut var_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (dx, dy) = (x as f64 - mean_a, y as f64 - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    let denom = (var_a * var_b).sqrt();
    if denom > 0.0 {
        (cov / denom) as f32
    } else {
        0.0
    }
}

/// Histogram correlation of two images scaled to a 0–100 similarity.
pub fn histogram_similarity(a: &RgbImage, b: &RgbImage) -> f32 {
    let c = correlation(&rgb_histogram(a), &rgb_histogram(b));
    crate::types::clamp_similarity(c * 100.0)
}
