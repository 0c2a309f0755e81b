use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of every descriptor produced by the encoder.
pub const DESCRIPTOR_DIM: usize = 128;

/// Similarity (0–100) at or above which two faces are considered the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 50.0;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Length of the shorter side, in pixels of the preprocessed image.
    pub fn min_side(&self) -> f32 {
        self.width.min(self.height)
    }
}

/// Fixed-length face descriptor produced by the encoder.
///
/// Immutable once produced. Serializes as a bare array of floats so callers can
/// store it as an enrolled Face ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceDescriptor(Vec<f32>);

impl FaceDescriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Similarity to another descriptor on a 0–100 scale. See [`score`].
    pub fn similarity(&self, other: &FaceDescriptor) -> f32 {
        score(&self.0, &other.0)
    }
}

/// Cosine similarity scaled to a 0–100 match percentage.
///
/// Negative alignment is floored to 0. Mismatched lengths, empty input and
/// zero-norm vectors score 0; the result is never NaN.
pub fn score(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    // Accumulate in f64 so score(a, a) lands on 100 for 128-d inputs.
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
    clamp_similarity((cosine * 100.0) as f32)
}

/// Clamp a similarity into [0, 100], mapping NaN to 0.
pub fn clamp_similarity(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Which path produced a verification verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Descriptor extraction and cosine scoring.
    Model,
    /// External verifier process or its degraded heuristic. Reduced trust.
    Fallback,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Model => f.write_str("model"),
            Source::Fallback => f.write_str("fallback"),
        }
    }
}

/// The single authoritative answer of a verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub matched: bool,
    /// Match percentage, always within [0, 100].
    pub similarity: f32,
    pub source: Source,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerificationResult {
    /// Verdict from the descriptor path. `matched` is derived from the threshold.
    pub fn model(similarity: f32, threshold: f32) -> Self {
        let similarity = clamp_similarity(similarity);
        let matched = similarity >= threshold;
        let message = if matched {
            format!("Face verified ({similarity:.1}% similarity)")
        } else {
            format!("Face mismatch ({similarity:.1}% similarity)")
        };
        Self {
            matched,
            similarity,
            source: Source::Model,
            message,
            error: None,
        }
    }

    /// Verdict from the fallback path.
    ///
    /// `matched` is only kept when the clamped similarity also reaches the threshold.
    pub fn fallback(
        matched: bool,
        similarity: f32,
        threshold: f32,
        message: impl Into<String>,
        error: Option<String>,
    ) -> Self {
        let similarity = clamp_similarity(similarity);
        Self {
            matched: matched && similarity >= threshold,
            similarity,
            source: Source::Fallback,
            message: message.into(),
            error,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.source == Source::Fallback
    }
}
