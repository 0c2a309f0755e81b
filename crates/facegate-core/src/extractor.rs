//! Descriptor extraction: detect → gate → landmark → align → encode.
//!
//! The ONNX-backed pipeline lives in [`crate::models::FaceModels`]; anything
//! implementing [`FacePipeline`] can be driven through [`extract`], which owns
//! the confidence and face-size gates.

use crate::types::{BoundingBox, FaceDescriptor};
use image::RgbImage;
use thiserror::Error;

/// Detector confidence below which a capture is rejected as unreliable.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.4;
/// Shorter face-box side, in preprocessed pixels, below which a face is too small.
pub const DEFAULT_MIN_FACE_SIZE: f32 = 40.0;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no face detected; make sure the face is clearly visible, well lit and facing the camera")]
    NotFound,
    #[error(
        "face too unclear ({:.0}% detector confidence); ensure good lighting, look at the camera and avoid blur",
        .confidence * 100.0
    )]
    AntiSpoofRejected { confidence: f32 },
    #[error("face too small in frame ({size:.0}px); move closer to the camera")]
    FaceTooSmall { size: f32 },
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Thresholds applied between detection and encoding.
#[derive(Debug, Clone, Copy)]
pub struct Gate {
    pub min_confidence: f32,
    pub min_face_size: f32,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
        }
    }
}

impl Gate {
    /// Coarse capture-quality check. Not a liveness test.
    pub fn check(&self, face: &BoundingBox) -> Result<(), ExtractError> {
        tracing::debug!(
            confidence = face.confidence,
            size = face.min_side(),
            "face detection score"
        );
        if face.confidence < self.min_confidence {
            return Err(ExtractError::AntiSpoofRejected {
                confidence: face.confidence,
            });
        }
        if face.min_side() < self.min_face_size {
            return Err(ExtractError::FaceTooSmall {
                size: face.min_side(),
            });
        }
        Ok(())
    }
}

/// A detect-then-describe face model.
pub trait FacePipeline: Send {
    /// Most confident face in `image`, if any.
    fn detect(&mut self, image: &RgbImage) -> Result<Option<BoundingBox>, ExtractError>;

    /// Descriptor for a face previously returned by [`detect`](Self::detect).
    fn describe(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<FaceDescriptor, ExtractError>;
}

/// Extract a gated descriptor from a preprocessed image.
pub fn extract<P: FacePipeline + ?Sized>(
    pipeline: &mut P,
    image: &RgbImage,
    gate: &Gate,
) -> Result<FaceDescriptor, ExtractError> {
    let face = pipeline.detect(image)?.ok_or(ExtractError::NotFound)?;
    gate.check(&face)?;
    pipeline.describe(image, &face)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        face: Option<BoundingBox>,
        described: usize,
    }

    impl FacePipeline for Scripted {
        fn detect(&mut self, _image: &RgbImage) -> Result<Option<BoundingBox>, ExtractError> {
            Ok(self.face.clone())
        }

        fn describe(&mut self, _image: &RgbImage, _face: &BoundingBox) -> Result<FaceDescriptor, ExtractError> {
            self.described += 1;
            Ok(FaceDescriptor::new(vec![1.0; 128]))
        }
    }

    fn face(confidence: f32, size: f32) -> BoundingBox {
        BoundingBox { x: 0.0, y: 0.0, width: size, height: size * 1.2, confidence, landmarks: None }
    }

    #[test]
    fn test_extract_no_face() {
        let mut p = Scripted { face: None, described: 0 };
        let err = extract(&mut p, &RgbImage::new(8, 8), &Gate::default()).unwrap_err();
        assert!(matches!(err, ExtractError::NotFound));
        assert_eq!(p.described, 0);
    }

    #[test]
    fn test_extract_low_confidence_rejected_with_percentage() {
        let mut p = Scripted { face: Some(face(0.37, 100.0)), described: 0 };
        let err = extract(&mut p, &RgbImage::new(8, 8), &Gate::default()).unwrap_err();
        assert!(matches!(err, ExtractError::AntiSpoofRejected { .. }));
        assert!(err.to_string().contains("37%"), "message: {err}");
        assert_eq!(p.described, 0, "gate must run before encoding");
    }

    #[test]
    fn test_extract_confidence_at_threshold_passes() {
        let mut p = Scripted { face: Some(face(0.4, 100.0)), described: 0 };
        assert!(extract(&mut p, &RgbImage::new(8, 8), &Gate::default()).is_ok());
    }

    #[test]
    fn test_extract_small_face_rejected() {
        let mut p = Scripted { face: Some(face(0.9, 30.0)), described: 0 };
        let err = extract(&mut p, &RgbImage::new(8, 8), &Gate::default()).unwrap_err();
        assert!(matches!(err, ExtractError::FaceTooSmall { .. }));
        assert!(err.to_string().contains("30px"));
    }

    #[test]
    fn test_extract_success() {
        let mut p = Scripted { face: Some(face(0.95, 120.0)), described: 0 };
        let d = extract(&mut p, &RgbImage::new(8, 8), &Gate::default()).unwrap();
        assert_eq!(d.len(), 128);
        assert_eq!(p.described, 1);
    }
}
