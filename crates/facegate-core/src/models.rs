//! The three ONNX weight sets and the pipeline built on them.

use crate::alignment;
use crate::detector::{DetectorError, FaceDetector};
use crate::encoder::{EncoderError, FaceEncoder};
use crate::extractor::{ExtractError, FacePipeline};
use crate::landmarker::{FaceLandmarker, LandmarkError};
use crate::types::{BoundingBox, FaceDescriptor};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "scrfd_500m.onnx";
pub const LANDMARK_MODEL_FILE: &str = "landmark_68.onnx";
pub const ENCODER_MODEL_FILE: &str = "mobilefacenet_128.onnx";

/// Fixed location the weights are read from unless configured otherwise.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/facegate/models")
}

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("model weights missing: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("failed to load {stage} model: {reason}")]
    Session { stage: &'static str, reason: String },
    #[error("model loader aborted: {0}")]
    Aborted(String),
}

/// Locations of the detector, landmark and encoder weights.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub landmarker: PathBuf,
    pub encoder: PathBuf,
}

impl ModelPaths {
    /// Standard file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(DETECTOR_MODEL_FILE),
            landmarker: dir.join(LANDMARK_MODEL_FILE),
            encoder: dir.join(ENCODER_MODEL_FILE),
        }
    }

    /// First weight file that does not exist, if any.
    pub fn first_missing(&self) -> Option<&Path> {
        [&self.detector, &self.landmarker, &self.encoder]
            .into_iter()
            .find(|p| !p.exists())
            .map(PathBuf::as_path)
    }
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self::in_dir(&default_model_dir())
    }
}

/// Loaded detector, landmark and encoder sessions.
pub struct FaceModels {
    detector: FaceDetector,
    landmarker: FaceLandmarker,
    encoder: FaceEncoder,
}

impl FaceModels {
    /// Load all three weight sets. Fails before creating any session if a file is missing.
    pub fn load(paths: &ModelPaths, intra_threads: usize) -> Result<Self, ModelLoadError> {
        if let Some(missing) = paths.first_missing() {
            return Err(ModelLoadError::MissingFile(missing.to_path_buf()));
        }

        let detector = FaceDetector::load(&paths.detector, intra_threads).map_err(|e| {
            ModelLoadError::Session { stage: "detector", reason: e.to_string() }
        })?;
        let landmarker = FaceLandmarker::load(&paths.landmarker, intra_threads).map_err(|e| {
            ModelLoadError::Session { stage: "landmark", reason: e.to_string() }
        })?;
        let encoder = FaceEncoder::load(&paths.encoder, intra_threads).map_err(|e| {
            ModelLoadError::Session { stage: "encoder", reason: e.to_string() }
        })?;

        Ok(Self { detector, landmarker, encoder })
    }
}

impl FacePipeline for FaceModels {
    fn detect(&mut self, image: &RgbImage) -> Result<Option<BoundingBox>, ExtractError> {
        self.detector.detect_best(image).map_err(ExtractError::from)
    }

    fn describe(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<FaceDescriptor, ExtractError> {
        let landmarks = match self.landmarker.locate(image, face) {
            Ok(points) => points,
            Err(err) => {
                // The detector's own keypoints are coarser but usable.
                let coarse = face.landmarks.ok_or(ExtractError::from(err))?;
                tracing::debug!("landmark net failed; aligning on detector keypoints");
                coarse
            }
        };
        let aligned = alignment::align_face(image, &landmarks);
        Ok(self.encoder.encode(&aligned)?)
    }
}

impl From<DetectorError> for ExtractError {
    fn from(err: DetectorError) -> Self {
        ExtractError::Inference(format!("detector: {err}"))
    }
}

impl From<LandmarkError> for ExtractError {
    fn from(err: LandmarkError) -> Self {
        ExtractError::Inference(format!("landmarks: {err}"))
    }
}

impl From<EncoderError> for ExtractError {
    fn from(err: EncoderError) -> Self {
        ExtractError::Inference(format!("encoder: {err}"))
    }
}
