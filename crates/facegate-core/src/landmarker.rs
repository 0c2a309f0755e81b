//! 68-point facial landmark regressor via ONNX Runtime.
//!
//! Second stage of the extraction pipeline. Crops a square region around the
//! detected face, regresses 68 landmarks normalized to the crop, and reduces
//! them to the five alignment points the encoder expects.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const LANDMARK_INPUT_SIZE: u32 = 112;
const LANDMARK_POINTS: usize = 68;
/// The crop is this much larger than the detector box so the jaw line fits.
const LANDMARK_CROP_SCALE: f32 = 1.2;

// iBUG 68-point indices.
const LEFT_EYE: std::ops::RangeInclusive<usize> = 36..=41;
const RIGHT_EYE: std::ops::RangeInclusive<usize> = 42..=47;
const NOSE_TIP: usize = 30;
const MOUTH_LEFT: usize = 48;
const MOUTH_RIGHT: usize = 54;

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Square crop, in source-image pixels, fed to the landmark net.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Crop {
    x: u32,
    y: u32,
    side: u32,
}

pub struct FaceLandmarker {
    session: Session,
}

impl FaceLandmarker {
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, LandmarkError> {
        if !model_path.exists() {
            return Err(LandmarkError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded landmark model");

        Ok(Self { session })
    }

    /// Regress five alignment points for `face`, in image coordinates.
    pub fn locate(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<[(f32, f32); 5], LandmarkError> {
        let crop = crop_for(face, image.width(), image.height());
        let patch = imageops::crop_imm(image, crop.x, crop.y, crop.side, crop.side).to_image();
        let patch = imageops::resize(
            &patch,
            LANDMARK_INPUT_SIZE,
            LANDMARK_INPUT_SIZE,
            FilterType::Triangle,
        );
        let input = to_tensor(&patch);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LandmarkError::InferenceFailed(format!("landmark extraction: {e}")))?;

        if raw.len() < LANDMARK_POINTS * 2 {
            return Err(LandmarkError::InferenceFailed(format!(
                "expected {} landmark values, got {}",
                LANDMARK_POINTS * 2,
                raw.len()
            )));
        }

        let points: Vec<(f32, f32)> = raw[..LANDMARK_POINTS * 2]
            .chunks_exact(2)
            .map(|p| {
                (
                    crop.x as f32 + p[0] * crop.side as f32,
                    crop.y as f32 + p[1] * crop.side as f32,
                )
            })
            .collect();

        Ok(five_point(&points))
    }
}

/// Square crop centred on the face box, clipped to the image.
fn crop_for(face: &BoundingBox, width: u32, height: u32) -> Crop {
    let side = (face.width.max(face.height) * LANDMARK_CROP_SCALE)
        .round()
        .clamp(1.0, width.min(height).max(1) as f32) as u32;
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;

    let max_x = width.saturating_sub(side) as f32;
    let max_y = height.saturating_sub(side) as f32;
    let x = (cx - side as f32 / 2.0).round().clamp(0.0, max_x) as u32;
    let y = (cy - side as f32 / 2.0).round().clamp(0.0, max_y) as u32;

    Crop { x, y, side }
}

/// NCHW tensor scaled to [0, 1].
fn to_tensor(patch: &RgbImage) -> Array4<f32> {
    let size = LANDMARK_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in patch.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}

/// Reduce 68 landmarks to [left_eye, right_eye, nose, left_mouth, right_mouth].
fn five_point(points: &[(f32, f32)]) -> [(f32, f32); 5] {
    let centroid = |range: std::ops::RangeInclusive<usize>| {
        let n = (range.end() - range.start() + 1) as f32;
        let (sx, sy) = points[range]
            .iter()
            .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };

    [
        centroid(LEFT_EYE),
        centroid(RIGHT_EYE),
        points[NOSE_TIP],
        points[MOUTH_LEFT],
        points[MOUTH_RIGHT],
    ]
}
