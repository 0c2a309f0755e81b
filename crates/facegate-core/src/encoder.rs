//! 128-d face encoder (MobileFaceNet) via ONNX Runtime.
//!
//! Final stage of the extraction pipeline: turns an aligned 112×112 face crop
//! into an L2-normalized descriptor.

use crate::alignment::ALIGNED_SIZE;
use crate::types::{FaceDescriptor, DESCRIPTOR_DIM};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ENCODER_MEAN: f32 = 127.5;
const ENCODER_STD: f32 = 128.0;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceEncoder {
    session: Session,
}

impl FaceEncoder {
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, EncoderError> {
        if !model_path.exists() {
            return Err(EncoderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded face encoder model"
        );

        Ok(Self { session })
    }

    /// Encode an aligned face crop into a unit-length descriptor.
    pub fn encode(&mut self, aligned: &RgbImage) -> Result<FaceDescriptor, EncoderError> {
        if aligned.dimensions() != (ALIGNED_SIZE, ALIGNED_SIZE) {
            return Err(EncoderError::InferenceFailed(format!(
                "encoder expects {ALIGNED_SIZE}x{ALIGNED_SIZE} input, got {}x{}",
                aligned.width(),
                aligned.height()
            )));
        }

        let input = to_tensor(aligned);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("descriptor extraction: {e}")))?;

        if raw.len() != DESCRIPTOR_DIM {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {DESCRIPTOR_DIM}-dim descriptor, got {}",
                raw.len()
            )));
        }

        Ok(FaceDescriptor::new(l2_normalize(raw.to_vec())))
    }
}

/// NCHW float tensor with symmetric normalization.
fn to_tensor(aligned: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ENCODER_MEAN) / ENCODER_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}
